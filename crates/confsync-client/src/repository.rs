//! Per-namespace remote repository.
//!
//! A repository owns the current [`ConfigSnapshot`] for one namespace and
//! keeps it synchronized with the config service: an initial fetch at
//! startup, wakes from the long-poll notifier, and a periodic fallback
//! refresh. Fetches are conditional on the release key, so an unchanged
//! namespace costs a 304. Publications are atomic reference swaps; readers
//! never block a running `sync()` and never observe a torn snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use confsync_common::backoff::BackoffSchedule;
use confsync_common::protocol::{
    ConfigPayload, ConfsyncError, NotificationMessages, Result,
};
use confsync_common::rate_limit::RateLimiter;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use reqwest::{StatusCode, Url};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::SnapshotStore;
use crate::changes::{diff_configurations, spawn_dispatcher, ConfigChangeListener, DispatchJob};
use crate::locator::ServiceLocator;
use crate::notifier::LongPollNotifier;
use crate::settings::ClientSettings;
use crate::snapshot::ConfigSnapshot;

/// How long a fetch waits on the rate-limit gate before pacing itself.
const RATE_LIMIT_WAIT: Duration = Duration::from_secs(5);

enum FetchOutcome {
    Payload(ConfigPayload),
    NotModified,
}

/// Remote repository for one namespace.
pub struct RemoteConfigRepository {
    namespace: String,
    settings: Arc<ClientSettings>,
    http: reqwest::Client,
    locator: Arc<ServiceLocator>,
    rate_limiter: Arc<RateLimiter>,
    store: Option<SnapshotStore>,
    /// Current snapshot; single writer (`sync`), many readers.
    snapshot: RwLock<Option<Arc<ConfigSnapshot>>>,
    /// Serializes `sync()` invocations and owns the fetch backoff state.
    sync_gate: AsyncMutex<BackoffSchedule>,
    /// Endpoint hint from the last long-poll response, consumed once.
    preferred_endpoint: Mutex<Option<String>>,
    /// Latest notification messages delivered to this repository.
    last_messages: Mutex<Option<NotificationMessages>>,
    /// Set by a long-poll wake to bypass 304 caching on the next fetch.
    force_refresh: AtomicBool,
    listeners: Mutex<Vec<Arc<dyn ConfigChangeListener>>>,
    /// Queue feeding the single dispatcher task; preserves publication order.
    dispatch_tx: tokio::sync::mpsc::UnboundedSender<DispatchJob>,
    notifier: Mutex<Option<Weak<LongPollNotifier>>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl RemoteConfigRepository {
    pub(crate) fn new(
        namespace: impl Into<String>,
        settings: Arc<ClientSettings>,
        locator: Arc<ServiceLocator>,
        rate_limiter: Arc<RateLimiter>,
        store: Option<SnapshotStore>,
        http: reqwest::Client,
    ) -> Arc<Self> {
        let backoff = BackoffSchedule::new(
            settings.on_error_retry_interval,
            settings.fetch_backoff_max,
        );
        Arc::new(Self {
            namespace: namespace.into(),
            settings,
            http,
            locator,
            rate_limiter,
            store,
            snapshot: RwLock::new(None),
            sync_gate: AsyncMutex::new(backoff),
            preferred_endpoint: Mutex::new(None),
            last_messages: Mutex::new(None),
            force_refresh: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            dispatch_tx: spawn_dispatcher(),
            notifier: Mutex::new(None),
            refresh_task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Fetches once, registers with the notifier and arms the periodic
    /// refresh timer.
    ///
    /// Registration and the timer are armed even when the first fetch fails,
    /// so a recovering config service is picked up later; the failure is
    /// still reported so the caller can decide whether to fall back to the
    /// on-disk snapshot.
    pub async fn start(self: &Arc<Self>, notifier: &Arc<LongPollNotifier>) -> Result<()> {
        let initial = self.sync().await;

        *self.notifier.lock() = Some(Arc::downgrade(notifier));
        notifier.register(&self.namespace, self);
        self.spawn_periodic_refresh();

        initial.map_err(|err| ConfsyncError::InitialLoadFailed {
            namespace: self.namespace.clone(),
            reason: err.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Non-blocking read of the current snapshot.
    pub fn get_config(&self) -> Option<Arc<ConfigSnapshot>> {
        self.snapshot.read().clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConfigChangeListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ConfigChangeListener>) {
        self.listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Invoked by the notifier when the long poll reported a change for this
    /// namespace. Stores the endpoint hint and message bundle, flags a forced
    /// refresh and submits an asynchronous `sync()`.
    pub(crate) fn on_long_poll_notified(
        self: &Arc<Self>,
        endpoint: String,
        messages: Option<NotificationMessages>,
    ) {
        *self.preferred_endpoint.lock() = Some(endpoint);
        if let Some(incoming) = messages {
            let mut last = self.last_messages.lock();
            match last.as_mut() {
                Some(existing) => existing.merge(&incoming),
                None => *last = Some(incoming),
            }
        }
        self.force_refresh.store(true, Ordering::SeqCst);

        let repository = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = repository.sync().await {
                debug!(
                    namespace = %repository.namespace,
                    error = %err,
                    "notified sync failed, periodic refresh will retry"
                );
            }
        });
    }

    /// Synchronizes the local snapshot with the config service.
    ///
    /// Serialized per repository: concurrent callers queue on the internal
    /// gate, so successive publications are observed in order. On failure
    /// the previous snapshot stays intact and listeners receive an error
    /// event instead of a change event.
    pub async fn sync(&self) -> Result<()> {
        let mut backoff = self.sync_gate.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        let previous = self.get_config();
        match self.load_remote(previous.as_ref(), &mut backoff).await {
            Ok(next) => {
                backoff.on_success();
                self.force_refresh.store(false, Ordering::SeqCst);

                let changed = previous
                    .as_ref()
                    .map(|p| !p.same_release(&next))
                    .unwrap_or(true);
                if changed {
                    let next = Arc::new(next);
                    *self.snapshot.write() = Some(Arc::clone(&next));
                    info!(
                        namespace = %self.namespace,
                        release_key = %next.release_key,
                        "published configuration snapshot"
                    );
                    self.persist(Arc::clone(&next));

                    if let Some(previous) = previous {
                        let event = diff_configurations(
                            &self.namespace,
                            &previous.configurations,
                            &next.configurations,
                        );
                        if !event.is_empty() {
                            let _ = self
                                .dispatch_tx
                                .send(DispatchJob::Change(self.listeners.lock().clone(), event));
                        }
                    }
                }
                Ok(())
            }
            Err(err) => {
                warn!(
                    namespace = %self.namespace,
                    error = %err,
                    "sync failed, keeping previous snapshot"
                );
                let reason = err.to_string();
                let _ = self.dispatch_tx.send(DispatchJob::SyncError(
                    self.listeners.lock().clone(),
                    self.namespace.clone(),
                    err,
                ));
                Err(ConfsyncError::LoadFailed {
                    namespace: self.namespace.clone(),
                    reason,
                })
            }
        }
    }

    async fn load_remote(
        &self,
        previous: Option<&Arc<ConfigSnapshot>>,
        backoff: &mut BackoffSchedule,
    ) -> Result<ConfigSnapshot> {
        let force_refresh = self.force_refresh.load(Ordering::SeqCst);
        let attempts = if force_refresh { 2 } else { 1 };
        let mut last_error: Option<ConfsyncError> = None;

        for attempt in 0..attempts {
            let services = self.locator.config_services().await?;
            let mut endpoints: Vec<String> =
                services.into_iter().map(|s| s.homepage_url).collect();
            endpoints.shuffle(&mut rand::thread_rng());
            if let Some(hint) = self.preferred_endpoint.lock().take() {
                endpoints.retain(|e| e != &hint);
                endpoints.insert(0, hint);
            }

            let endpoint_count = endpoints.len();
            for (index, endpoint) in endpoints.into_iter().enumerate() {
                if !self.rate_limiter.try_acquire(RATE_LIMIT_WAIT).await {
                    // gate timed out; pace ourselves but never drop the fetch
                    tokio::time::sleep(self.settings.on_error_retry_interval).await;
                }

                let messages = self.last_messages.lock().clone();
                let url = assemble_config_url(
                    &endpoint,
                    &self.settings,
                    &self.namespace,
                    previous.map(|p| p.release_key.as_str()),
                    messages.as_ref(),
                )?;
                debug!(url = %url, "loading configuration");

                match self.fetch_once(url).await {
                    Ok(FetchOutcome::Payload(payload)) => {
                        return Ok(ConfigSnapshot::from_payload(payload, messages));
                    }
                    Ok(FetchOutcome::NotModified) => match previous {
                        Some(_) if force_refresh && attempt + 1 < attempts => {
                            // a notification said a change exists, but this
                            // instance still answers 304 (replication lag);
                            // pause and try one more round
                            debug!(
                                namespace = %self.namespace,
                                "not modified despite pending notification"
                            );
                            tokio::time::sleep(self.settings.on_error_retry_interval).await;
                            break;
                        }
                        Some(prev) => return Ok(prev.as_ref().clone()),
                        None => {
                            last_error = Some(ConfsyncError::Transport(
                                "config service answered 304 but no local snapshot exists"
                                    .to_string(),
                            ));
                        }
                    },
                    Err(err) => {
                        warn!(
                            namespace = %self.namespace,
                            endpoint = %endpoint,
                            error = %err,
                            "config fetch attempt failed"
                        );
                        last_error = Some(err);
                    }
                }

                // pace before the next endpoint: fixed while a wake is
                // pending, exponential otherwise
                let is_last = attempt + 1 == attempts && index + 1 == endpoint_count;
                if !is_last {
                    let delay = if force_refresh {
                        self.settings.on_error_retry_interval
                    } else {
                        backoff.next_delay()
                    };
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ConfsyncError::LoadFailed {
            namespace: self.namespace.clone(),
            reason: "all config service endpoints exhausted".to_string(),
        }))
    }

    async fn fetch_once(&self, url: Url) -> Result<FetchOutcome> {
        let response = self
            .http
            .get(url.clone())
            .timeout(self.settings.fetch_timeout)
            .send()
            .await
            .map_err(ConfsyncError::transport)?;

        match response.status() {
            StatusCode::OK => {
                let payload: ConfigPayload =
                    response.json().await.map_err(ConfsyncError::transport)?;
                Ok(FetchOutcome::Payload(payload))
            }
            StatusCode::NOT_MODIFIED => Ok(FetchOutcome::NotModified),
            StatusCode::NOT_FOUND => Err(ConfsyncError::NamespaceNotFound {
                namespace: self.namespace.clone(),
            }),
            status => Err(ConfsyncError::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }

    fn persist(&self, snapshot: Arc<ConfigSnapshot>) {
        if let Some(store) = self.store.clone() {
            tokio::task::spawn_blocking(move || {
                if let Err(err) = store.save(&snapshot) {
                    warn!(error = %err, "failed to persist snapshot, continuing");
                }
            });
        }
    }

    /// Installs a snapshot without publishing a change event. Used by the
    /// local-cache fallback when the initial remote fetch failed.
    pub(crate) fn restore_snapshot(&self, snapshot: ConfigSnapshot) {
        *self.snapshot.write() = Some(Arc::new(snapshot));
    }

    fn spawn_periodic_refresh(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.settings.refresh_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the immediate first tick duplicates the startup fetch
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(repository) = weak.upgrade() else {
                    break;
                };
                if repository.stopped.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) = repository.sync().await {
                    debug!(
                        namespace = %repository.namespace,
                        error = %err,
                        "periodic refresh failed"
                    );
                }
            }
        });
        *self.refresh_task.lock() = Some(handle);
    }

    /// Cancels the refresh timer and the notifier registration. Idempotent.
    pub fn stop(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.refresh_task.lock().take() {
            handle.abort();
        }
        if let Some(weak) = self.notifier.lock().take() {
            if let Some(notifier) = weak.upgrade() {
                notifier.unregister(&self.namespace, self);
            }
        }
        self.listeners.lock().clear();
        info!(namespace = %self.namespace, "repository stopped");
    }
}

/// Builds the conditional fetch URL.
///
/// The query separator is appended only when at least one parameter exists.
fn assemble_config_url(
    endpoint: &str,
    settings: &ClientSettings,
    namespace: &str,
    release_key: Option<&str>,
    messages: Option<&NotificationMessages>,
) -> Result<Url> {
    let base = format!(
        "{}/configs/{}/{}/{}",
        endpoint.trim_end_matches('/'),
        settings.app_id,
        settings.cluster,
        namespace
    );

    let mut params: Vec<(&str, String)> = Vec::new();
    if let Some(release_key) = release_key {
        params.push(("releaseKey", release_key.to_string()));
    }
    if let Some(ip) = &settings.local_ip {
        params.push(("ip", ip.clone()));
    }
    if let Some(messages) = messages {
        if !messages.is_empty() {
            params.push(("messages", serde_json::to_string(messages)?));
        }
    }
    if let Some(data_center) = &settings.data_center {
        params.push(("dataCenter", data_center.clone()));
    }

    if params.is_empty() {
        Url::parse(&base).map_err(ConfsyncError::transport)
    } else {
        Url::parse_with_params(&base, params.iter().map(|(k, v)| (*k, v.as_str())))
            .map_err(ConfsyncError::transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ClientSettings {
        ClientSettings::new("demo", "http://meta")
    }

    #[test]
    fn test_url_without_parameters_has_no_separator() {
        let url =
            assemble_config_url("http://cs:8080/", &settings(), "application", None, None).unwrap();
        assert_eq!(
            url.as_str(),
            "http://cs:8080/configs/demo/default/application"
        );
    }

    #[test]
    fn test_url_with_release_key() {
        let url = assemble_config_url(
            "http://cs:8080",
            &settings(),
            "application",
            Some("r1"),
            None,
        )
        .unwrap();
        assert_eq!(url.query(), Some("releaseKey=r1"));
    }

    #[test]
    fn test_url_with_all_parameters() {
        let config = settings().with_local_ip("10.0.0.7").with_data_center("dc1");
        let mut messages = NotificationMessages::default();
        messages.put("demo+default+application", 3);

        let url = assemble_config_url(
            "http://cs:8080",
            &config,
            "application",
            Some("r1"),
            Some(&messages),
        )
        .unwrap();

        let query = url.query().unwrap();
        assert!(query.contains("releaseKey=r1"));
        assert!(query.contains("ip=10.0.0.7"));
        assert!(query.contains("dataCenter=dc1"));
        assert!(query.contains("messages="));
    }

    #[test]
    fn test_url_empty_messages_omitted() {
        let url = assemble_config_url(
            "http://cs:8080",
            &settings(),
            "application",
            None,
            Some(&NotificationMessages::default()),
        )
        .unwrap();
        assert_eq!(url.query(), None);
    }

    #[test]
    fn test_url_messages_are_percent_encoded() {
        let mut messages = NotificationMessages::default();
        messages.put("demo+default+application", 3);

        let url = assemble_config_url(
            "http://cs:8080",
            &settings(),
            "application",
            None,
            Some(&messages),
        )
        .unwrap();

        let query = url.query().unwrap();
        assert!(!query.contains('{'));
        assert!(query.contains("%7B"));
    }
}
