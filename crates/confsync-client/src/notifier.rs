//! Long-poll notification worker.
//!
//! One notifier per process multiplexes every watched namespace into a
//! single outstanding long poll against the notification endpoint. The
//! request carries the vector of `{namespace, last-seen-notification-id}`;
//! when the server answers with a change set the notifier advances its id
//! vector and wakes the affected repositories, which re-fetch on their own
//! tasks. A 304 simply re-arms the poll.
//!
//! The worker starts with the first repository registration and runs until
//! `stop()`: the stop flag is checked at the loop head and every sleep is
//! raced against the stop signal, so shutdown never waits for a backoff to
//! elapse. In-flight HTTP requests are not aborted; they complete or time
//! out naturally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use confsync_common::backoff::BackoffSchedule;
use confsync_common::protocol::{
    ConfigNotification, ConfsyncError, NotificationMessages, Result,
    NOTIFICATION_ID_PLACEHOLDER, PROPERTIES_SUFFIX,
};
use confsync_common::rate_limit::{RateLimitConfig, RateLimiter};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use reqwest::{StatusCode, Url};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::repository::RemoteConfigRepository;
use crate::settings::ClientSettings;

/// How long the notification server holds an unanswered poll before the
/// 304 default fires. The client read timeout must strictly exceed this.
pub const SERVER_HOLD_TIMEOUT: Duration = Duration::from_secs(60);

/// Defensive wait on the rate-limit gate; the poll proceeds regardless.
const RATE_LIMIT_WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct NotifierState {
    /// Watched namespace → interested repositories (non-owning).
    watched: HashMap<String, Vec<Weak<RemoteConfigRepository>>>,
    /// Namespace → last acknowledged notification id.
    notification_ids: HashMap<String, i64>,
    /// Namespace → latest message bundle received.
    remote_messages: HashMap<String, NotificationMessages>,
    /// Endpoint of the last successful poll, preferred for the next one.
    preferred_endpoint: Option<String>,
}

enum PollOutcome {
    Changes(usize),
    NotModified,
}

/// Process-wide long-poll notifier.
pub struct LongPollNotifier {
    settings: Arc<ClientSettings>,
    http: reqwest::Client,
    locator: Arc<crate::locator::ServiceLocator>,
    rate_limiter: RateLimiter,
    state: Mutex<NotifierState>,
    started: AtomicBool,
    stopped: AtomicBool,
    stop_signal: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LongPollNotifier {
    pub fn new(
        settings: Arc<ClientSettings>,
        locator: Arc<crate::locator::ServiceLocator>,
    ) -> Result<Arc<Self>> {
        let read_timeout = effective_read_timeout(settings.long_poll_read_timeout);
        let http = reqwest::Client::builder()
            .timeout(read_timeout)
            .build()
            .map_err(ConfsyncError::transport)?;
        let rate_limiter = RateLimiter::new(RateLimitConfig::per_second(settings.long_poll_qps));

        Ok(Arc::new(Self {
            settings,
            http,
            locator,
            rate_limiter,
            state: Mutex::new(NotifierState::default()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_signal: Notify::new(),
            worker: Mutex::new(None),
        }))
    }

    /// Adds `repository` to the fan-out for `namespace`.
    ///
    /// The first registration starts the worker. A duplicate
    /// `(namespace, repository)` pair is a no-op; returns whether the pair
    /// was newly added.
    pub fn register(
        self: &Arc<Self>,
        namespace: &str,
        repository: &Arc<RemoteConfigRepository>,
    ) -> bool {
        let weak = Arc::downgrade(repository);
        let added = {
            let mut state = self.state.lock();
            let entry = state.watched.entry(namespace.to_string()).or_default();
            let duplicate = entry.iter().any(|w| w.ptr_eq(&weak));
            if !duplicate {
                entry.push(weak);
            }
            state
                .notification_ids
                .entry(namespace.to_string())
                .or_insert(NOTIFICATION_ID_PLACEHOLDER);
            !duplicate
        };

        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.spawn_worker();
        }
        added
    }

    pub fn unregister(&self, namespace: &str, repository: &Arc<RemoteConfigRepository>) {
        let weak = Arc::downgrade(repository);
        let mut state = self.state.lock();
        if let Some(entry) = state.watched.get_mut(namespace) {
            entry.retain(|w| !w.ptr_eq(&weak) && w.strong_count() > 0);
            if entry.is_empty() {
                state.watched.remove(namespace);
            }
        }
    }

    /// Requests the worker to stop. The loop observes the flag at its head
    /// and sleeps are woken early; an in-flight poll finishes on its own.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop_signal.notify_waiters();
            info!("long poll notifier stopping");
        }
    }

    /// Number of repositories currently watching `namespace`.
    pub fn watcher_count(&self, namespace: &str) -> usize {
        self.state
            .lock()
            .watched
            .get(namespace)
            .map(|v| v.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    /// Last acknowledged notification id for `namespace`.
    pub fn notification_id(&self, namespace: &str) -> Option<i64> {
        self.state.lock().notification_ids.get(namespace).copied()
    }

    fn spawn_worker(self: &Arc<Self>) {
        let notifier = Arc::clone(self);
        let handle = tokio::spawn(async move {
            notifier.run().await;
        });
        *self.worker.lock() = Some(handle);
    }

    async fn run(self: Arc<Self>) {
        self.sleep_or_stop(self.settings.long_poll_initial_delay)
            .await;
        info!("long poll worker started");

        let mut backoff = BackoffSchedule::new(
            self.settings.on_error_retry_interval,
            self.settings.long_poll_backoff_max,
        );

        while !self.stopped.load(Ordering::SeqCst) {
            if !self.rate_limiter.try_acquire(RATE_LIMIT_WAIT).await {
                // defensive gate only: pace, then poll anyway
                self.sleep_or_stop(RATE_LIMIT_WAIT).await;
            }
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            match self.poll_once().await {
                Ok(PollOutcome::Changes(count)) => {
                    debug!(count, "long poll returned changes");
                    backoff.on_success();
                }
                Ok(PollOutcome::NotModified) => {
                    backoff.on_success();
                    // opportunistic rebalance across config service instances
                    if rand::random::<bool>() {
                        self.state.lock().preferred_endpoint = None;
                    }
                }
                Err(err) => {
                    self.state.lock().preferred_endpoint = None;
                    let delay = backoff.next_delay();
                    warn!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "long poll failed, backing off"
                    );
                    self.sleep_or_stop(delay).await;
                }
            }
        }
        info!("long poll worker stopped");
    }

    async fn poll_once(&self) -> Result<PollOutcome> {
        let (preferred, notifications) = {
            let state = self.state.lock();
            let mut notifications: Vec<ConfigNotification> = state
                .notification_ids
                .iter()
                .map(|(namespace, id)| ConfigNotification::new(namespace.clone(), *id))
                .collect();
            notifications.sort_by(|a, b| a.namespace_name.cmp(&b.namespace_name));
            (state.preferred_endpoint.clone(), notifications)
        };

        if notifications.is_empty() {
            self.sleep_or_stop(Duration::from_secs(1)).await;
            return Ok(PollOutcome::NotModified);
        }

        let endpoint = match preferred {
            Some(endpoint) => endpoint,
            None => {
                let services = self.locator.config_services().await?;
                services
                    .choose(&mut rand::thread_rng())
                    .map(|s| s.homepage_url.clone())
                    .ok_or_else(|| {
                        ConfsyncError::NoAvailableService(self.settings.meta_url.clone())
                    })?
            }
        };

        let url = assemble_long_poll_url(&endpoint, &self.settings, &notifications)?;
        debug!(url = %url, "long polling");

        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(ConfsyncError::transport)?;

        match response.status() {
            StatusCode::OK => {
                let changes: Vec<ConfigNotification> =
                    response.json().await.map_err(ConfsyncError::transport)?;
                let count = changes.len();
                self.handle_changes(&endpoint, changes);
                self.state.lock().preferred_endpoint = Some(endpoint);
                Ok(PollOutcome::Changes(count))
            }
            StatusCode::NOT_MODIFIED => Ok(PollOutcome::NotModified),
            status => Err(ConfsyncError::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }

    /// Advances the id vector and wakes every repository interested in a
    /// changed namespace. Message bundles are copied per repository.
    fn handle_changes(&self, endpoint: &str, changes: Vec<ConfigNotification>) {
        let mut to_notify: Vec<(Arc<RemoteConfigRepository>, Option<NotificationMessages>)> =
            Vec::new();

        {
            let mut state = self.state.lock();
            for change in &changes {
                let namespace = change.namespace_name.as_str();

                // only ids that actually increased are recorded
                let current = state
                    .notification_ids
                    .get(namespace)
                    .copied()
                    .unwrap_or(NOTIFICATION_ID_PLACEHOLDER);
                if change.notification_id > current {
                    state
                        .notification_ids
                        .insert(namespace.to_string(), change.notification_id);
                }

                if let Some(messages) = &change.messages {
                    state
                        .remote_messages
                        .entry(namespace.to_string())
                        .or_default()
                        .merge(messages);
                }
                // each repository gets its own copy of the merged bundle
                let merged = state.remote_messages.get(namespace).cloned();

                // repositories may be registered under the plain name or the
                // suffixed spelling stripped upstream
                let suffixed = format!("{namespace}{PROPERTIES_SUFFIX}");
                for key in [namespace, suffixed.as_str()] {
                    if let Some(entry) = state.watched.get(key) {
                        for weak in entry {
                            if let Some(repository) = weak.upgrade() {
                                to_notify.push((repository, merged.clone()));
                            }
                        }
                    }
                }
            }
        }

        for (repository, messages) in to_notify {
            repository.on_long_poll_notified(endpoint.to_string(), messages);
        }
    }

    async fn sleep_or_stop(&self, duration: Duration) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.stop_signal.notified() => {}
        }
    }
}

/// Clamps the configured read timeout so it strictly exceeds the server
/// hold timeout; a severed poll would turn every quiet hold into an error.
fn effective_read_timeout(configured: Duration) -> Duration {
    if configured > SERVER_HOLD_TIMEOUT {
        configured
    } else {
        let clamped = SERVER_HOLD_TIMEOUT + Duration::from_secs(30);
        warn!(
            configured_secs = configured.as_secs(),
            clamped_secs = clamped.as_secs(),
            "long poll read timeout must exceed the server hold timeout, clamping"
        );
        clamped
    }
}

/// Builds the long-poll URL with the full id vector as a JSON parameter.
fn assemble_long_poll_url(
    endpoint: &str,
    settings: &ClientSettings,
    notifications: &[ConfigNotification],
) -> Result<Url> {
    let base = format!("{}/notifications/v2", endpoint.trim_end_matches('/'));

    let mut params: Vec<(&str, String)> = vec![
        ("appId", settings.app_id.clone()),
        ("cluster", settings.cluster.clone()),
    ];
    if let Some(data_center) = &settings.data_center {
        params.push(("dataCenter", data_center.clone()));
    }
    if let Some(ip) = &settings.local_ip {
        params.push(("ip", ip.clone()));
    }
    params.push(("notifications", serde_json::to_string(notifications)?));

    Url::parse_with_params(&base, params.iter().map(|(k, v)| (*k, v.as_str())))
        .map_err(ConfsyncError::transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::ServiceLocator;

    #[tokio::test]
    async fn test_stop_wakes_sleepers_early() {
        let settings = Arc::new(ClientSettings::new("demo", "http://127.0.0.1:1"));
        let locator = ServiceLocator::new(&settings, reqwest::Client::new());
        let notifier = LongPollNotifier::new(settings, locator).unwrap();

        let started = std::time::Instant::now();
        let sleeper = {
            let notifier = Arc::clone(&notifier);
            tokio::spawn(async move {
                notifier.sleep_or_stop(Duration::from_secs(30)).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        notifier.stop();
        sleeper.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_sleep_after_stop_returns_immediately() {
        let settings = Arc::new(ClientSettings::new("demo", "http://127.0.0.1:1"));
        let locator = ServiceLocator::new(&settings, reqwest::Client::new());
        let notifier = LongPollNotifier::new(settings, locator).unwrap();

        notifier.stop();
        let started = std::time::Instant::now();
        notifier.sleep_or_stop(Duration::from_secs(30)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_read_timeout_above_hold_is_kept() {
        assert_eq!(
            effective_read_timeout(Duration::from_secs(90)),
            Duration::from_secs(90)
        );
    }

    #[test]
    fn test_read_timeout_equal_to_hold_is_clamped() {
        assert_eq!(
            effective_read_timeout(SERVER_HOLD_TIMEOUT),
            SERVER_HOLD_TIMEOUT + Duration::from_secs(30)
        );
    }

    #[test]
    fn test_read_timeout_below_hold_is_clamped() {
        assert_eq!(
            effective_read_timeout(Duration::from_secs(5)),
            Duration::from_secs(90)
        );
    }

    #[test]
    fn test_long_poll_url() {
        let settings = ClientSettings::new("demo", "http://meta").with_data_center("dc1");
        let notifications = vec![
            ConfigNotification::new("application", -1),
            ConfigNotification::new("db", 7),
        ];

        let url = assemble_long_poll_url("http://cs:8080/", &settings, &notifications).unwrap();
        assert!(url.as_str().starts_with("http://cs:8080/notifications/v2?"));

        let query = url.query().unwrap();
        assert!(query.contains("appId=demo"));
        assert!(query.contains("cluster=default"));
        assert!(query.contains("dataCenter=dc1"));
        assert!(query.contains("notifications="));

        // the id vector survives the round trip through the query string
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().collect();
        let parsed: Vec<ConfigNotification> =
            serde_json::from_str(&pairs["notifications"]).unwrap();
        assert_eq!(parsed, notifications);
    }
}
