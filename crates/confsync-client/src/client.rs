//! Root client context.
//!
//! A [`ConfigClient`] owns the process-wide collaborators — service locator,
//! long-poll notifier, fetch rate limiter, snapshot store — and hands out
//! one [`Config`] facade per namespace. Everything is injected explicitly at
//! construction; there are no ambient globals, so tests can build a client
//! against an in-process server.

use std::collections::HashMap;
use std::sync::Arc;

use confsync_common::protocol::{ConfsyncError, Result};
use confsync_common::rate_limit::{RateLimitConfig, RateLimiter};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cache::SnapshotStore;
use crate::facade::Config;
use crate::locator::ServiceLocator;
use crate::notifier::LongPollNotifier;
use crate::repository::RemoteConfigRepository;
use crate::settings::ClientSettings;

/// Entry point of the confsync client.
pub struct ConfigClient {
    settings: Arc<ClientSettings>,
    http: reqwest::Client,
    locator: Arc<ServiceLocator>,
    notifier: Arc<LongPollNotifier>,
    fetch_limiter: Arc<RateLimiter>,
    store: Option<SnapshotStore>,
    configs: Mutex<HashMap<String, Arc<Config>>>,
}

impl ConfigClient {
    /// Builds a client and starts background service discovery.
    ///
    /// Must run inside a Tokio runtime. No namespace is fetched yet; the
    /// first [`ConfigClient::config`] call for a namespace performs the
    /// initial synchronous load.
    pub async fn new(settings: ClientSettings) -> Result<Self> {
        let settings = Arc::new(settings);

        let http = reqwest::Client::builder()
            .timeout(settings.fetch_timeout)
            .build()
            .map_err(ConfsyncError::transport)?;

        let locator = ServiceLocator::new(&settings, http.clone());
        locator.spawn_refresh(settings.refresh_interval);

        let notifier = LongPollNotifier::new(Arc::clone(&settings), Arc::clone(&locator))?;
        let fetch_limiter = Arc::new(RateLimiter::new(RateLimitConfig::per_second(
            settings.load_config_qps,
        )));
        let store = settings.cache_dir.as_ref().map(SnapshotStore::new);

        Ok(Self {
            settings,
            http,
            locator,
            notifier,
            fetch_limiter,
            store,
            configs: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// The facade for `namespace`, constructing and starting its repository
    /// on first access.
    ///
    /// When the initial remote fetch fails and a cached snapshot exists on
    /// disk, the facade starts from the stale snapshot and the repository
    /// keeps retrying in the background; without a cached snapshot the
    /// failure is returned.
    pub async fn config(&self, namespace: &str) -> Result<Arc<Config>> {
        let mut configs = self.configs.lock().await;
        if let Some(config) = configs.get(namespace) {
            return Ok(Arc::clone(config));
        }

        let repository = RemoteConfigRepository::new(
            namespace,
            Arc::clone(&self.settings),
            Arc::clone(&self.locator),
            Arc::clone(&self.fetch_limiter),
            self.store.clone(),
            self.http.clone(),
        );

        if let Err(err) = repository.start(&self.notifier).await {
            if !self.restore_from_cache(&repository, namespace) {
                return Err(err);
            }
            warn!(
                %namespace,
                error = %err,
                "initial load failed, serving stale snapshot from local cache"
            );
        }

        let config = Config::new(
            namespace,
            repository,
            self.settings.overrides.clone(),
            self.settings.defaults.clone(),
        );
        configs.insert(namespace.to_string(), Arc::clone(&config));
        info!(%namespace, "configuration namespace initialized");
        Ok(config)
    }

    fn restore_from_cache(&self, repository: &Arc<RemoteConfigRepository>, namespace: &str) -> bool {
        if !self.settings.fallback_to_local_cache {
            return false;
        }
        let Some(store) = &self.store else {
            return false;
        };
        match store.load(&self.settings.app_id, &self.settings.cluster, namespace) {
            Ok(Some(snapshot)) => {
                repository.restore_snapshot(snapshot);
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(%namespace, error = %err, "failed to read local snapshot cache");
                false
            }
        }
    }

    /// The process-wide notifier, mainly for tests and diagnostics.
    pub fn notifier(&self) -> &Arc<LongPollNotifier> {
        &self.notifier
    }

    /// Stops the notifier, discovery and every repository. Idempotent.
    pub async fn shutdown(&self) {
        self.notifier.stop();
        self.locator.stop();
        let configs = self.configs.lock().await;
        for config in configs.values() {
            config.repository().stop();
        }
        info!("config client shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_creation() {
        let client = ConfigClient::new(ClientSettings::new("demo", "http://127.0.0.1:1")).await;
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_config_fails_without_service_or_cache() {
        let client = ConfigClient::new(ClientSettings::new("demo", "http://127.0.0.1:1"))
            .await
            .unwrap();
        let err = client.config("application").await.unwrap_err();
        assert!(matches!(err, ConfsyncError::InitialLoadFailed { .. }));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let client = ConfigClient::new(ClientSettings::new("demo", "http://127.0.0.1:1"))
            .await
            .unwrap();
        client.shutdown().await;
        client.shutdown().await;
    }
}
