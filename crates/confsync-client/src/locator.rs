//! Config service discovery.
//!
//! The locator asks the meta server for the current list of config service
//! instances and keeps the list fresh with a background task. Consumers get
//! the cached list; only when the cache is empty does a call hit the meta
//! server inline, with a small retry budget before giving up.

use std::sync::Arc;
use std::time::Duration;

use confsync_common::protocol::{ConfsyncError, Result, ServiceInstance};
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::settings::ClientSettings;

/// Resolves the current list of config service endpoints.
pub struct ServiceLocator {
    meta_url: String,
    http: reqwest::Client,
    retries: u32,
    services: RwLock<Vec<ServiceInstance>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceLocator {
    pub fn new(settings: &ClientSettings, http: reqwest::Client) -> Arc<Self> {
        Arc::new(Self {
            meta_url: settings.meta_url.trim_end_matches('/').to_string(),
            http,
            retries: settings.discovery_retries,
            services: RwLock::new(Vec::new()),
            refresh_task: Mutex::new(None),
        })
    }

    /// Starts the background refresh loop. Failures are logged and retried
    /// at the next tick; the cached list is only replaced by a non-empty one.
    pub fn spawn_refresh(self: &Arc<Self>, period: Duration) {
        let locator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick fires immediately; callers already fetch inline
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(err) = locator.try_refresh().await {
                    warn!(error = %err, "config service discovery refresh failed");
                }
            }
        });
        *self.refresh_task.lock() = Some(handle);
    }

    /// Returns the known config service instances.
    ///
    /// Callers must tolerate order changes between calls; they shuffle the
    /// list themselves before iterating.
    pub async fn config_services(&self) -> Result<Vec<ServiceInstance>> {
        {
            let cached = self.services.read().await;
            if !cached.is_empty() {
                return Ok(cached.clone());
            }
        }

        let mut last_error: Option<ConfsyncError> = None;
        for attempt in 0..=self.retries {
            match self.try_refresh().await {
                Ok(list) if !list.is_empty() => return Ok(list),
                Ok(_) => {
                    debug!(attempt, "meta server returned an empty service list");
                }
                Err(err) => {
                    debug!(attempt, error = %err, "meta server request failed");
                    last_error = Some(err);
                }
            }
            if attempt < self.retries {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }

        if let Some(err) = last_error {
            warn!(error = %err, "service discovery exhausted its retry budget");
        }
        Err(ConfsyncError::NoAvailableService(self.meta_url.clone()))
    }

    async fn try_refresh(&self) -> Result<Vec<ServiceInstance>> {
        let url = format!("{}/services/config", self.meta_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(ConfsyncError::transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConfsyncError::UnexpectedStatus {
                status: status.as_u16(),
                url,
            });
        }

        let list: Vec<ServiceInstance> =
            response.json().await.map_err(ConfsyncError::transport)?;
        if !list.is_empty() {
            let mut cached = self.services.write().await;
            if cached.len() != list.len() {
                info!(count = list.len(), "config service list updated");
            }
            *cached = list.clone();
        }
        Ok(list)
    }

    /// Stops the background refresh loop.
    pub fn stop(&self) {
        if let Some(handle) = self.refresh_task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator_for(meta_url: &str) -> Arc<ServiceLocator> {
        let settings = ClientSettings::new("demo", meta_url);
        ServiceLocator::new(&settings, reqwest::Client::new())
    }

    #[tokio::test]
    async fn test_cached_list_served_without_network() {
        let locator = locator_for("http://127.0.0.1:1");
        {
            let mut cached = locator.services.write().await;
            cached.push(ServiceInstance {
                app_name: "config-service".to_string(),
                instance_id: "cs-1".to_string(),
                homepage_url: "http://127.0.0.1:8080/".to_string(),
            });
        }

        let list = locator.config_services().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].instance_id, "cs-1");
    }

    #[tokio::test]
    async fn test_unreachable_meta_yields_no_available_service() {
        // nothing listens on port 1; every discovery attempt fails fast
        let locator = locator_for("http://127.0.0.1:1");
        let err = locator.config_services().await.unwrap_err();
        assert!(matches!(err, ConfsyncError::NoAvailableService(_)));
    }

    #[tokio::test]
    async fn test_meta_url_trailing_slash_trimmed() {
        let locator = locator_for("http://127.0.0.1:1/");
        assert_eq!(locator.meta_url, "http://127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let locator = locator_for("http://127.0.0.1:1");
        locator.spawn_refresh(Duration::from_secs(3600));
        locator.stop();
        locator.stop();
    }
}
