//! Client settings.
//!
//! All knobs default to the values the config service is operated with;
//! `ClientSettings::new` only requires the app id and the meta server URL.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Settings for one [`crate::ConfigClient`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use confsync_client::ClientSettings;
///
/// let settings = ClientSettings::new("demo", "http://127.0.0.1:8080")
///     .with_cluster("gray")
///     .with_refresh_interval(Duration::from_secs(60));
/// assert_eq!(settings.cluster, "gray");
/// ```
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Application id the configuration belongs to
    pub app_id: String,
    /// Cluster name, `"default"` unless overridden
    pub cluster: String,
    /// Data center hint forwarded to the config service
    pub data_center: Option<String>,
    /// Meta server base URL used for service discovery
    pub meta_url: String,
    /// Local IP reported to the config service for gray releases
    pub local_ip: Option<String>,
    /// Period of the fallback refresh timer
    pub refresh_interval: Duration,
    /// Delay before the first long poll
    pub long_poll_initial_delay: Duration,
    /// Config-fetch rate limit (requests per second)
    pub load_config_qps: f64,
    /// Long-poll rate limit (requests per second)
    pub long_poll_qps: f64,
    /// Base delay for fetch-retry backoff, also the fixed inter-attempt
    /// sleep while a forced refresh is pending
    pub on_error_retry_interval: Duration,
    /// Cap for the fetch-retry backoff schedule
    pub fetch_backoff_max: Duration,
    /// Cap for the long-poll backoff schedule
    pub long_poll_backoff_max: Duration,
    /// Socket read timeout of the long poll; must strictly exceed the
    /// server-side hold timeout or it is clamped with a warning
    pub long_poll_read_timeout: Duration,
    /// Read/connect timeout for config fetch and discovery requests
    pub fetch_timeout: Duration,
    /// Retry budget against the meta server before discovery fails
    pub discovery_retries: u32,
    /// Directory for the local snapshot fallback; `None` disables persistence
    pub cache_dir: Option<PathBuf>,
    /// Serve the on-disk snapshot when the first remote fetch fails
    pub fallback_to_local_cache: bool,
    /// Highest-priority property source (e.g. command-line overrides)
    pub overrides: HashMap<String, String>,
    /// Lowest-priority property source (built-in resource defaults)
    pub defaults: HashMap<String, String>,
}

impl ClientSettings {
    pub fn new(app_id: impl Into<String>, meta_url: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            cluster: "default".to_string(),
            data_center: None,
            meta_url: meta_url.into(),
            local_ip: None,
            refresh_interval: Duration::from_secs(5 * 60),
            long_poll_initial_delay: Duration::from_millis(2000),
            load_config_qps: 2.0,
            long_poll_qps: 2.0,
            on_error_retry_interval: Duration::from_secs(1),
            fetch_backoff_max: Duration::from_secs(8),
            long_poll_backoff_max: Duration::from_secs(120),
            long_poll_read_timeout: Duration::from_secs(90),
            fetch_timeout: Duration::from_secs(10),
            discovery_retries: 2,
            cache_dir: None,
            fallback_to_local_cache: true,
            overrides: HashMap::new(),
            defaults: HashMap::new(),
        }
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    pub fn with_data_center(mut self, data_center: impl Into<String>) -> Self {
        self.data_center = Some(data_center.into());
        self
    }

    pub fn with_local_ip(mut self, local_ip: impl Into<String>) -> Self {
        self.local_ip = Some(local_ip.into());
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_long_poll_initial_delay(mut self, delay: Duration) -> Self {
        self.long_poll_initial_delay = delay;
        self
    }

    pub fn with_long_poll_read_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_read_timeout = timeout;
        self
    }

    pub fn with_on_error_retry_interval(mut self, interval: Duration) -> Self {
        self.on_error_retry_interval = interval;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Adds a process-level override, the highest-priority property source.
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    /// Adds a built-in default, the lowest-priority property source.
    pub fn with_default(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.defaults.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ClientSettings::new("demo", "http://meta");
        assert_eq!(settings.cluster, "default");
        assert_eq!(settings.refresh_interval, Duration::from_secs(300));
        assert_eq!(settings.long_poll_initial_delay, Duration::from_millis(2000));
        assert_eq!(settings.load_config_qps, 2.0);
        assert_eq!(settings.long_poll_qps, 2.0);
        assert_eq!(settings.on_error_retry_interval, Duration::from_secs(1));
        assert_eq!(settings.long_poll_read_timeout, Duration::from_secs(90));
        assert!(settings.fallback_to_local_cache);
        assert!(settings.cache_dir.is_none());
    }

    #[test]
    fn test_builders() {
        let settings = ClientSettings::new("demo", "http://meta")
            .with_cluster("gray")
            .with_data_center("dc1")
            .with_override("k", "forced")
            .with_default("k2", "fallback");
        assert_eq!(settings.cluster, "gray");
        assert_eq!(settings.data_center.as_deref(), Some("dc1"));
        assert_eq!(settings.overrides["k"], "forced");
        assert_eq!(settings.defaults["k2"], "fallback");
    }
}
