//! Merged configuration view.
//!
//! A [`Config`] presents one namespace as a read-through merge of ordered
//! property sources. Lookup order, highest priority first: process-level
//! overrides, the repository snapshot, environment variables, built-in
//! defaults, and finally the caller-supplied default. Reads never fail
//! because of pipeline errors; the last good snapshot keeps serving.
//!
//! The facade also re-publishes repository change events after applying the
//! priority rules: a change shadowed by a higher-priority source is
//! invisible and filtered out, and a deletion still covered by a
//! lower-priority source is downgraded to a modification.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use confsync_common::protocol::{ConfsyncError, Result};
use parking_lot::Mutex;

use crate::changes::{
    deliver_error, deliver_event, ChangeType, ConfigChangeEvent, ConfigChangeListener,
    PropertyChange,
};
use crate::repository::RemoteConfigRepository;

/// Read-only configuration facade for one namespace.
pub struct Config {
    namespace: String,
    repository: Arc<RemoteConfigRepository>,
    overrides: HashMap<String, String>,
    defaults: HashMap<String, String>,
    listeners: Mutex<Vec<Arc<dyn ConfigChangeListener>>>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub(crate) fn new(
        namespace: impl Into<String>,
        repository: Arc<RemoteConfigRepository>,
        overrides: HashMap<String, String>,
        defaults: HashMap<String, String>,
    ) -> Arc<Self> {
        let config = Arc::new(Self {
            namespace: namespace.into(),
            repository,
            overrides,
            defaults,
            listeners: Mutex::new(Vec::new()),
        });

        let bridge: Arc<dyn ConfigChangeListener> = Arc::new(RepositoryBridge {
            facade: Arc::downgrade(&config),
        });
        config.repository.add_listener(bridge);

        config
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The value of `key`, or `default` when no source serves it. Never
    /// fails.
    pub fn get_property(&self, key: &str, default: &str) -> String {
        self.find_property(key)
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_int_property(&self, key: &str, default: i64) -> i64 {
        self.find_property(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_float_property(&self, key: &str, default: f64) -> f64 {
        self.find_property(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_bool_property(&self, key: &str, default: bool) -> bool {
        self.find_property(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Parses the value of `key` as `T`.
    ///
    /// Returns `Ok(None)` when no source serves the key and `TypeMismatch`
    /// when a value exists but cannot be parsed.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.find_property(key) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| ConfsyncError::TypeMismatch {
                    key: key.to_string(),
                    value,
                    expected: std::any::type_name::<T>(),
                }),
        }
    }

    /// Every key served by the overrides, the snapshot, or the defaults,
    /// sorted. Environment variables are not enumerable and are excluded.
    pub fn property_names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.overrides.keys().cloned().collect();
        if let Some(snapshot) = self.repository.get_config() {
            names.extend(snapshot.configurations.keys().cloned());
        }
        names.extend(self.defaults.keys().cloned());
        names.into_iter().collect()
    }

    pub fn add_change_listener(&self, listener: Arc<dyn ConfigChangeListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn remove_change_listener(&self, listener: &Arc<dyn ConfigChangeListener>) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// The repository backing this facade.
    pub fn repository(&self) -> &Arc<RemoteConfigRepository> {
        &self.repository
    }

    fn find_property(&self, key: &str) -> Option<String> {
        if let Some(value) = self.overrides.get(key) {
            return Some(value.clone());
        }
        if let Some(snapshot) = self.repository.get_config() {
            if let Some(value) = snapshot.get(key) {
                return Some(value.to_string());
            }
        }
        if let Ok(value) = std::env::var(key) {
            return Some(value);
        }
        self.defaults.get(key).cloned()
    }

    /// Value a key would resolve to if the repository stopped serving it.
    fn lower_priority_value(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().or_else(|| self.defaults.get(key).cloned())
    }

    fn handle_repository_event(&self, event: &ConfigChangeEvent) {
        let filtered = filter_event(&self.overrides, |key| self.lower_priority_value(key), event);
        if filtered.is_empty() {
            return;
        }
        let listeners = self.listeners.lock().clone();
        deliver_event(&listeners, &filtered);
    }

    fn handle_repository_error(&self, namespace: &str, error: &ConfsyncError) {
        let listeners = self.listeners.lock().clone();
        deliver_error(&listeners, namespace, error);
    }
}

/// Internal repository listener that re-fires filtered events to the
/// facade's own listeners.
struct RepositoryBridge {
    facade: Weak<Config>,
}

impl ConfigChangeListener for RepositoryBridge {
    fn on_change(&self, event: &ConfigChangeEvent) {
        if let Some(facade) = self.facade.upgrade() {
            facade.handle_repository_event(event);
        }
    }

    fn on_sync_error(&self, namespace: &str, error: &ConfsyncError) {
        if let Some(facade) = self.facade.upgrade() {
            facade.handle_repository_error(namespace, error);
        }
    }
}

/// Applies the source-priority rules to a repository-level event.
fn filter_event(
    overrides: &HashMap<String, String>,
    lower_priority: impl Fn(&str) -> Option<String>,
    event: &ConfigChangeEvent,
) -> ConfigChangeEvent {
    let mut changes = Vec::new();

    for change in &event.changes {
        // a key pinned by an override never changes from the host's view
        if overrides.contains_key(&change.key) {
            continue;
        }

        match change.change_type {
            ChangeType::Modified => changes.push(change.clone()),
            ChangeType::Added => match lower_priority(&change.key) {
                Some(shadowed) if change.new_value.as_deref() == Some(shadowed.as_str()) => {}
                Some(shadowed) => changes.push(PropertyChange {
                    key: change.key.clone(),
                    old_value: Some(shadowed),
                    new_value: change.new_value.clone(),
                    change_type: ChangeType::Modified,
                }),
                None => changes.push(change.clone()),
            },
            ChangeType::Deleted => match lower_priority(&change.key) {
                Some(fallback) if change.old_value.as_deref() == Some(fallback.as_str()) => {}
                Some(fallback) => changes.push(PropertyChange {
                    key: change.key.clone(),
                    old_value: change.old_value.clone(),
                    new_value: Some(fallback),
                    change_type: ChangeType::Modified,
                }),
                None => changes.push(change.clone()),
            },
        }
    }

    ConfigChangeEvent {
        namespace: event.namespace.clone(),
        changes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::diff_configurations;

    fn map(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn event(changes: Vec<PropertyChange>) -> ConfigChangeEvent {
        ConfigChangeEvent {
            namespace: "application".to_string(),
            changes,
        }
    }

    #[test]
    fn test_filter_drops_overridden_key() {
        let overrides = map(&[("k", "pinned")]);
        let raw = diff_configurations("application", &map(&[("k", "v1")]), &map(&[("k", "v2")]));

        let filtered = filter_event(&overrides, |_| None, &raw);
        assert!(filtered.is_empty());
    }

    #[test]
    fn test_filter_added_key_with_lower_source_becomes_modified() {
        let raw = event(vec![PropertyChange {
            key: "k".to_string(),
            old_value: None,
            new_value: Some("remote".to_string()),
            change_type: ChangeType::Added,
        }]);

        let filtered = filter_event(&HashMap::new(), |_| Some("fallback".to_string()), &raw);
        let change = filtered.change("k").unwrap();
        assert_eq!(change.change_type, ChangeType::Modified);
        assert_eq!(change.old_value.as_deref(), Some("fallback"));
        assert_eq!(change.new_value.as_deref(), Some("remote"));
    }

    #[test]
    fn test_filter_added_key_matching_lower_source_is_invisible() {
        let raw = event(vec![PropertyChange {
            key: "k".to_string(),
            old_value: None,
            new_value: Some("same".to_string()),
            change_type: ChangeType::Added,
        }]);

        let filtered = filter_event(&HashMap::new(), |_| Some("same".to_string()), &raw);
        assert!(filtered.is_empty());
    }

    #[test]
    fn test_filter_deleted_key_with_fallback_becomes_modified() {
        let raw = event(vec![PropertyChange {
            key: "k".to_string(),
            old_value: Some("remote".to_string()),
            new_value: None,
            change_type: ChangeType::Deleted,
        }]);

        let filtered = filter_event(&HashMap::new(), |_| Some("fallback".to_string()), &raw);
        let change = filtered.change("k").unwrap();
        assert_eq!(change.change_type, ChangeType::Modified);
        assert_eq!(change.new_value.as_deref(), Some("fallback"));
    }

    #[test]
    fn test_filter_passes_plain_changes_through() {
        let raw = diff_configurations(
            "application",
            &map(&[("a", "1")]),
            &map(&[("a", "2"), ("b", "3")]),
        );
        let filtered = filter_event(&HashMap::new(), |_| None, &raw);
        assert_eq!(filtered.changes.len(), 2);
    }

    mod with_repository {
        use super::*;
        use confsync_common::rate_limit::{RateLimitConfig, RateLimiter};
        use crate::locator::ServiceLocator;
        use crate::settings::ClientSettings;
        use crate::snapshot::ConfigSnapshot;

        fn facade(overrides: HashMap<String, String>, defaults: HashMap<String, String>) -> Arc<Config> {
            let settings = Arc::new(ClientSettings::new("demo", "http://127.0.0.1:1"));
            let http = reqwest::Client::new();
            let locator = ServiceLocator::new(&settings, http.clone());
            let limiter = Arc::new(RateLimiter::new(RateLimitConfig::per_second(2.0)));
            let repository = RemoteConfigRepository::new(
                "application",
                settings,
                locator,
                limiter,
                None,
                http,
            );
            repository.restore_snapshot(ConfigSnapshot {
                app_id: "demo".to_string(),
                cluster: "default".to_string(),
                namespace: "application".to_string(),
                release_key: "r1".to_string(),
                configurations: map(&[("k", "remote"), ("timeout", "500"), ("flag", "true")]),
                notification_messages: None,
            });
            Config::new("application", repository, overrides, defaults)
        }

        #[tokio::test]
        async fn test_priority_order() {
            let config = facade(map(&[("k", "override")]), map(&[("only-default", "d")]));

            assert_eq!(config.get_property("k", ""), "override");
            assert_eq!(config.get_property("timeout", ""), "500");
            assert_eq!(config.get_property("only-default", ""), "d");
            assert_eq!(config.get_property("absent", "fallback"), "fallback");
        }

        #[tokio::test]
        async fn test_environment_between_snapshot_and_defaults() {
            let config = facade(HashMap::new(), map(&[("CONFSYNC_FACADE_TEST_KEY", "default")]));

            std::env::set_var("CONFSYNC_FACADE_TEST_KEY", "from-env");
            assert_eq!(config.get_property("CONFSYNC_FACADE_TEST_KEY", ""), "from-env");
            std::env::remove_var("CONFSYNC_FACADE_TEST_KEY");
            assert_eq!(config.get_property("CONFSYNC_FACADE_TEST_KEY", ""), "default");
        }

        #[tokio::test]
        async fn test_typed_accessors() {
            let config = facade(HashMap::new(), HashMap::new());

            assert_eq!(config.get_int_property("timeout", 0), 500);
            assert!(config.get_bool_property("flag", false));
            // unparseable falls back to the default
            assert_eq!(config.get_int_property("k", 42), 42);
        }

        #[tokio::test]
        async fn test_get_parsed_type_mismatch() {
            let config = facade(HashMap::new(), HashMap::new());

            assert_eq!(config.get_parsed::<i64>("timeout").unwrap(), Some(500));
            assert_eq!(config.get_parsed::<i64>("absent").unwrap(), None);
            let err = config.get_parsed::<i64>("k").unwrap_err();
            assert!(matches!(err, ConfsyncError::TypeMismatch { .. }));
        }

        #[tokio::test]
        async fn test_property_names_sorted_union() {
            let config = facade(map(&[("zz", "1")]), map(&[("aa", "2")]));
            let names = config.property_names();
            assert_eq!(names, vec!["aa", "flag", "k", "timeout", "zz"]);
        }
    }
}
