//! Change events and listener dispatch.
//!
//! Successive snapshots of a namespace are diffed key by key into a single
//! [`ConfigChangeEvent`]. Events are delivered to registered listeners on a
//! worker task separate from the repository's sync path; a panicking
//! listener is logged and isolated so it can never block the others.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use confsync_common::protocol::ConfsyncError;
use serde::Serialize;
use tracing::error;

/// How a single key changed between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

/// One changed key with its old and new values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyChange {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub change_type: ChangeType,
}

/// All changes between two published snapshots of one namespace.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigChangeEvent {
    pub namespace: String,
    pub changes: Vec<PropertyChange>,
}

impl ConfigChangeEvent {
    /// Looks up the change recorded for `key`, if any.
    pub fn change(&self, key: &str) -> Option<&PropertyChange> {
        self.changes.iter().find(|c| c.key == key)
    }

    pub fn changed_keys(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.key.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Capability registered with a repository or facade to observe changes.
///
/// `on_change` runs on a dispatch task in registration order.
/// `on_sync_error` reports a failed sync without touching the last good
/// snapshot; the default implementation ignores it.
pub trait ConfigChangeListener: Send + Sync {
    fn on_change(&self, event: &ConfigChangeEvent);

    fn on_sync_error(&self, _namespace: &str, _error: &ConfsyncError) {}
}

/// Adapter turning a closure into a [`ConfigChangeListener`].
///
/// ```
/// use confsync_client::changes::{ConfigChangeEvent, FnListener};
///
/// let listener = FnListener(|event: &ConfigChangeEvent| {
///     println!("{} changed", event.namespace);
/// });
/// # let _ = listener;
/// ```
pub struct FnListener<F>(pub F);

impl<F> ConfigChangeListener for FnListener<F>
where
    F: Fn(&ConfigChangeEvent) + Send + Sync,
{
    fn on_change(&self, event: &ConfigChangeEvent) {
        (self.0)(event)
    }
}

/// Diffs two configuration maps into a change event, keys in sorted order.
pub fn diff_configurations(
    namespace: &str,
    previous: &HashMap<String, String>,
    current: &HashMap<String, String>,
) -> ConfigChangeEvent {
    let keys: BTreeSet<&String> = previous.keys().chain(current.keys()).collect();

    let mut changes = Vec::new();
    for key in keys {
        match (previous.get(key), current.get(key)) {
            (None, Some(new_value)) => changes.push(PropertyChange {
                key: key.clone(),
                old_value: None,
                new_value: Some(new_value.clone()),
                change_type: ChangeType::Added,
            }),
            (Some(old_value), None) => changes.push(PropertyChange {
                key: key.clone(),
                old_value: Some(old_value.clone()),
                new_value: None,
                change_type: ChangeType::Deleted,
            }),
            (Some(old_value), Some(new_value)) if old_value != new_value => {
                changes.push(PropertyChange {
                    key: key.clone(),
                    old_value: Some(old_value.clone()),
                    new_value: Some(new_value.clone()),
                    change_type: ChangeType::Modified,
                })
            }
            _ => {}
        }
    }

    ConfigChangeEvent {
        namespace: namespace.to_string(),
        changes,
    }
}

/// Delivers `event` to every listener in order, isolating panics.
pub(crate) fn deliver_event(listeners: &[Arc<dyn ConfigChangeListener>], event: &ConfigChangeEvent) {
    for listener in listeners {
        let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_change(event)));
        if outcome.is_err() {
            error!(
                namespace = %event.namespace,
                "config change listener panicked, continuing with remaining listeners"
            );
        }
    }
}

/// Reports a sync failure to every listener in order, isolating panics.
pub(crate) fn deliver_error(
    listeners: &[Arc<dyn ConfigChangeListener>],
    namespace: &str,
    error: &ConfsyncError,
) {
    for listener in listeners {
        let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_sync_error(namespace, error)));
        if outcome.is_err() {
            error!(%namespace, "error listener panicked, continuing with remaining listeners");
        }
    }
}

/// One unit of listener work, queued by a repository publication.
pub(crate) enum DispatchJob {
    Change(Vec<Arc<dyn ConfigChangeListener>>, ConfigChangeEvent),
    SyncError(Vec<Arc<dyn ConfigChangeListener>>, String, ConfsyncError),
}

/// Spawns the per-repository dispatcher: a single consumer draining the
/// queue, so any one listener observes events in publication order while
/// listener code stays off the sync path. The task ends when the owning
/// repository (the only sender) is dropped.
pub(crate) fn spawn_dispatcher() -> tokio::sync::mpsc::UnboundedSender<DispatchJob> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<DispatchJob>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                DispatchJob::Change(listeners, event) => deliver_event(&listeners, &event),
                DispatchJob::SyncError(listeners, namespace, error) => {
                    deliver_error(&listeners, &namespace, &error)
                }
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn map(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_diff_added_modified_deleted() {
        let previous = map(&[("k", "v1"), ("gone", "x")]);
        let current = map(&[("k", "v2"), ("new", "n1")]);

        let event = diff_configurations("app", &previous, &current);
        assert_eq!(event.changes.len(), 3);

        let added = event.change("new").unwrap();
        assert_eq!(added.change_type, ChangeType::Added);
        assert_eq!(added.new_value.as_deref(), Some("n1"));
        assert_eq!(added.old_value, None);

        let modified = event.change("k").unwrap();
        assert_eq!(modified.change_type, ChangeType::Modified);
        assert_eq!(modified.old_value.as_deref(), Some("v1"));
        assert_eq!(modified.new_value.as_deref(), Some("v2"));

        let deleted = event.change("gone").unwrap();
        assert_eq!(deleted.change_type, ChangeType::Deleted);
        assert_eq!(deleted.old_value.as_deref(), Some("x"));
        assert_eq!(deleted.new_value, None);
    }

    #[test]
    fn test_diff_identical_maps_is_empty() {
        let a = map(&[("k", "v")]);
        let event = diff_configurations("app", &a, &a.clone());
        assert!(event.is_empty());
    }

    #[test]
    fn test_diff_from_empty_is_all_added() {
        let event = diff_configurations("app", &HashMap::new(), &map(&[("a", "1"), ("b", "2")]));
        assert_eq!(event.changes.len(), 2);
        assert!(event
            .changes
            .iter()
            .all(|c| c.change_type == ChangeType::Added));
        // sorted key order
        assert_eq!(event.changed_keys(), vec!["a", "b"]);
    }

    #[test]
    fn test_deliver_isolates_panicking_listener() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        struct Panicking;
        impl ConfigChangeListener for Panicking {
            fn on_change(&self, _event: &ConfigChangeEvent) {
                panic!("listener failure");
            }
        }

        struct Counting;
        impl ConfigChangeListener for Counting {
            fn on_change(&self, _event: &ConfigChangeEvent) {
                CALLS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let listeners: Vec<Arc<dyn ConfigChangeListener>> =
            vec![Arc::new(Panicking), Arc::new(Counting)];
        let event = diff_configurations("app", &HashMap::new(), &map(&[("k", "v")]));

        deliver_event(&listeners, &event);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closure_listener() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let listener: Arc<dyn ConfigChangeListener> =
            Arc::new(FnListener(move |_: &ConfigChangeEvent| {
                seen.fetch_add(1, Ordering::SeqCst);
            }));

        let event = diff_configurations("app", &HashMap::new(), &map(&[("k", "v")]));
        deliver_event(&[listener], &event);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
