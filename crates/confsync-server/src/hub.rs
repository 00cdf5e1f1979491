//! Park/publish index for long-poll requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use confsync_common::protocol::{
    ConfigNotification, NotificationMessages, PROPERTIES_SUFFIX,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::deferred::DeferredNotification;

/// Default hold before an unanswered poll returns 304.
pub const DEFAULT_HOLD_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of handing a client vector to the hub.
pub enum PollOutcome {
    /// Some watched namespace already has a newer id.
    Immediate(Vec<ConfigNotification>),
    /// Parked; the receiver resolves on publication, the guard removes the
    /// handle from every index when the request ends for any reason.
    Parked {
        receiver: oneshot::Receiver<Vec<ConfigNotification>>,
        guard: ParkGuard,
    },
}

/// Removes a parked handle from every index when dropped, covering timeout
/// and client disconnect alongside normal completion.
pub struct ParkGuard {
    hub: Arc<NotificationHub>,
    handle: Arc<DeferredNotification>,
}

impl Drop for ParkGuard {
    fn drop(&mut self) {
        self.hub.unpark(&self.handle);
    }
}

/// In-memory notification state: current id per namespace plus the parked
/// requests watching each namespace.
pub struct NotificationHub {
    hold_timeout: Duration,
    /// Normalized namespace → current server-side notification id.
    latest: RwLock<HashMap<String, i64>>,
    /// Normalized namespace → per-channel message bundle.
    messages: RwLock<HashMap<String, NotificationMessages>>,
    /// Normalized namespace → handles parked on it.
    parked: Mutex<HashMap<String, Vec<Arc<DeferredNotification>>>>,
}

impl NotificationHub {
    pub fn new() -> Arc<Self> {
        Self::with_hold_timeout(DEFAULT_HOLD_TIMEOUT)
    }

    pub fn with_hold_timeout(hold_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            hold_timeout,
            latest: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            parked: Mutex::new(HashMap::new()),
        })
    }

    pub fn hold_timeout(&self) -> Duration {
        self.hold_timeout
    }

    /// Strips the known format suffix, keeping plain names untouched.
    pub fn normalize(namespace: &str) -> &str {
        namespace.strip_suffix(PROPERTIES_SUFFIX).unwrap_or(namespace)
    }

    /// Current server-side id for a namespace, if it was ever published.
    pub fn latest_id(&self, namespace: &str) -> Option<i64> {
        self.latest.read().get(Self::normalize(namespace)).copied()
    }

    /// Handles one client vector: answer immediately when something already
    /// changed, park otherwise.
    pub fn poll(self: &Arc<Self>, vector: Vec<ConfigNotification>) -> PollOutcome {
        let mut client_vector = HashMap::new();
        let mut original_names = HashMap::new();
        for entry in vector {
            let normalized = Self::normalize(&entry.namespace_name).to_string();
            client_vector.insert(normalized.clone(), entry.notification_id);
            original_names.insert(normalized, entry.namespace_name);
        }

        let (handle, receiver) = DeferredNotification::new(client_vector, original_names);

        let immediate = self.changed_for(&handle);
        if !immediate.is_empty() {
            return PollOutcome::Immediate(handle.restore_names(immediate));
        }

        {
            let mut parked = self.parked.lock();
            for namespace in handle.watched() {
                parked.entry(namespace).or_default().push(Arc::clone(&handle));
            }
        }
        debug!(watched = handle.watched().len(), "parked long poll");

        // a publication may have slipped in between the check and the park;
        // re-checking here keeps the request from waiting a full hold for
        // data that already exists
        self.try_complete(&handle);

        PollOutcome::Parked {
            receiver,
            guard: ParkGuard {
                hub: Arc::clone(self),
                handle,
            },
        }
    }

    /// Records a new notification id for `namespace` and wakes every parked
    /// request watching it. Regressing ids are ignored; returns the id now
    /// in effect.
    pub fn publish(&self, namespace: &str, notification_id: i64) -> i64 {
        let normalized = Self::normalize(namespace).to_string();

        let effective = {
            let mut latest = self.latest.write();
            let entry = latest.entry(normalized.clone()).or_insert(0);
            if notification_id > *entry {
                *entry = notification_id;
            }
            *entry
        };
        self.messages
            .write()
            .entry(normalized.clone())
            .or_default()
            .put(normalized.clone(), effective);

        let handles: Vec<Arc<DeferredNotification>> = self
            .parked
            .lock()
            .get(&normalized)
            .cloned()
            .unwrap_or_default();

        let mut woken = 0;
        for handle in handles {
            if self.try_complete(&handle) {
                woken += 1;
            }
        }
        info!(namespace = %normalized, notification_id = effective, woken, "notification published");
        effective
    }

    /// Publishes the next id in sequence for `namespace`.
    pub fn publish_next(&self, namespace: &str) -> i64 {
        let current = self.latest_id(namespace).unwrap_or(0);
        self.publish(namespace, current + 1)
    }

    /// Number of handles currently parked on `namespace`, for diagnostics.
    pub fn parked_count(&self, namespace: &str) -> usize {
        self.parked
            .lock()
            .get(Self::normalize(namespace))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Completes `handle` if any watched namespace changed relative to the
    /// client's vector. On completion the handle leaves every index.
    fn try_complete(&self, handle: &Arc<DeferredNotification>) -> bool {
        let notifications = self.changed_for(handle);
        if notifications.is_empty() {
            return false;
        }
        self.unpark(handle);
        handle.complete(notifications)
    }

    /// All namespaces whose server id exceeds this client's id.
    fn changed_for(&self, handle: &DeferredNotification) -> Vec<ConfigNotification> {
        let latest = self.latest.read();
        let messages = self.messages.read();

        let mut changed = Vec::new();
        for namespace in handle.watched() {
            let client_id = handle.client_id(&namespace).unwrap_or(-1);
            if let Some(&server_id) = latest.get(&namespace) {
                if server_id > client_id {
                    let mut notification = ConfigNotification::new(namespace.clone(), server_id);
                    if let Some(bundle) = messages.get(&namespace) {
                        notification = notification.with_messages(bundle.clone());
                    }
                    changed.push(notification);
                }
            }
        }
        changed.sort_by(|a, b| a.namespace_name.cmp(&b.namespace_name));
        changed
    }

    /// Removes `handle` from every namespace index. Idempotent.
    fn unpark(&self, handle: &Arc<DeferredNotification>) {
        let mut parked = self.parked.lock();
        for namespace in handle.watched() {
            if let Some(entry) = parked.get_mut(&namespace) {
                entry.retain(|h| !Arc::ptr_eq(h, handle));
                if entry.is_empty() {
                    parked.remove(&namespace);
                }
            }
        }
    }
}
