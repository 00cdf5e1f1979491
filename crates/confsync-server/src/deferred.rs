//! One-shot completion handles for parked long polls.

use std::collections::HashMap;
use std::sync::Arc;

use confsync_common::protocol::ConfigNotification;
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// A parked long-poll request.
///
/// Carries the client's id vector (normalized namespace → last seen id) and
/// the normalized → original spelling map, so the response can be returned
/// under the names the client sent. Completion consumes the internal sender:
/// whichever of data, timeout or disconnect comes first wins, every later
/// attempt is a no-op.
pub struct DeferredNotification {
    client_vector: HashMap<String, i64>,
    original_names: HashMap<String, String>,
    tx: Mutex<Option<oneshot::Sender<Vec<ConfigNotification>>>>,
}

impl DeferredNotification {
    pub fn new(
        client_vector: HashMap<String, i64>,
        original_names: HashMap<String, String>,
    ) -> (Arc<Self>, oneshot::Receiver<Vec<ConfigNotification>>) {
        let (tx, rx) = oneshot::channel();
        let handle = Arc::new(Self {
            client_vector,
            original_names,
            tx: Mutex::new(Some(tx)),
        });
        (handle, rx)
    }

    /// Normalized names of the namespaces this request watches.
    pub fn watched(&self) -> Vec<String> {
        self.client_vector.keys().cloned().collect()
    }

    /// The id the client last saw for a normalized namespace.
    pub fn client_id(&self, normalized: &str) -> Option<i64> {
        self.client_vector.get(normalized).copied()
    }

    /// The spelling the client used for a normalized namespace.
    pub fn original_name(&self, normalized: &str) -> Option<&str> {
        self.original_names.get(normalized).map(String::as_str)
    }

    /// Rewrites normalized namespace names back to the client's spellings.
    pub fn restore_names(&self, notifications: Vec<ConfigNotification>) -> Vec<ConfigNotification> {
        notifications
            .into_iter()
            .map(|mut notification| {
                if let Some(original) = self.original_names.get(&notification.namespace_name) {
                    notification.namespace_name = original.clone();
                }
                notification
            })
            .collect()
    }

    /// Completes the request with `notifications`, restoring each namespace
    /// to the client's original spelling. Returns whether this call was the
    /// one that completed the request.
    pub fn complete(&self, notifications: Vec<ConfigNotification>) -> bool {
        let Some(tx) = self.tx.lock().take() else {
            return false;
        };

        // a dropped receiver means the client disconnected; completion still
        // counts, there is just nobody left to read it
        let _ = tx.send(self.restore_names(notifications));
        true
    }

    pub fn is_completed(&self) -> bool {
        self.tx.lock().is_none()
    }
}
