//! Immutable configuration snapshots.

use std::collections::HashMap;

use confsync_common::protocol::{ConfigPayload, NotificationMessages};
use serde::{Deserialize, Serialize};

/// One published version of a namespace's configuration.
///
/// Snapshots are never mutated: a repository builds a new one from a fetched
/// payload and swaps the shared reference. Two snapshots are the same version
/// iff their release keys are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub app_id: String,
    pub cluster: String,
    pub namespace: String,
    pub release_key: String,
    pub configurations: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_messages: Option<NotificationMessages>,
}

impl ConfigSnapshot {
    pub fn from_payload(payload: ConfigPayload, messages: Option<NotificationMessages>) -> Self {
        Self {
            app_id: payload.app_id,
            cluster: payload.cluster,
            namespace: payload.namespace_name,
            release_key: payload.release_key,
            configurations: payload.configurations,
            notification_messages: messages,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.configurations.get(key).map(String::as_str)
    }

    pub fn same_release(&self, other: &ConfigSnapshot) -> bool {
        self.release_key == other.release_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(release_key: &str) -> ConfigPayload {
        ConfigPayload {
            app_id: "demo".to_string(),
            cluster: "default".to_string(),
            namespace_name: "application".to_string(),
            configurations: HashMap::from([("k".to_string(), "v".to_string())]),
            release_key: release_key.to_string(),
        }
    }

    #[test]
    fn test_from_payload() {
        let snapshot = ConfigSnapshot::from_payload(payload("r1"), None);
        assert_eq!(snapshot.namespace, "application");
        assert_eq!(snapshot.get("k"), Some("v"));
        assert_eq!(snapshot.get("missing"), None);
    }

    #[test]
    fn test_release_equality() {
        let a = ConfigSnapshot::from_payload(payload("r1"), None);
        let b = ConfigSnapshot::from_payload(payload("r1"), None);
        let c = ConfigSnapshot::from_payload(payload("r2"), None);
        assert!(a.same_release(&b));
        assert!(!a.same_release(&c));
    }

    #[test]
    fn test_serde_roundtrip() {
        let snapshot = ConfigSnapshot::from_payload(payload("r1"), None);
        let body = serde_json::to_string(&snapshot).unwrap();
        let parsed: ConfigSnapshot = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
