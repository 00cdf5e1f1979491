//! Confsync Wire Types
//!
//! This module defines the JSON bodies exchanged with the config service,
//! the notification endpoint and the meta server. Field names are camelCase
//! on the wire.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Format suffix that clients may append to a namespace name and that the
/// notification server strips before indexing.
pub const PROPERTIES_SUFFIX: &str = ".properties";

/// Sentinel notification id for a namespace the client has never seen a
/// notification for.
pub const NOTIFICATION_ID_PLACEHOLDER: i64 = -1;

/// Configuration body returned by `GET /configs/{appId}/{cluster}/{namespace}`.
///
/// A payload is identified by its `release_key`: two payloads with equal
/// release keys carry byte-equal configurations.
///
/// # Example
///
/// ```
/// use confsync_common::protocol::ConfigPayload;
///
/// let body = r#"{
///     "appId": "demo",
///     "cluster": "default",
///     "namespaceName": "application",
///     "configurations": {"timeout": "500"},
///     "releaseKey": "20260802-r1"
/// }"#;
/// let payload: ConfigPayload = serde_json::from_str(body).unwrap();
/// assert_eq!(payload.release_key, "20260802-r1");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPayload {
    pub app_id: String,
    pub cluster: String,
    pub namespace_name: String,
    #[serde(default)]
    pub configurations: HashMap<String, String>,
    pub release_key: String,
}

/// Per-channel notification ids delivered alongside a change notification.
///
/// Each channel id is monotonically increasing on the server side; clients
/// merge bundles rather than replace them so a stale delivery can never
/// roll a channel backwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessages {
    #[serde(default)]
    pub details: HashMap<String, i64>,
}

impl NotificationMessages {
    /// Merges another bundle into this one, keeping the larger id per channel.
    pub fn merge(&mut self, other: &NotificationMessages) {
        for (channel, id) in &other.details {
            match self.details.get(channel) {
                Some(current) if current >= id => {}
                _ => {
                    self.details.insert(channel.clone(), *id);
                }
            }
        }
    }

    /// Records `id` for `channel` if it is newer than what is already held.
    pub fn put(&mut self, channel: impl Into<String>, id: i64) {
        let channel = channel.into();
        match self.details.get(&channel) {
            Some(current) if *current >= id => {}
            _ => {
                self.details.insert(channel, id);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.details.is_empty()
    }
}

/// One entry of the long-poll protocol, both directions.
///
/// Clients send the list of watched namespaces with the last acknowledged
/// id per namespace; the server answers with the namespaces whose id grew,
/// carrying the new id and the per-channel message bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigNotification {
    pub namespace_name: String,
    pub notification_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<NotificationMessages>,
}

impl ConfigNotification {
    pub fn new(namespace_name: impl Into<String>, notification_id: i64) -> Self {
        Self {
            namespace_name: namespace_name.into(),
            notification_id,
            messages: None,
        }
    }

    pub fn with_messages(mut self, messages: NotificationMessages) -> Self {
        self.messages = Some(messages);
        self
    }
}

/// One config service instance as advertised by the meta server
/// (`GET /services/config`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub instance_id: String,
    pub homepage_url: String,
}
