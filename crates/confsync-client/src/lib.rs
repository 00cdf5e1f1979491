//! Confsync Client
//!
//! Client-side configuration synchronization: a read-only view of remote
//! configuration keyed by namespace, kept fresh with sub-second latency by a
//! shared long-polling notifier and a periodic-refresh fallback.
//!
//! # Overview
//!
//! - [`ConfigClient`] is the root context: it owns service discovery, the
//!   long-poll notifier and the per-namespace repositories.
//! - [`Config`] is the per-namespace facade: typed reads over a merged view
//!   of overrides, the remote snapshot, environment variables and defaults.
//! - [`ConfigChangeListener`] observes diffs between successive snapshots.
//!
//! # Example
//!
//! ```no_run
//! use confsync_client::{ClientSettings, ConfigClient};
//!
//! # async fn demo() -> confsync_common::protocol::Result<()> {
//! let client = ConfigClient::new(ClientSettings::new("demo", "http://meta:8080")).await?;
//! let config = client.config("application").await?;
//! let timeout = config.get_int_property("request.timeout", 200);
//! # let _ = timeout;
//! # Ok(())
//! # }
//! ```
//!
//! # Consistency model
//!
//! Eventually consistent with best-effort freshness: a change published on
//! the server reaches the process at the next long-poll wake (typically well
//! under a second) or, if the notification channel is degraded, at the next
//! periodic refresh. Reads always serve the last good snapshot.

pub mod cache;
pub mod changes;
pub mod client;
pub mod facade;
pub mod locator;
pub mod notifier;
pub mod repository;
pub mod settings;
pub mod snapshot;

pub use changes::{ChangeType, ConfigChangeEvent, ConfigChangeListener, FnListener, PropertyChange};
pub use client::ConfigClient;
pub use facade::Config;
pub use settings::ClientSettings;
pub use snapshot::ConfigSnapshot;
