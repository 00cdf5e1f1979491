//! Confsync Notification Hub
//!
//! Server-side counterpart of the client's long-poll notifier. A poll
//! carrying `[{namespace, id}]` either returns immediately — some watched
//! namespace already has a newer notification id — or is parked until a
//! publication arrives or the 60-second hold expires with a 304.
//!
//! # Components
//!
//! - [`hub::NotificationHub`] — the park/publish index
//! - [`deferred::DeferredNotification`] — one-shot completion handle
//! - [`http_server::NotificationServer`] — the axum HTTP surface

pub mod deferred;
pub mod http_server;
pub mod hub;

pub use http_server::NotificationServer;
pub use hub::{NotificationHub, PollOutcome};
