//! Confsync Common Types and Pacing Primitives
//!
//! This crate provides the wire protocol definitions and the outbound
//! request-pacing primitives shared by the confsync client and the
//! notification server.
//!
//! # Overview
//!
//! Confsync is a client-side configuration synchronization library: application
//! processes link the client crate, read configuration by namespace, and are
//! kept fresh by a long-polling notification channel with a periodic-refresh
//! fallback. This crate contains the pieces both sides agree on:
//!
//! - **Protocol Layer**: payloads, notifications and error handling
//! - **Pacing Layer**: token-bucket rate limiting and exponential backoff
//!
//! # Wire format
//!
//! All bodies are JSON with camelCase field names:
//! - `GET /configs/{appId}/{cluster}/{namespace}` → [`protocol::ConfigPayload`]
//! - `GET /notifications/v2` → list of [`protocol::ConfigNotification`]
//! - `GET /services/config` → list of [`protocol::ServiceInstance`]

pub mod backoff;
pub mod protocol;
pub mod rate_limit;

pub use protocol::*;
