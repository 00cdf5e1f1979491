//! HTTP surface of the notification hub.
//!
//! Routes:
//! - `GET /notifications/v2` — the long-poll endpoint; answers 200 with the
//!   changed namespaces or 304 after the hold timeout
//! - `POST /notifications/{namespace}` — publication pipeline hook; bumps the
//!   namespace id and wakes parked polls
//! - `GET /__health` — liveness probe

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use confsync_common::protocol::{ConfigNotification, ConfsyncError, Result};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::hub::{NotificationHub, PollOutcome};

/// HTTP server wrapping a [`NotificationHub`].
pub struct NotificationServer {
    hub: Arc<NotificationHub>,
}

impl NotificationServer {
    pub fn new(hub: Arc<NotificationHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    /// The axum router; exposed so tests can bind their own listener.
    pub fn router(&self) -> axum::Router {
        axum::Router::new()
            .route("/notifications/v2", get(handle_long_poll))
            .route("/notifications/{namespace}", post(handle_publish))
            .route("/__health", get(health_check))
            .layer(CorsLayer::permissive())
            .with_state(Arc::clone(&self.hub))
    }

    /// Binds `addr` and serves until the process exits.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ConfsyncError::Transport(format!("failed to bind to {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ConfsyncError::Transport(format!("failed to get local addr: {e}")))?;
        info!("notification server listening on {local_addr}");

        axum::serve(listener, app)
            .await
            .map_err(|e| ConfsyncError::Transport(format!("server error: {e}")))?;
        Ok(())
    }
}

/// Handles the long-poll endpoint.
///
/// The watched set arrives as the `notifications` query parameter, a JSON
/// list of `{namespaceName, notificationId}`. The request is answered
/// immediately when a watched namespace already changed, otherwise it is
/// parked until a publication or the hold timeout.
async fn handle_long_poll(
    State(hub): State<Arc<NotificationHub>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(raw) = params.get("notifications") else {
        return (StatusCode::BAD_REQUEST, "missing notifications parameter").into_response();
    };
    let vector: Vec<ConfigNotification> = match serde_json::from_str(raw) {
        Ok(vector) => vector,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("invalid notifications parameter: {err}"),
            )
                .into_response()
        }
    };
    if vector.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty notifications parameter").into_response();
    }

    match hub.poll(vector) {
        PollOutcome::Immediate(notifications) => Json(notifications).into_response(),
        PollOutcome::Parked { receiver, guard: _guard } => {
            // the guard stays alive for the whole wait so a timeout or a
            // dropped connection removes the handle from the hub's indexes
            match tokio::time::timeout(hub.hold_timeout(), receiver).await {
                Ok(Ok(notifications)) => Json(notifications).into_response(),
                _ => StatusCode::NOT_MODIFIED.into_response(),
            }
        }
    }
}

/// Handles the publication hook.
///
/// `notificationId` pins the id explicitly; without it the next id in
/// sequence is assigned.
async fn handle_publish(
    State(hub): State<Arc<NotificationHub>>,
    Path(namespace): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let id = match params.get("notificationId").map(|raw| raw.parse::<i64>()) {
        Some(Ok(id)) => hub.publish(&namespace, id),
        Some(Err(err)) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("invalid notificationId: {err}"),
            )
                .into_response()
        }
        None => hub.publish_next(&namespace),
    };
    Json(ConfigNotification::new(namespace, id)).into_response()
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_creation() {
        let server = NotificationServer::new(NotificationHub::new());
        let _router = server.router();
        assert!(Arc::strong_count(server.hub()) >= 1);
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = health_check().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
