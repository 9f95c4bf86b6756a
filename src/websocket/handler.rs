//! WebSocket Handler
//!
//! Handles WebSocket upgrade requests and hands established sockets to the
//! session driver.

use axum::{
    extract::{
        ws::{Message as WsFrame, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;

use super::hub::ConnectionHub;
use super::messages::{Message, UserId};
use super::session;
use crate::api::{ApiError, ApiResult, AppState};

/// WebSocket upgrade handler
///
/// Identity is resolved before the upgrade; a rejected identity never
/// allocates a session.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Response> {
    let identity = state.identity.resolve(&headers).await?;

    if !state.ws_hub.is_accepting() {
        return Err(ApiError::ServiceUnavailable(
            "Server is shutting down".to_string(),
        ));
    }

    let hub = Arc::clone(&state.ws_hub);
    Ok(ws
        .max_message_size(hub.config().max_message_size)
        .on_failed_upgrade(|e| tracing::warn!(error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| handle_socket(socket, hub, identity)))
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, hub: Arc<ConnectionHub>, identity: Option<UserId>) {
    let (mut sender, receiver) = socket.split();

    let (handle, mailbox) = match hub.open_session(identity).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to register WebSocket connection");
            // Send error message before closing
            if let Ok(text) = Message::error(e.to_string()).to_json() {
                let _ = sender.send(WsFrame::Text(text)).await;
            }
            let _ = sender.send(WsFrame::Close(None)).await;
            return;
        }
    };

    session::run(
        Arc::clone(hub.registry()),
        hub.config().clone(),
        handle,
        mailbox,
        sender,
        receiver,
    )
    .await;
}
