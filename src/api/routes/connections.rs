//! Connection Routes
//!
//! Read-only views of the connection registry.
//!
//! - GET /api/v1/connections - Totals
//! - GET /api/v1/connections/:user_id - Connections of one user

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::api::dto::{ConnectionStats, IdentityConnections};
use crate::api::state::AppState;
use crate::websocket::UserId;

/// GET /api/v1/connections
pub async fn connection_stats(State(state): State<Arc<AppState>>) -> Json<ConnectionStats> {
    let registry = state.ws_hub.registry();
    Json(ConnectionStats {
        active: registry.count().await,
        topics: registry.topic_count().await,
        accepting: registry.is_accepting(),
    })
}

/// GET /api/v1/connections/:user_id
pub async fn identity_connections(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<u64>,
) -> Json<IdentityConnections> {
    Json(IdentityConnections {
        user_id,
        connections: state
            .ws_hub
            .connection_count_for_identity(UserId(user_id))
            .await,
    })
}
