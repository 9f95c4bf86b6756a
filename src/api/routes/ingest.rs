//! Publish Routes
//!
//! Entry points for producers. Each request is turned into a message and
//! fanned out to the matching WebSocket sessions; nothing is stored.
//!
//! - POST /api/v1/devices/:device_id/data - Telemetry reading
//! - POST /api/v1/devices/:device_id/status - Device status change
//! - POST /api/v1/notifications - Notification for one user or everyone

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use std::sync::Arc;

use crate::api::dto::{NotificationRequest, PublishResponse, StatusRequest, TelemetryRequest};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::websocket::{validate_topic, UserId};

/// POST /api/v1/devices/:device_id/data
pub async fn publish_device_data(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Json(req): Json<TelemetryRequest>,
) -> ApiResult<Json<PublishResponse>> {
    validate_device_id(&device_id)?;
    if !req.data.is_object() {
        return Err(ApiError::Validation(
            "data must be a JSON object".to_string(),
        ));
    }

    let recorded_at = req.timestamp.unwrap_or_else(Utc::now);
    let report = state
        .ws_hub
        .publish_telemetry(&device_id, req.data, recorded_at)
        .await;

    tracing::debug!(
        device_id = %device_id,
        delivered = report.delivered,
        "Published device data"
    );
    Ok(Json(report.into()))
}

/// POST /api/v1/devices/:device_id/status
pub async fn publish_device_status(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> ApiResult<Json<PublishResponse>> {
    validate_device_id(&device_id)?;

    let report = state.ws_hub.publish_status(&device_id, req.status).await;

    tracing::debug!(
        device_id = %device_id,
        delivered = report.delivered,
        "Published device status"
    );
    Ok(Json(report.into()))
}

/// POST /api/v1/notifications
///
/// Without `user_id` the notification goes to every connection.
pub async fn publish_notification(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NotificationRequest>,
) -> ApiResult<Json<PublishResponse>> {
    let identity = req.user_id.map(UserId);
    let report = state.ws_hub.publish_notification(identity, req.data).await;

    tracing::debug!(
        user_id = ?req.user_id,
        delivered = report.delivered,
        "Published notification"
    );
    Ok(Json(report.into()))
}

fn validate_device_id(device_id: &str) -> ApiResult<()> {
    validate_topic(device_id).map_err(|e| ApiError::Validation(e.to_string()))
}
