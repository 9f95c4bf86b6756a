//! Data Transfer Objects
//!
//! Request and response types for the API endpoints.
//! These types are serialized/deserialized to/from JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::websocket::DeliveryReport;

// ============================================
// PUBLISH DTOs
// ============================================

/// Sensor reading recorded for a device
#[derive(Debug, Deserialize)]
pub struct TelemetryRequest {
    /// Reading payload, a JSON object
    pub data: Value,
    /// When the reading was recorded, defaults to now
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Device state change
#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: Value,
}

/// Ownership-scoped event
#[derive(Debug, Deserialize)]
pub struct NotificationRequest {
    /// Target user; omitted means every connection
    #[serde(default)]
    pub user_id: Option<u64>,
    pub data: Map<String, Value>,
}

/// Fan-out result returned by every publish endpoint
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    /// Status: "ok"
    pub status: String,
    #[serde(flatten)]
    pub report: DeliveryReport,
}

impl From<DeliveryReport> for PublishResponse {
    fn from(report: DeliveryReport) -> Self {
        Self {
            status: "ok".to_string(),
            report,
        }
    }
}

// ============================================
// CONNECTION DTOs
// ============================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Active WebSocket connections
    pub active: usize,
    /// Topics with at least one subscriber
    pub topics: usize,
    /// Whether new connections are accepted
    pub accepting: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdentityConnections {
    pub user_id: u64,
    pub connections: usize,
}

// ============================================
// HEALTH DTOs
// ============================================

/// Full health status
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall status: healthy, draining
    pub status: String,
    /// WebSocket hub status
    pub websocket: String,
    /// Active WebSocket connections
    pub connections: usize,
    /// Server uptime in seconds
    pub uptime_seconds: u64,
    /// Application version
    pub version: String,
}
