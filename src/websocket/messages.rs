//! WebSocket Message Types
//!
//! Every frame is one JSON object:
//!
//! ```json
//! {"type": "device_data", "data": {...}, "timestamp": "2024-05-01T12:00:00Z", "id": "opt"}
//! ```
//!
//! `type` decides which of `data` / `error` may be present and what `data`
//! must contain. Frames whose shape does not match their declared type are
//! rejected with a [`ProtocolError`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

use super::error::ProtocolError;

/// Authenticated user reference supplied by the identity collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire-level `type` discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    DeviceData,
    DeviceStatus,
    Notification,
    Heartbeat,
    Subscribe,
    Unsubscribe,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::DeviceData => "device_data",
            MessageType::DeviceStatus => "device_status",
            MessageType::Notification => "notification",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Subscribe => "subscribe",
            MessageType::Unsubscribe => "unsubscribe",
            MessageType::Error => "error",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "device_data" => MessageType::DeviceData,
            "device_status" => MessageType::DeviceStatus,
            "notification" => MessageType::Notification,
            "heartbeat" => MessageType::Heartbeat,
            "subscribe" => MessageType::Subscribe,
            "unsubscribe" => MessageType::Unsubscribe,
            "error" => MessageType::Error,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific content of a message
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// New sensor reading for a device
    Telemetry {
        topic: String,
        payload: Value,
        recorded_at: DateTime<Utc>,
    },
    /// Device state change
    Status { topic: String, payload: Value },
    /// Ownership-scoped event, or a server acknowledgement
    Notification { payload: Map<String, Value> },
    /// Keepalive, in either direction
    Heartbeat,
    /// Client request to receive a device's telemetry
    Subscribe { topic: String },
    /// Client request to stop receiving a device's telemetry
    Unsubscribe { topic: String },
    /// Connection-level error report
    Error { reason: String },
}

/// One frame exchanged with a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub struct Message {
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    /// Optional correlation id, echoed on replies
    pub id: Option<String>,
}

impl Message {
    fn now(payload: Payload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
            id: None,
        }
    }

    pub fn telemetry(topic: impl Into<String>, payload: Value, recorded_at: DateTime<Utc>) -> Self {
        Self::now(Payload::Telemetry {
            topic: topic.into(),
            payload,
            recorded_at,
        })
    }

    pub fn status(topic: impl Into<String>, payload: Value) -> Self {
        Self::now(Payload::Status {
            topic: topic.into(),
            payload,
        })
    }

    pub fn notification(payload: Map<String, Value>) -> Self {
        Self::now(Payload::Notification { payload })
    }

    pub fn heartbeat() -> Self {
        Self::now(Payload::Heartbeat)
    }

    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self::now(Payload::Subscribe {
            topic: topic.into(),
        })
    }

    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self::now(Payload::Unsubscribe {
            topic: topic.into(),
        })
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::now(Payload::Error {
            reason: reason.into(),
        })
    }

    /// Attach a correlation id
    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    pub fn message_type(&self) -> MessageType {
        match self.payload {
            Payload::Telemetry { .. } => MessageType::DeviceData,
            Payload::Status { .. } => MessageType::DeviceStatus,
            Payload::Notification { .. } => MessageType::Notification,
            Payload::Heartbeat => MessageType::Heartbeat,
            Payload::Subscribe { .. } => MessageType::Subscribe,
            Payload::Unsubscribe { .. } => MessageType::Unsubscribe,
            Payload::Error { .. } => MessageType::Error,
        }
    }

    /// Parse and validate an inbound text frame
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawMessage =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        Message::try_from(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Untyped frame as it appears on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    /// Clients may omit it; receipt time is used instead.
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

impl TryFrom<RawMessage> for Message {
    type Error = ProtocolError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        let kind = MessageType::parse(&raw.kind)
            .ok_or_else(|| ProtocolError::UnknownType(raw.kind.clone()))?;
        let name = kind.as_str();

        if kind != MessageType::Error && raw.error.is_some() {
            return Err(ProtocolError::UnexpectedField {
                kind: name,
                field: "error",
            });
        }

        let payload = match kind {
            MessageType::DeviceData => {
                let mut data = object_data(name, raw.data)?;
                let topic = device_id(name, &data)?;
                let payload = data.remove("data").ok_or(ProtocolError::MissingField {
                    kind: name,
                    field: "data.data",
                })?;
                let recorded_at = data
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .ok_or(ProtocolError::MissingField {
                        kind: name,
                        field: "data.timestamp",
                    })?;
                Payload::Telemetry {
                    topic,
                    payload,
                    recorded_at,
                }
            }
            MessageType::DeviceStatus => {
                let mut data = object_data(name, raw.data)?;
                let topic = device_id(name, &data)?;
                let payload = data.remove("status").ok_or(ProtocolError::MissingField {
                    kind: name,
                    field: "data.status",
                })?;
                Payload::Status { topic, payload }
            }
            MessageType::Notification => Payload::Notification {
                payload: object_data(name, raw.data)?,
            },
            // Heartbeat bodies carry nothing we act on.
            MessageType::Heartbeat => Payload::Heartbeat,
            MessageType::Subscribe => Payload::Subscribe {
                topic: device_id(name, &object_data(name, raw.data)?)?,
            },
            MessageType::Unsubscribe => Payload::Unsubscribe {
                topic: device_id(name, &object_data(name, raw.data)?)?,
            },
            MessageType::Error => {
                if raw.data.is_some() {
                    return Err(ProtocolError::UnexpectedField {
                        kind: name,
                        field: "data",
                    });
                }
                Payload::Error {
                    reason: raw.error.ok_or(ProtocolError::MissingField {
                        kind: name,
                        field: "error",
                    })?,
                }
            }
        };

        Ok(Message {
            payload,
            timestamp: raw.timestamp.unwrap_or_else(Utc::now),
            id: raw.id,
        })
    }
}

impl From<Message> for RawMessage {
    fn from(msg: Message) -> Self {
        let kind = msg.message_type().as_str().to_string();
        let (data, error) = match msg.payload {
            Payload::Telemetry {
                topic,
                payload,
                recorded_at,
            } => (
                Some(json!({
                    "device_id": topic,
                    "data": payload,
                    "timestamp": recorded_at,
                })),
                None,
            ),
            Payload::Status { topic, payload } => {
                (Some(json!({ "device_id": topic, "status": payload })), None)
            }
            Payload::Notification { payload } => (Some(Value::Object(payload)), None),
            Payload::Heartbeat => (None, None),
            Payload::Subscribe { topic } | Payload::Unsubscribe { topic } => {
                (Some(json!({ "device_id": topic })), None)
            }
            Payload::Error { reason } => (None, Some(reason)),
        };

        RawMessage {
            kind,
            data,
            error,
            timestamp: Some(msg.timestamp),
            id: msg.id,
        }
    }
}

fn object_data(kind: &'static str, data: Option<Value>) -> Result<Map<String, Value>, ProtocolError> {
    match data {
        Some(Value::Object(map)) => Ok(map),
        _ => Err(ProtocolError::MissingField {
            kind,
            field: "data",
        }),
    }
}

fn device_id(kind: &'static str, data: &Map<String, Value>) -> Result<String, ProtocolError> {
    match data.get("device_id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(ProtocolError::MissingField {
            kind,
            field: "data.device_id",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_deserialize_subscribe() {
        let json = r#"{"type": "subscribe", "data": {"device_id": "dev-1"}, "timestamp": "2024-05-01T12:00:00Z", "id": "req-7"}"#;
        let msg = Message::from_json(json).unwrap();
        assert_eq!(
            msg.payload,
            Payload::Subscribe {
                topic: "dev-1".to_string()
            }
        );
        assert_eq!(msg.id.as_deref(), Some("req-7"));
        assert_eq!(msg.timestamp.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_client_message_deserialize_heartbeat_without_timestamp() {
        let msg = Message::from_json(r#"{"type": "heartbeat"}"#).unwrap();
        assert_eq!(msg.message_type(), MessageType::Heartbeat);
        assert!(msg.id.is_none());
    }

    #[test]
    fn test_rejects_unknown_type() {
        let err = Message::from_json(r#"{"type": "reboot"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("reboot".to_string()));
    }

    #[test]
    fn test_rejects_invalid_json() {
        let err = Message::from_json("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
    }

    #[test]
    fn test_subscribe_requires_device_id() {
        let err = Message::from_json(r#"{"type": "subscribe", "data": {}}"#).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::MissingField {
                kind: "subscribe",
                field: "data.device_id"
            }
        );

        let err = Message::from_json(r#"{"type": "unsubscribe", "data": {"device_id": 5}}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField { .. }));
    }

    #[test]
    fn test_rejects_mixed_payload_shapes() {
        let err = Message::from_json(
            r#"{"type": "subscribe", "data": {"device_id": "d"}, "error": "boom"}"#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnexpectedField {
                kind: "subscribe",
                field: "error"
            }
        );

        let err = Message::from_json(r#"{"type": "error", "error": "x", "data": {"a": 1}}"#)
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnexpectedField {
                kind: "error",
                field: "data"
            }
        );
    }

    #[test]
    fn test_server_message_serialize_telemetry() {
        let recorded_at = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let msg = Message::telemetry("dev-1", json!({"temperature": 21.5}), recorded_at)
            .with_id(Some("abc".to_string()));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "device_data");
        assert_eq!(value["data"]["device_id"], "dev-1");
        assert_eq!(value["data"]["data"]["temperature"], 21.5);
        assert_eq!(value["id"], "abc");
        assert!(value["timestamp"].is_string());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_server_message_serialize_error() {
        let value: Value =
            serde_json::from_str(&Message::error("Invalid topic").to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"], "Invalid topic");
        assert!(value.get("data").is_none());
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_status_frame_parses_back() {
        let msg = Message::status("pump-3", json!({"online": false}));
        let parsed = Message::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_notification_requires_object() {
        let err = Message::from_json(r#"{"type": "notification", "data": "hi"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField { field: "data", .. }));
    }
}
