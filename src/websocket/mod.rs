//! WebSocket Real-Time Telemetry Distribution
//!
//! Fans device telemetry and user notifications out to connected clients.
//!
//! ## Architecture
//!
//! - **ConnectionRegistry**: active sessions by connection id and identity,
//!   plus the topic index, under one lock
//! - **DispatchRouter**: resolves targets and enqueues without blocking
//! - **Session**: per-connection reader, writer and liveness loops
//! - **ConnectionHub**: owns the above for the server's lifetime
//! - **Messages**: the validated wire format
//!
//! ## Usage
//!
//! Clients connect to `/api/v1/ws` and subscribe to devices by id:
//!
//! ```javascript
//! const ws = new WebSocket('ws://localhost:8080/api/v1/ws');
//!
//! ws.onopen = () => {
//!   ws.send(JSON.stringify({type: 'subscribe', data: {device_id: 'dev-1'}}));
//! };
//!
//! ws.onmessage = (event) => {
//!   const msg = JSON.parse(event.data);
//!   console.log('Received:', msg);
//! };
//! ```
//!
//! A client that cannot keep up with its mailbox is disconnected; it should
//! reconnect and subscribe again.

mod error;
mod handler;
mod hub;
mod identity;
mod messages;
mod registry;
mod router;
pub mod session;
mod topics;

pub use error::{CloseReason, HandshakeError, ProtocolError, RegistryError, SessionError};
pub use handler::websocket_handler;
pub use hub::{ConnectionHub, HubConfig, ShutdownReport};
pub use identity::{IdentityResolver, TrustedHeaderResolver};
pub use messages::{Message, MessageType, Payload, UserId};
pub use registry::ConnectionRegistry;
pub use router::{DeliveryReport, DispatchRouter};
pub use session::{EnqueueError, Mailbox, SessionHandle, SessionId, SessionState};
pub use topics::{validate_topic, MAX_TOPIC_LEN};
