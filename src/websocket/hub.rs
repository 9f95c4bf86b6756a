//! WebSocket Connection Hub
//!
//! Owns the registry and the dispatch router for the lifetime of the server.
//! Constructed at startup, shared through `AppState`, and shut down
//! explicitly after the HTTP listener stops.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::error::{CloseReason, RegistryError};
use super::messages::{Message, UserId};
use super::registry::ConnectionRegistry;
use super::router::{DeliveryReport, DispatchRouter};
use super::session::{Mailbox, SessionHandle};

/// Configuration for the connection hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Outbound queue length per connection before it is evicted
    pub mailbox_capacity: usize,
    /// Maximum topics a single connection may subscribe to
    pub max_subscriptions: usize,
    /// Largest inbound frame accepted, in bytes
    pub max_message_size: usize,
    /// How often quiet connections are pinged
    pub ping_interval: Duration,
    /// Inbound silence after which a connection is considered dead
    pub pong_timeout: Duration,
    /// Deadline for a single frame write
    pub write_timeout: Duration,
    /// How long shutdown waits for sessions to close
    pub shutdown_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            mailbox_capacity: 256,
            max_subscriptions: 64,
            max_message_size: 512,
            ping_interval: Duration::from_secs(54),
            pong_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of [`ConnectionHub::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions registered when shutdown began, including any already closing
    pub closed: usize,
    /// Sessions still registered at the deadline and removed forcibly
    pub forced: usize,
}

/// Manages all WebSocket connections and message fan-out
pub struct ConnectionHub {
    registry: Arc<ConnectionRegistry>,
    router: DispatchRouter,
    config: HubConfig,
}

impl ConnectionHub {
    /// Create a new connection hub
    pub fn new(config: HubConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(&config));
        Self {
            router: DispatchRouter::new(Arc::clone(&registry)),
            registry,
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Allocate a mailbox and register a session for it
    pub async fn open_session(
        &self,
        identity: Option<UserId>,
    ) -> Result<(Arc<SessionHandle>, Mailbox), RegistryError> {
        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity);
        let handle = self.registry.register(identity, tx).await?;
        Ok((handle, rx))
    }

    /// New sensor data was recorded for a device
    pub async fn publish_telemetry(
        &self,
        topic: &str,
        payload: Value,
        recorded_at: DateTime<Utc>,
    ) -> DeliveryReport {
        let message = Message::telemetry(topic, payload, recorded_at);
        self.router.send_to_topic(topic, message).await
    }

    /// A device changed state
    pub async fn publish_status(&self, topic: &str, payload: Value) -> DeliveryReport {
        self.router
            .send_to_topic(topic, Message::status(topic, payload))
            .await
    }

    /// Ownership-scoped event; broadcast when no identity is given
    pub async fn publish_notification(
        &self,
        identity: Option<UserId>,
        payload: Map<String, Value>,
    ) -> DeliveryReport {
        let message = Message::notification(payload);
        match identity {
            Some(identity) => self.router.send_to_identity(identity, message).await,
            None => self.router.broadcast(message).await,
        }
    }

    /// Get the current connection count
    pub async fn active_connection_count(&self) -> usize {
        self.registry.count().await
    }

    pub async fn connection_count_for_identity(&self, identity: UserId) -> usize {
        self.registry.count_for_identity(identity).await
    }

    pub fn is_accepting(&self) -> bool {
        self.registry.is_accepting()
    }

    /// Close every session and wait, bounded by `shutdown_timeout`, for them
    /// to unregister. Stragglers are removed forcibly.
    pub async fn shutdown(&self) -> ShutdownReport {
        let closed = self.registry.close_all(CloseReason::Shutdown).await;
        tracing::info!(sessions = closed, "Closing WebSocket sessions");

        let forced = if self
            .registry
            .wait_until_empty(self.config.shutdown_timeout)
            .await
        {
            0
        } else {
            let forced = self.registry.unregister_all().await;
            tracing::warn!(
                sessions = forced,
                timeout = ?self.config.shutdown_timeout,
                "WebSocket sessions did not close in time, removed forcibly"
            );
            forced
        };

        ShutdownReport { closed, forced }
    }
}
