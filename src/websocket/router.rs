//! Dispatch Router
//!
//! Resolves an addressed message to target sessions and enqueues it into each
//! mailbox without waiting on client I/O. A session whose mailbox is full is
//! evicted instead of stalling the caller; other targets are unaffected.

use serde::Serialize;
use std::sync::Arc;

use super::error::CloseReason;
use super::messages::{Message, UserId};
use super::registry::{ConnectionRegistry, Target};
use super::session::EnqueueError;

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Sessions resolved as targets
    pub targeted: usize,
    /// Sessions the message was enqueued for
    pub delivered: usize,
    /// Sessions torn down because their mailbox was full
    pub evicted: usize,
}

pub struct DispatchRouter {
    registry: Arc<ConnectionRegistry>,
}

impl DispatchRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver to every registered session
    pub async fn broadcast(&self, message: Message) -> DeliveryReport {
        self.dispatch(Target::All, message).await
    }

    /// Deliver to every session of one identity; none connected is a no-op
    pub async fn send_to_identity(&self, identity: UserId, message: Message) -> DeliveryReport {
        self.dispatch(Target::Identity(identity), message).await
    }

    /// Deliver to every session subscribed to `topic`
    pub async fn send_to_topic(&self, topic: &str, message: Message) -> DeliveryReport {
        self.dispatch(Target::Topic(topic), message).await
    }

    async fn dispatch(&self, target: Target<'_>, message: Message) -> DeliveryReport {
        let kind = message.message_type();
        let message = Arc::new(message);
        let mut report = DeliveryReport::default();
        let mut evicted = Vec::new();

        {
            let tables = self.registry.read().await;
            for handle in tables.resolve(target) {
                report.targeted += 1;
                match handle.enqueue(Arc::clone(&message)) {
                    Ok(()) => report.delivered += 1,
                    Err(EnqueueError::Full) => {
                        if handle.close(CloseReason::Backpressure) {
                            tracing::warn!(
                                connection_id = %handle.id(),
                                capacity = handle.capacity(),
                                "Mailbox full, disconnecting slow client"
                            );
                        }
                        evicted.push(handle.id().to_string());
                    }
                    // Already tearing down.
                    Err(EnqueueError::Closed) => {}
                }
            }
        }

        // Structural removal needs the write lock, so it waits for the read guard to drop.
        for id in &evicted {
            self.registry.unregister(id).await;
        }
        report.evicted = evicted.len();

        if report.targeted > 0 {
            tracing::trace!(
                message_type = %kind,
                target = ?target,
                targeted = report.targeted,
                delivered = report.delivered,
                evicted = report.evicted,
                "Dispatched message"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::hub::HubConfig;
    use crate::websocket::messages::{MessageType, Payload};
    use crate::websocket::session::{Mailbox, SessionHandle};
    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        router: DispatchRouter,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(ConnectionRegistry::new(&HubConfig::default()));
            Self {
                router: DispatchRouter::new(Arc::clone(&registry)),
                registry,
            }
        }

        async fn connect(&self, identity: Option<u64>, capacity: usize) -> (Arc<SessionHandle>, Mailbox) {
            let (tx, rx) = mpsc::channel(capacity);
            let handle = self
                .registry
                .register(identity.map(UserId), tx)
                .await
                .unwrap();
            (handle, rx)
        }
    }

    fn telemetry(topic: &str) -> Message {
        Message::telemetry(topic, json!({ "temperature": 20.5 }), Utc::now())
    }

    fn drain(rx: &mut Mailbox) -> Vec<Arc<Message>> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_topic_delivery_reaches_only_subscribers() {
        let fx = Fixture::new();
        let (a, mut rx_a) = fx.connect(Some(1), 8).await;
        let (_b, mut rx_b) = fx.connect(Some(1), 8).await;
        fx.registry.subscribe(a.id(), "dev-1").await.unwrap();

        let report = fx.router.send_to_topic("dev-1", telemetry("dev-1")).await;
        assert_eq!(report.targeted, 1);
        assert_eq!(report.delivered, 1);

        let got = drain(&mut rx_a);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message_type(), MessageType::DeviceData);
        assert!(drain(&mut rx_b).is_empty());

        let report = fx.router.send_to_topic("dev-2", telemetry("dev-2")).await;
        assert_eq!(report, DeliveryReport::default());
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let fx = Fixture::new();
        let (a, mut rx_a) = fx.connect(None, 8).await;

        fx.registry.subscribe(a.id(), "dev-1").await.unwrap();
        fx.registry.unsubscribe(a.id(), "dev-1").await.unwrap();

        let report = fx.router.send_to_topic("dev-1", telemetry("dev-1")).await;
        assert_eq!(report.targeted, 0);
        assert!(drain(&mut rx_a).is_empty());

        fx.registry.subscribe(a.id(), "dev-1").await.unwrap();
        fx.router.send_to_topic("dev-1", telemetry("dev-1")).await;
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[tokio::test]
    async fn test_identity_delivery() {
        let fx = Fixture::new();
        let (_a, mut rx_a) = fx.connect(Some(1), 8).await;
        let (_b, mut rx_b) = fx.connect(Some(1), 8).await;
        let (_c, mut rx_c) = fx.connect(Some(2), 8).await;
        let (_anon, mut rx_anon) = fx.connect(None, 8).await;

        let mut data = serde_json::Map::new();
        data.insert("action".into(), json!("device_created"));
        let report = fx
            .router
            .send_to_identity(UserId(1), Message::notification(data.clone()))
            .await;
        assert_eq!(report.delivered, 2);

        for rx in [&mut rx_a, &mut rx_b] {
            let got = drain(rx);
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].payload, Payload::Notification { payload: data.clone() });
        }
        assert!(drain(&mut rx_c).is_empty());
        assert!(drain(&mut rx_anon).is_empty());

        let report = fx
            .router
            .send_to_identity(UserId(42), Message::notification(data))
            .await;
        assert_eq!(report, DeliveryReport::default());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let fx = Fixture::new();
        let mut mailboxes = Vec::new();
        for identity in [Some(1), Some(2), None] {
            mailboxes.push(fx.connect(identity, 8).await.1);
        }

        let report = fx.router.broadcast(Message::heartbeat()).await;
        assert_eq!(report.targeted, 3);
        assert_eq!(report.delivered, 3);
        for rx in &mut mailboxes {
            assert_eq!(drain(rx).len(), 1);
        }
    }

    #[tokio::test]
    async fn test_full_mailbox_evicts_only_that_session() {
        let fx = Fixture::new();
        let (slow, _rx_slow) = fx.connect(Some(7), 2).await;
        let (fast, mut rx_fast) = fx.connect(Some(8), 16).await;
        for id in [slow.id(), fast.id()] {
            fx.registry.subscribe(id, "dev-1").await.unwrap();
            fx.registry.subscribe(id, "dev-2").await.unwrap();
        }

        fx.router.send_to_topic("dev-1", telemetry("dev-1")).await;
        fx.router.send_to_topic("dev-1", telemetry("dev-1")).await;
        let report = fx.router.send_to_topic("dev-1", telemetry("dev-1")).await;

        assert_eq!(report.targeted, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, 1);
        assert_eq!(drain(&mut rx_fast).len(), 3);

        assert_eq!(slow.close_reason(), Some(CloseReason::Backpressure));
        assert!(fx.registry.get(slow.id()).await.is_none());
        assert_eq!(fx.registry.count_for_identity(UserId(7)).await, 0);
        assert_eq!(fx.registry.subscription_count("dev-1").await, 1);
        assert_eq!(fx.registry.subscription_count("dev-2").await, 1);

        let report = fx.router.send_to_topic("dev-1", telemetry("dev-1")).await;
        assert_eq!(report.targeted, 1);
        assert_eq!(report.evicted, 0);
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_preserves_per_session_order() {
        let fx = Arc::new(Fixture::new());
        let (a, mut rx_a) = fx.connect(None, 256).await;
        fx.registry.subscribe(a.id(), "dev-1").await.unwrap();

        let tasks: Vec<_> = (0..4)
            .map(|producer| {
                let fx = Arc::clone(&fx);
                tokio::spawn(async move {
                    for seq in 0..25 {
                        let msg = Message::status("dev-1", json!({ "producer": producer, "seq": seq }));
                        fx.router.send_to_topic("dev-1", msg).await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let got = drain(&mut rx_a);
        assert_eq!(got.len(), 100);

        // Each producer's messages come out in the order it enqueued them.
        let mut last_seq = [-1i64; 4];
        for msg in got {
            let Payload::Status { payload, .. } = &msg.payload else {
                panic!("Expected Status");
            };
            let producer = payload["producer"].as_u64().unwrap() as usize;
            let seq = payload["seq"].as_i64().unwrap();
            assert!(seq > last_seq[producer]);
            last_seq[producer] = seq;
        }
        assert_eq!(last_seq, [24; 4]);
    }
}
