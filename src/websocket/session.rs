//! Connection Session
//!
//! One session per WebSocket connection. The registry owns the authoritative
//! [`SessionHandle`]; the reader and writer tasks spawned by [`run`] only hold
//! an `Arc` to it.
//!
//! State machine: `Connecting -> Active -> Closed`. `Closed` is terminal and
//! is entered exactly once, whichever of read error, write error, liveness
//! timeout, mailbox overflow or shutdown gets there first.

use axum::extract::ws::Message as WsFrame;
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{Map, Value};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::error::{CloseReason, ProtocolError, RegistryError, SessionError};
use super::hub::HubConfig;
use super::messages::{Message, Payload, UserId};
use super::registry::ConnectionRegistry;

/// Unique identifier for a WebSocket connection
pub type SessionId = String;

/// Receiving half of a session's outbound queue
pub type Mailbox = mpsc::Receiver<Arc<Message>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// Why a non-blocking enqueue was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Mailbox at capacity; the caller must tear the session down
    Full,
    /// Session already closed
    Closed,
}

/// Shared view of one live connection
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    identity: Option<UserId>,
    sender: mpsc::Sender<Arc<Message>>,
    active: AtomicBool,
    close_reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
    started: Instant,
    /// Millis since `started`
    last_inbound: AtomicU64,
    last_outbound: AtomicU64,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        identity: Option<UserId>,
        sender: mpsc::Sender<Arc<Message>>,
    ) -> Self {
        Self {
            id,
            identity,
            sender,
            active: AtomicBool::new(false),
            close_reason: OnceLock::new(),
            cancel: CancellationToken::new(),
            connected_at: Utc::now(),
            started: Instant::now(),
            last_inbound: AtomicU64::new(0),
            last_outbound: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> Option<UserId> {
        self.identity
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> SessionState {
        if self.close_reason.get().is_some() {
            SessionState::Closed
        } else if self.active.load(Ordering::Acquire) {
            SessionState::Active
        } else {
            SessionState::Connecting
        }
    }

    /// Mailbox capacity this session was created with
    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub(crate) fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Move to `Closed` and cancel both loops.
    ///
    /// Returns true only for the call that performed the transition.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.close_reason.set(reason).is_err() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Non-blocking enqueue into the mailbox
    pub fn enqueue(&self, message: Arc<Message>) -> Result<(), EnqueueError> {
        if self.state() == SessionState::Closed {
            return Err(EnqueueError::Closed);
        }
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn since(&self, mark: &AtomicU64) -> Duration {
        Duration::from_millis(self.elapsed_ms().saturating_sub(mark.load(Ordering::Relaxed)))
    }

    pub(crate) fn touch_inbound(&self) {
        self.last_inbound.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    pub(crate) fn touch_outbound(&self) {
        self.last_outbound.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    /// Time since the peer last sent anything
    pub fn inbound_idle(&self) -> Duration {
        self.since(&self.last_inbound)
    }

    pub fn outbound_idle(&self) -> Duration {
        self.since(&self.last_outbound)
    }
}

/// Drive a registered session until it closes, then unregister it.
///
/// Spawns one reader and one writer task; whichever finishes first ends the
/// session and the other is aborted.
pub async fn run<Tx, Rx, E>(
    registry: Arc<ConnectionRegistry>,
    config: HubConfig,
    handle: Arc<SessionHandle>,
    mailbox: Mailbox,
    sink: Tx,
    stream: Rx,
) -> CloseReason
where
    Tx: Sink<WsFrame> + Unpin + Send + 'static,
    Tx::Error: Display + Send,
    Rx: Stream<Item = Result<WsFrame, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let mut greeting = Map::new();
    greeting.insert("message".into(), Value::from("Connected successfully"));
    greeting.insert("connection_id".into(), Value::from(handle.id()));
    let _ = handle.enqueue(Arc::new(Message::notification(greeting)));

    let mut send_task = tokio::spawn(write_loop(Arc::clone(&handle), mailbox, sink, config.clone()));

    let reader = Reader {
        registry: Arc::clone(&registry),
        handle: Arc::clone(&handle),
    };
    let mut recv_task = tokio::spawn(reader.read_loop(stream));

    // Wait for either task to complete
    let outcome = tokio::select! {
        res = &mut send_task => {
            recv_task.abort();
            res
        }
        res = &mut recv_task => {
            send_task.abort();
            res
        }
    };

    let reason = match outcome {
        Ok(Ok(())) => CloseReason::PeerClosed,
        Ok(Err(e)) => {
            match &e {
                SessionError::Transport(_) => {
                    tracing::debug!(connection_id = %handle.id(), error = %e, "WebSocket transport error")
                }
                _ => tracing::warn!(connection_id = %handle.id(), error = %e, "Closing WebSocket session"),
            }
            e.close_reason()
        }
        Err(e) => {
            tracing::error!(connection_id = %handle.id(), error = %e, "WebSocket session task failed");
            CloseReason::Transport
        }
    };

    // A reason recorded earlier (eviction, shutdown) wins over how the loops ended.
    handle.close(reason);
    let reason = handle.close_reason().unwrap_or(reason);
    registry.unregister(handle.id()).await;
    reason
}

async fn write_loop<Tx>(
    handle: Arc<SessionHandle>,
    mut mailbox: Mailbox,
    mut sink: Tx,
    config: HubConfig,
) -> Result<(), SessionError>
where
    Tx: Sink<WsFrame> + Unpin + Send,
    Tx::Error: Display + Send,
{
    let start = tokio::time::Instant::now() + config.ping_interval;
    let mut ticker = tokio::time::interval_at(start, config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let deadline = tokio::time::Instant::now()
            + config.pong_timeout.saturating_sub(handle.inbound_idle());

        tokio::select! {
            biased;

            _ = handle.closed() => {
                let _ = tokio::time::timeout(config.write_timeout, sink.send(WsFrame::Close(None))).await;
                return Ok(());
            }
            _ = tokio::time::sleep_until(deadline) => {
                let idle = handle.inbound_idle();
                if idle >= config.pong_timeout {
                    return Err(SessionError::LivenessTimeout(idle));
                }
                // Inbound activity moved the deadline; re-armed on the next pass.
            }
            next = mailbox.recv() => {
                let Some(message) = next else {
                    return Ok(());
                };
                match message.to_json() {
                    Ok(text) => {
                        send_frame(&mut sink, WsFrame::Text(text), config.write_timeout).await?;
                        handle.touch_outbound();
                    }
                    Err(e) => {
                        tracing::error!(connection_id = %handle.id(), error = %e, "Failed to serialize message");
                    }
                }
            }
            _ = ticker.tick() => {
                // Ping quiet connections; a quiet peer must still prove it is alive.
                if handle.outbound_idle() >= config.ping_interval
                    || handle.inbound_idle() >= config.ping_interval
                {
                    send_frame(&mut sink, WsFrame::Ping(Vec::new()), config.write_timeout).await?;
                    handle.touch_outbound();
                }
            }
        }
    }
}

async fn send_frame<Tx>(sink: &mut Tx, frame: WsFrame, write_timeout: Duration) -> Result<(), SessionError>
where
    Tx: Sink<WsFrame> + Unpin,
    Tx::Error: Display,
{
    match tokio::time::timeout(write_timeout, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SessionError::Transport(e.to_string())),
        Err(_) => Err(SessionError::Transport(format!(
            "write timed out after {:?}",
            write_timeout
        ))),
    }
}

struct Reader {
    registry: Arc<ConnectionRegistry>,
    handle: Arc<SessionHandle>,
}

impl Reader {
    async fn read_loop<Rx, E>(self, mut stream: Rx) -> Result<(), SessionError>
    where
        Rx: Stream<Item = Result<WsFrame, E>> + Unpin + Send,
        E: Display + Send,
    {
        while let Some(frame) = stream.next().await {
            let frame = frame.map_err(|e| SessionError::Transport(e.to_string()))?;
            self.handle.touch_inbound();

            match frame {
                WsFrame::Text(text) => {
                    if !self.handle_text(&text).await? {
                        return Ok(());
                    }
                }
                WsFrame::Binary(_) => self.reply_error(ProtocolError::Binary, None)?,
                // Axum answers pings itself; any frame counts as liveness.
                WsFrame::Ping(_) | WsFrame::Pong(_) => {}
                WsFrame::Close(_) => {
                    tracing::debug!(connection_id = %self.handle.id(), "Client requested close");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Returns false once the session is no longer registered
    async fn handle_text(&self, text: &str) -> Result<bool, SessionError> {
        let message = match Message::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(
                    connection_id = %self.handle.id(),
                    error = %e,
                    text = %text,
                    "Invalid client message"
                );
                self.reply_error(e, None)?;
                return Ok(true);
            }
        };

        let kind = message.message_type();
        let id = message.id.clone();
        match message.payload {
            Payload::Subscribe { topic } => {
                match self.registry.subscribe(self.handle.id(), &topic).await {
                    Ok(_) => self.acknowledge("Subscribed successfully", topic, id)?,
                    Err(RegistryError::Protocol(e)) => self.reply_error(e, id)?,
                    Err(_) => return Ok(false),
                }
            }
            Payload::Unsubscribe { topic } => {
                match self.registry.unsubscribe(self.handle.id(), &topic).await {
                    Ok(_) => self.acknowledge("Unsubscribed successfully", topic, id)?,
                    Err(_) => return Ok(false),
                }
            }
            Payload::Heartbeat => self.reply(Message::heartbeat().with_id(id))?,
            _ => self.reply_error(ProtocolError::NotAccepted(kind.as_str()), id)?,
        }
        Ok(true)
    }

    fn acknowledge(&self, text: &str, topic: String, id: Option<String>) -> Result<(), SessionError> {
        let mut data = Map::new();
        data.insert("message".into(), Value::from(text));
        data.insert("device_id".into(), Value::from(topic));
        self.reply(Message::notification(data).with_id(id))
    }

    fn reply_error(&self, error: ProtocolError, id: Option<String>) -> Result<(), SessionError> {
        self.reply(Message::error(error.to_string()).with_id(id))
    }

    /// Queue a reply behind any pending dispatches
    fn reply(&self, message: Message) -> Result<(), SessionError> {
        match self.handle.enqueue(Arc::new(message)) {
            Ok(()) | Err(EnqueueError::Closed) => Ok(()),
            Err(EnqueueError::Full) => Err(SessionError::Backpressure {
                capacity: self.handle.capacity(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;

    fn test_config() -> HubConfig {
        HubConfig {
            ping_interval: Duration::from_millis(40),
            pong_timeout: Duration::from_millis(120),
            write_timeout: Duration::from_millis(200),
            ..HubConfig::default()
        }
    }

    /// In-memory transport: frames written by the session arrive on the
    /// returned receiver, frames pushed into the returned sender are read.
    struct TestPeer {
        outbound: mpsc::UnboundedReceiver<WsFrame>,
        inbound: mpsc::UnboundedSender<Result<WsFrame, String>>,
    }

    type TestSink = std::pin::Pin<Box<dyn Sink<WsFrame, Error = String> + Send>>;
    type TestStream = std::pin::Pin<Box<dyn Stream<Item = Result<WsFrame, String>> + Send>>;

    fn transport() -> (TestSink, TestStream, TestPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<WsFrame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Result<WsFrame, String>>();

        let sink = futures_util::sink::unfold(out_tx, |tx, frame: WsFrame| async move {
            tx.send(frame).map_err(|_| "peer gone".to_string())?;
            Ok::<_, String>(tx)
        });
        let stream = stream::unfold(in_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        (
            Box::pin(sink),
            Box::pin(stream),
            TestPeer {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }

    impl TestPeer {
        fn send_text(&self, text: &str) {
            self.inbound.send(Ok(WsFrame::Text(text.to_string()))).unwrap();
        }

        /// Next text frame, skipping pings
        async fn next_json(&mut self) -> serde_json::Value {
            loop {
                let frame = tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
                    .await
                    .expect("timed out waiting for frame")
                    .expect("transport closed");
                if let WsFrame::Text(text) = frame {
                    return serde_json::from_str(&text).unwrap();
                }
            }
        }
    }

    async fn start(
        registry: &Arc<ConnectionRegistry>,
        identity: Option<UserId>,
    ) -> (Arc<SessionHandle>, tokio::task::JoinHandle<CloseReason>, TestPeer) {
        start_with(registry, identity, test_config()).await
    }

    async fn start_with(
        registry: &Arc<ConnectionRegistry>,
        identity: Option<UserId>,
        config: HubConfig,
    ) -> (Arc<SessionHandle>, tokio::task::JoinHandle<CloseReason>, TestPeer) {
        let (tx, mailbox) = mpsc::channel(config.mailbox_capacity);
        let handle = registry.register(identity, tx).await.unwrap();
        let (sink, stream, peer) = transport();
        let task = tokio::spawn(run(
            Arc::clone(registry),
            config,
            Arc::clone(&handle),
            mailbox,
            sink,
            stream,
        ));
        (handle, task, peer)
    }

    fn registry() -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(&test_config()))
    }

    #[test]
    fn test_close_is_exactly_once() {
        let (tx, _rx) = mpsc::channel(4);
        let handle = SessionHandle::new("s1".into(), None, tx);
        assert_eq!(handle.state(), SessionState::Connecting);
        handle.activate();
        assert_eq!(handle.state(), SessionState::Active);

        assert!(handle.close(CloseReason::LivenessTimeout));
        assert!(!handle.close(CloseReason::Transport));
        assert_eq!(handle.state(), SessionState::Closed);
        assert_eq!(handle.close_reason(), Some(CloseReason::LivenessTimeout));
    }

    #[test]
    fn test_enqueue_reports_full_and_closed() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = SessionHandle::new("s1".into(), None, tx);
        handle.activate();

        assert!(handle.enqueue(Arc::new(Message::heartbeat())).is_ok());
        assert_eq!(
            handle.enqueue(Arc::new(Message::heartbeat())),
            Err(EnqueueError::Full)
        );

        handle.close(CloseReason::Shutdown);
        assert_eq!(
            handle.enqueue(Arc::new(Message::heartbeat())),
            Err(EnqueueError::Closed)
        );
    }

    #[tokio::test]
    async fn test_greeting_then_subscribe_ack() {
        let registry = registry();
        let (handle, _task, mut peer) = start(&registry, Some(UserId(1))).await;

        let greeting = peer.next_json().await;
        assert_eq!(greeting["type"], "notification");
        assert_eq!(greeting["data"]["connection_id"], handle.id());

        peer.send_text(r#"{"type":"subscribe","data":{"device_id":"dev-1"},"id":"r1"}"#);
        let ack = peer.next_json().await;
        assert_eq!(ack["type"], "notification");
        assert_eq!(ack["data"]["message"], "Subscribed successfully");
        assert_eq!(ack["data"]["device_id"], "dev-1");
        assert_eq!(ack["id"], "r1");

        assert_eq!(
            registry.subscriptions_of(handle.id()).await,
            Some(vec!["dev-1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_is_answered_and_session_survives() {
        let registry = registry();
        let (handle, _task, mut peer) = start(&registry, None).await;
        let _ = peer.next_json().await;

        peer.send_text("{not json");
        let err = peer.next_json().await;
        assert_eq!(err["type"], "error");
        assert!(err["error"].as_str().unwrap().starts_with("Invalid message format"));

        peer.send_text(r#"{"type":"device_data","data":{"device_id":"d","data":{},"timestamp":"2024-01-01T00:00:00Z"}}"#);
        let err = peer.next_json().await;
        assert_eq!(err["error"], "Message type device_data cannot be sent by clients");

        peer.send_text(r#"{"type":"heartbeat","id":"hb"}"#);
        let hb = peer.next_json().await;
        assert_eq!(hb["type"], "heartbeat");
        assert_eq!(hb["id"], "hb");

        assert_eq!(handle.state(), SessionState::Active);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_peer_close_unregisters() {
        let registry = registry();
        let (handle, task, peer) = start(&registry, Some(UserId(9))).await;
        registry.subscribe(handle.id(), "dev-1").await.unwrap();

        peer.inbound.send(Ok(WsFrame::Close(None))).unwrap();
        let reason = task.await.unwrap();

        assert_eq!(reason, CloseReason::PeerClosed);
        assert_eq!(registry.count().await, 0);
        assert_eq!(registry.count_for_identity(UserId(9)).await, 0);
        assert!(registry.subscribers("dev-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_read_error_is_fatal() {
        let registry = registry();
        let (_handle, task, peer) = start(&registry, None).await;

        peer.inbound.send(Err("connection reset".to_string())).unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::Transport);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let registry = registry();
        let (_handle, task, mut peer) = start(&registry, None).await;

        let reason = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, CloseReason::LivenessTimeout);
        assert_eq!(registry.count().await, 0);

        // The peer saw at least one ping before the deadline passed.
        let mut saw_ping = false;
        while let Ok(frame) = peer.outbound.try_recv() {
            saw_ping |= matches!(frame, WsFrame::Ping(_));
        }
        assert!(saw_ping);
    }

    #[tokio::test]
    async fn test_liveness_deadline_is_not_rounded_up_to_a_ping_tick() {
        let config = HubConfig {
            ping_interval: Duration::from_millis(300),
            pong_timeout: Duration::from_millis(320),
            ..test_config()
        };
        let registry = registry();
        let started = tokio::time::Instant::now();
        let (_handle, task, _peer) = start_with(&registry, None, config).await;

        let reason = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(reason, CloseReason::LivenessTimeout);
        assert!(elapsed >= Duration::from_millis(300), "closed early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "closed late: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_inbound_activity_pushes_deadline_back() {
        let config = HubConfig {
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_millis(150),
            ..test_config()
        };
        let registry = registry();
        let (handle, task, peer) = start_with(&registry, None, config).await;

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            peer.send_text(r#"{"type":"heartbeat"}"#);
        }
        assert_eq!(handle.state(), SessionState::Active);

        let reason = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, CloseReason::LivenessTimeout);
    }

    #[tokio::test]
    async fn test_pongs_keep_session_alive() {
        let registry = registry();
        let (handle, task, peer) = start(&registry, None).await;

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            peer.inbound.send(Ok(WsFrame::Pong(Vec::new()))).unwrap();
        }
        assert_eq!(handle.state(), SessionState::Active);
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_external_close_sends_close_frame() {
        let registry = registry();
        let (handle, task, mut peer) = start(&registry, None).await;
        let _ = peer.next_json().await;

        handle.close(CloseReason::Shutdown);
        assert_eq!(task.await.unwrap(), CloseReason::Shutdown);

        let mut saw_close = false;
        while let Ok(frame) = peer.outbound.try_recv() {
            saw_close |= matches!(frame, WsFrame::Close(_));
        }
        assert!(saw_close);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_dispatched_messages_arrive_in_order() {
        let registry = registry();
        let (handle, _task, mut peer) = start(&registry, None).await;
        let _ = peer.next_json().await;

        for i in 0..5 {
            let msg = Message::status("dev-1", json!({ "seq": i }));
            handle.enqueue(Arc::new(msg)).unwrap();
        }
        for i in 0..5 {
            let frame = peer.next_json().await;
            assert_eq!(frame["data"]["status"]["seq"], i);
        }
    }
}
