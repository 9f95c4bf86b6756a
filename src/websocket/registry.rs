//! Connection Registry
//!
//! Process-wide table of active sessions, indexed by connection id and by
//! owning identity, plus the topic index. All three live in one [`Tables`]
//! value behind a single `RwLock`, so a structural change (register,
//! unregister, subscribe, unsubscribe) is never observed half-applied.
//! Dispatch takes the read lock; any number of dispatches run in parallel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock, RwLockReadGuard};
use uuid::Uuid;

use super::error::{CloseReason, ProtocolError, RegistryError};
use super::hub::HubConfig;
use super::messages::{Message, UserId};
use super::session::{SessionHandle, SessionId};
use super::topics::{validate_topic, TopicIndex};

struct SessionEntry {
    handle: Arc<SessionHandle>,
    /// Topics this connection is subscribed to
    subscriptions: HashSet<String>,
}

/// Who a dispatch is addressed to
#[derive(Debug, Clone, Copy)]
pub(crate) enum Target<'a> {
    All,
    Identity(UserId),
    Topic(&'a str),
}

#[derive(Default)]
pub(crate) struct Tables {
    sessions: HashMap<SessionId, SessionEntry>,
    by_identity: HashMap<UserId, HashSet<SessionId>>,
    topics: TopicIndex,
}

impl Tables {
    pub(crate) fn resolve(&self, target: Target<'_>) -> Vec<&Arc<SessionHandle>> {
        match target {
            Target::All => self.sessions.values().map(|e| &e.handle).collect(),
            Target::Identity(identity) => self.handles(self.by_identity.get(&identity).into_iter().flatten()),
            Target::Topic(topic) => self.handles(self.topics.subscribers(topic)),
        }
    }

    fn handles<'a>(&'a self, ids: impl Iterator<Item = &'a SessionId>) -> Vec<&'a Arc<SessionHandle>> {
        ids.filter_map(|id| self.sessions.get(id).map(|e| &e.handle))
            .collect()
    }
}

/// Manages all WebSocket sessions and their subscriptions
pub struct ConnectionRegistry {
    tables: RwLock<Tables>,
    max_connections: usize,
    max_subscriptions: usize,
    accepting: AtomicBool,
    /// Current session count, for shutdown waits
    active: watch::Sender<usize>,
}

impl ConnectionRegistry {
    pub fn new(config: &HubConfig) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            tables: RwLock::new(Tables::default()),
            max_connections: config.max_connections,
            max_subscriptions: config.max_subscriptions,
            accepting: AtomicBool::new(true),
            active,
        }
    }

    /// Register a new session
    ///
    /// The returned handle is Active and visible to dispatch immediately.
    /// Fails once `max_connections` sessions exist or after shutdown began.
    pub async fn register(
        &self,
        identity: Option<UserId>,
        sender: mpsc::Sender<Arc<Message>>,
    ) -> Result<Arc<SessionHandle>, RegistryError> {
        let mut tables = self.tables.write().await;

        if !self.is_accepting() {
            return Err(RegistryError::ShuttingDown);
        }
        if tables.sessions.len() >= self.max_connections {
            return Err(RegistryError::TooManyConnections {
                limit: self.max_connections,
            });
        }

        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !tables.sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let handle = Arc::new(SessionHandle::new(id.clone(), identity, sender));
        handle.activate();

        if let Some(identity) = identity {
            tables
                .by_identity
                .entry(identity)
                .or_default()
                .insert(id.clone());
        }
        tables.sessions.insert(
            id.clone(),
            SessionEntry {
                handle: Arc::clone(&handle),
                subscriptions: HashSet::new(),
            },
        );
        self.active.send_replace(tables.sessions.len());

        tracing::info!(
            connection_id = %id,
            user_id = ?identity.map(|u| u.0),
            "WebSocket connected"
        );
        Ok(handle)
    }

    /// Remove a session from every index and close it
    ///
    /// Idempotent: returns false if the id is not registered.
    pub async fn unregister(&self, id: &str) -> bool {
        let entry = {
            let mut tables = self.tables.write().await;
            let Some(entry) = tables.sessions.remove(id) else {
                return false;
            };

            if let Some(identity) = entry.handle.identity() {
                if let Some(ids) = tables.by_identity.get_mut(&identity) {
                    ids.remove(id);
                    if ids.is_empty() {
                        tables.by_identity.remove(&identity);
                    }
                }
            }
            let id = id.to_string();
            tables.topics.remove_all(&id, &entry.subscriptions);

            entry.handle.close(CloseReason::Removed);
            self.active.send_replace(tables.sessions.len());
            entry
        };

        tracing::info!(
            connection_id = %id,
            user_id = ?entry.handle.identity().map(|u| u.0),
            reason = %entry.handle.close_reason().unwrap_or(CloseReason::Removed),
            subscriptions = entry.subscriptions.len(),
            connected_secs = (chrono::Utc::now() - entry.handle.connected_at()).num_seconds(),
            "WebSocket disconnected"
        );
        true
    }

    /// Subscribe a session to a topic
    ///
    /// Returns false if it was already subscribed.
    pub async fn subscribe(&self, id: &str, topic: &str) -> Result<bool, RegistryError> {
        validate_topic(topic)?;

        let mut tables = self.tables.write().await;
        let entry = tables
            .sessions
            .get_mut(id)
            .ok_or(RegistryError::ConnectionNotFound)?;

        if entry.subscriptions.contains(topic) {
            return Ok(false);
        }
        if entry.subscriptions.len() >= self.max_subscriptions {
            return Err(ProtocolError::SubscriptionLimit {
                limit: self.max_subscriptions,
            }
            .into());
        }
        entry.subscriptions.insert(topic.to_string());
        let id = entry.handle.id().to_string();
        tables.topics.insert(topic, &id);

        tracing::debug!(connection_id = %id, topic = %topic, "Subscribed to topic");
        Ok(true)
    }

    /// Unsubscribe a session from a topic
    ///
    /// Returns false if it was not subscribed.
    pub async fn unsubscribe(&self, id: &str, topic: &str) -> Result<bool, RegistryError> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .sessions
            .get_mut(id)
            .ok_or(RegistryError::ConnectionNotFound)?;

        if !entry.subscriptions.remove(topic) {
            return Ok(false);
        }
        let id = entry.handle.id().to_string();
        tables.topics.remove(topic, &id);

        tracing::debug!(connection_id = %id, topic = %topic, "Unsubscribed from topic");
        Ok(true)
    }

    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().await
    }

    pub async fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.tables
            .read()
            .await
            .sessions
            .get(id)
            .map(|e| Arc::clone(&e.handle))
    }

    pub async fn all_sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.snapshot(Target::All).await
    }

    pub async fn sessions_for_identity(&self, identity: UserId) -> Vec<Arc<SessionHandle>> {
        self.snapshot(Target::Identity(identity)).await
    }

    pub async fn subscribers(&self, topic: &str) -> Vec<Arc<SessionHandle>> {
        self.snapshot(Target::Topic(topic)).await
    }

    async fn snapshot(&self, target: Target<'_>) -> Vec<Arc<SessionHandle>> {
        self.read()
            .await
            .resolve(target)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Topics a session is subscribed to, sorted
    pub async fn subscriptions_of(&self, id: &str) -> Option<Vec<String>> {
        let tables = self.tables.read().await;
        let entry = tables.sessions.get(id)?;
        let mut topics: Vec<String> = entry.subscriptions.iter().cloned().collect();
        topics.sort();
        Some(topics)
    }

    /// Get the current connection count
    pub async fn count(&self) -> usize {
        self.tables.read().await.sessions.len()
    }

    pub async fn count_for_identity(&self, identity: UserId) -> usize {
        self.tables
            .read()
            .await
            .by_identity
            .get(&identity)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Get subscription count for a topic
    pub async fn subscription_count(&self, topic: &str) -> usize {
        self.tables.read().await.topics.subscriber_count(topic)
    }

    pub async fn topic_count(&self) -> usize {
        self.tables.read().await.topics.topic_count()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Refuse new registrations and close every registered session
    ///
    /// Returns how many sessions were registered. Sessions already closing
    /// (evicted, timed out) are counted but keep their original reason.
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let tables = self.tables.write().await;
        self.accepting.store(false, Ordering::Release);
        for entry in tables.sessions.values() {
            entry.handle.close(reason);
        }
        tables.sessions.len()
    }

    /// Wait until no sessions remain, up to `timeout`
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let mut active = self.active.subscribe();
        let drained = async move {
            while *active.borrow_and_update() != 0 {
                if active.changed().await.is_err() {
                    return false;
                }
            }
            true
        };
        tokio::time::timeout(timeout, drained).await.unwrap_or(false)
    }

    /// Unregister whatever is still registered; returns how many were removed
    pub async fn unregister_all(&self) -> usize {
        let ids: Vec<SessionId> = self.tables.read().await.sessions.keys().cloned().collect();
        let mut removed = 0;
        for id in ids {
            if self.unregister(&id).await {
                removed += 1;
            }
        }
        removed
    }
}
