//! Topic Index
//!
//! Reverse index from topic (device id) to the connections subscribed to it.
//! The index holds no lock of its own; it lives inside the registry tables
//! and is mutated under the registry's write lock together with each
//! connection's own subscription set.

use std::collections::{HashMap, HashSet};

use super::error::ProtocolError;
use super::session::SessionId;

/// Longest accepted topic, in bytes
pub const MAX_TOPIC_LEN: usize = 128;

/// Check that a device id is usable as a topic
pub fn validate_topic(topic: &str) -> Result<(), ProtocolError> {
    let valid = !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LEN
        && topic.trim() == topic
        && !topic.chars().any(char::is_control);

    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidTopic(topic.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct TopicIndex {
    topics: HashMap<String, HashSet<SessionId>>,
}

impl TopicIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the connection was already listed under the topic
    pub fn insert(&mut self, topic: &str, id: &SessionId) -> bool {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(id.clone())
    }

    /// Returns false if the connection was not listed under the topic
    pub fn remove(&mut self, topic: &str, id: &SessionId) -> bool {
        let Some(subscribers) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = subscribers.remove(id);
        // Clean up empty topic entries
        if subscribers.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    /// Remove a connection from every listed topic
    pub fn remove_all<'a>(&mut self, id: &SessionId, topics: impl IntoIterator<Item = &'a String>) {
        for topic in topics {
            self.remove(topic, id);
        }
    }

    pub fn subscribers(&self, topic: &str) -> impl Iterator<Item = &SessionId> {
        self.topics.get(topic).into_iter().flatten()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(HashSet::len).unwrap_or(0)
    }

    pub fn contains(&self, topic: &str, id: &SessionId) -> bool {
        self.topics
            .get(topic)
            .map(|s| s.contains(id))
            .unwrap_or(false)
    }

    /// Number of topics with at least one subscriber
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}
