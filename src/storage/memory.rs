//! In-memory session store.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use dashmap::DashMap;

use super::error::{Result, StorageError};
use super::models::{StoredMessage, StoredSession, StoredSubscription};
use super::{MessageValidator, SessionStore};

/// Process-local store; every map is keyed by client id except `retained`
#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<String, StoredSession>,
    subscriptions: DashMap<String, BTreeMap<String, StoredSubscription>>,
    retained: DashMap<String, StoredMessage>,
    queued: DashMap<String, VecDeque<StoredMessage>>,
    inflight: DashMap<String, BTreeMap<u16, StoredMessage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn find_session(&self, client_id: &str) -> Result<Option<StoredSession>> {
        Ok(self.sessions.get(client_id).map(|s| s.clone()))
    }

    async fn register_session(&self, session: &StoredSession) -> Result<()> {
        self.sessions
            .insert(session.client_id.clone(), session.clone());
        Ok(())
    }

    async fn update_session(&self, session: &StoredSession) -> Result<()> {
        match self.sessions.get_mut(&session.client_id) {
            Some(mut existing) => {
                *existing = session.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!(
                "session {}",
                session.client_id
            ))),
        }
    }

    async fn delete_session(&self, client_id: &str) -> Result<()> {
        self.sessions.remove(client_id);
        self.subscriptions.remove(client_id);
        self.queued.remove(client_id);
        self.inflight.remove(client_id);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<StoredSession>> {
        Ok(self.sessions.iter().map(|s| s.value().clone()).collect())
    }

    async fn add_subscription(&self, client_id: &str, sub: &StoredSubscription) -> Result<()> {
        self.subscriptions
            .entry(client_id.to_string())
            .or_default()
            .insert(sub.filter.clone(), sub.clone());
        Ok(())
    }

    async fn remove_subscription(&self, client_id: &str, filter: &str) -> Result<bool> {
        Ok(self
            .subscriptions
            .get_mut(client_id)
            .map(|mut subs| subs.remove(filter).is_some())
            .unwrap_or(false))
    }

    async fn find_subscriptions(&self, client_id: &str) -> Result<Vec<StoredSubscription>> {
        Ok(self
            .subscriptions
            .get(client_id)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn retain_subscription(
        &self,
        topic: &str,
        message: Option<&StoredMessage>,
    ) -> Result<()> {
        match message {
            Some(msg) => {
                self.retained.insert(topic.to_string(), msg.clone());
            }
            None => {
                self.retained.remove(topic);
            }
        }
        Ok(())
    }

    async fn find_retained(&self) -> Result<Vec<StoredMessage>> {
        Ok(self.retained.iter().map(|m| m.value().clone()).collect())
    }

    async fn queue_message(&self, client_id: &str, message: &StoredMessage) -> Result<usize> {
        let mut queue = self.queued.entry(client_id.to_string()).or_default();
        queue.push_back(message.clone());
        Ok(queue.len())
    }

    async fn dequeue_message(&self, client_id: &str) -> Result<Option<StoredMessage>> {
        Ok(self
            .queued
            .get_mut(client_id)
            .and_then(|mut queue| queue.pop_front()))
    }

    async fn queued_len(&self, client_id: &str) -> Result<usize> {
        Ok(self.queued.get(client_id).map(|q| q.len()).unwrap_or(0))
    }

    async fn insert_message(&self, client_id: &str, message: &StoredMessage) -> Result<()> {
        let packet_id = message
            .packet_id
            .ok_or(StorageError::Invalid("in-flight message without packet id"))?;
        self.inflight
            .entry(client_id.to_string())
            .or_default()
            .insert(packet_id, message.clone());
        Ok(())
    }

    async fn find_messages(&self, client_id: &str) -> Result<Vec<StoredMessage>> {
        Ok(self
            .inflight
            .get(client_id)
            .map(|msgs| msgs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_message(&self, client_id: &str, packet_id: u16) -> Result<bool> {
        Ok(self
            .inflight
            .get_mut(client_id)
            .map(|mut msgs| msgs.remove(&packet_id).is_some())
            .unwrap_or(false))
    }

    async fn delete_message_with_validator(
        &self,
        client_id: &str,
        validator: &MessageValidator,
    ) -> Result<usize> {
        let mut removed = 0;
        if let Some(mut queue) = self.queued.get_mut(client_id) {
            let before = queue.len();
            queue.retain(|m| validator(m));
            removed += before - queue.len();
        }
        if let Some(mut msgs) = self.inflight.get_mut(client_id) {
            let before = msgs.len();
            msgs.retain(|_, m| validator(m));
            removed += before - msgs.len();
        }
        Ok(removed)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
