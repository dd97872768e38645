//! Fjall-based session store.
//!
//! Uses fjall (an LSM-tree based embedded database) for local persistence.
//! Per-client records share one partition per kind and are keyed
//! `client_id \0 suffix`, so a prefix scan returns one client's records in
//! key order:
//! - `subscriptions`: suffix is the topic filter
//! - `queued`: suffix is a big-endian sequence number (FIFO order)
//! - `inflight`: suffix is the big-endian packet id

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tracing::debug;

use super::error::{Result, StorageError};
use super::models::{StoredMessage, StoredSession, StoredSubscription};
use super::{MessageValidator, SessionStore};

/// Fjall-based session store
pub struct FjallStore {
    keyspace: Keyspace,
    sessions: PartitionHandle,
    subscriptions: PartitionHandle,
    retained: PartitionHandle,
    queued: PartitionHandle,
    inflight: PartitionHandle,
    /// Next queue sequence number, shared by all clients
    next_seq: AtomicU64,
    /// Queued message count per client, seeded by one prefix scan
    queued_counts: DashMap<String, usize, ahash::RandomState>,
}

impl FjallStore {
    /// Open a fjall store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;

        let sessions = keyspace.open_partition("sessions", PartitionCreateOptions::default())?;
        let subscriptions =
            keyspace.open_partition("subscriptions", PartitionCreateOptions::default())?;
        let retained = keyspace.open_partition("retained", PartitionCreateOptions::default())?;
        let queued = keyspace.open_partition("queued", PartitionCreateOptions::default())?;
        let inflight = keyspace.open_partition("inflight", PartitionCreateOptions::default())?;

        // Continue after the highest sequence already on disk
        let mut next_seq = 0;
        for key in queued.keys() {
            let key = key?;
            if let Some(seq) = seq_from_key(&key) {
                next_seq = next_seq.max(seq + 1);
            }
        }
        debug!("opened fjall store, next queue sequence {}", next_seq);

        Ok(Self {
            keyspace,
            sessions,
            subscriptions,
            retained,
            queued,
            inflight,
            next_seq: AtomicU64::new(next_seq),
            queued_counts: DashMap::default(),
        })
    }

    /// Run `f` on the client's queued count while holding its map entry
    ///
    /// Queue writes for one client are serialized by the entry lock, so the
    /// count always matches the partition.
    fn with_queued_count<R>(
        &self,
        client_id: &str,
        f: impl FnOnce(&mut usize) -> Result<R>,
    ) -> Result<R> {
        let mut count = match self.queued_counts.entry(client_id.to_string()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                let mut len = 0;
                for item in self.queued.prefix(client_prefix(client_id)) {
                    item?;
                    len += 1;
                }
                entry.insert(len)
            }
        };
        f(count.value_mut())
    }

    /// Serialize a value using bincode
    fn serialize<T: bincode::Encode>(value: &T) -> Result<Vec<u8>> {
        bincode::encode_to_vec(value, bincode::config::standard()).map_err(StorageError::from)
    }

    /// Deserialize a value using bincode
    fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(StorageError::from)
    }

    fn scan<T: bincode::Decode<()>>(
        partition: &PartitionHandle,
        client_id: &str,
    ) -> Result<Vec<T>> {
        let mut result = Vec::new();
        for item in partition.prefix(client_prefix(client_id)) {
            let (_, value) = item?;
            result.push(Self::deserialize(&value)?);
        }
        Ok(result)
    }
}

fn client_prefix(client_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(client_id.len() + 1);
    key.extend_from_slice(client_id.as_bytes());
    key.push(0);
    key
}

fn client_key(client_id: &str, suffix: &[u8]) -> Vec<u8> {
    let mut key = client_prefix(client_id);
    key.extend_from_slice(suffix);
    key
}

fn seq_from_key(key: &[u8]) -> Option<u64> {
    let tail: [u8; 8] = key.get(key.len().checked_sub(8)?..)?.try_into().ok()?;
    Some(u64::from_be_bytes(tail))
}

#[async_trait]
impl SessionStore for FjallStore {
    // ========================================================================
    // Sessions
    // ========================================================================

    async fn find_session(&self, client_id: &str) -> Result<Option<StoredSession>> {
        match self.sessions.get(client_id)? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn register_session(&self, session: &StoredSession) -> Result<()> {
        let bytes = Self::serialize(session)?;
        self.sessions.insert(session.client_id.as_str(), bytes)?;
        Ok(())
    }

    async fn update_session(&self, session: &StoredSession) -> Result<()> {
        if !self.sessions.contains_key(&session.client_id)? {
            return Err(StorageError::NotFound(format!(
                "session {}",
                session.client_id
            )));
        }
        self.register_session(session).await
    }

    async fn delete_session(&self, client_id: &str) -> Result<()> {
        let prefix = client_prefix(client_id);
        let mut batch = self.keyspace.batch();
        batch.remove(&self.sessions, client_id);
        for partition in [&self.subscriptions, &self.queued, &self.inflight] {
            for key in partition.prefix(&prefix).map(|kv| kv.map(|(k, _)| k)) {
                batch.remove(partition, key?);
            }
        }
        batch.commit()?;
        self.queued_counts.remove(client_id);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<StoredSession>> {
        let mut result = Vec::new();
        for item in self.sessions.iter() {
            let (_, value) = item?;
            result.push(Self::deserialize(&value)?);
        }
        Ok(result)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    async fn add_subscription(&self, client_id: &str, sub: &StoredSubscription) -> Result<()> {
        let bytes = Self::serialize(sub)?;
        self.subscriptions
            .insert(client_key(client_id, sub.filter.as_bytes()), bytes)?;
        Ok(())
    }

    async fn remove_subscription(&self, client_id: &str, filter: &str) -> Result<bool> {
        let key = client_key(client_id, filter.as_bytes());
        let existed = self.subscriptions.contains_key(&key)?;
        if existed {
            self.subscriptions.remove(key)?;
        }
        Ok(existed)
    }

    async fn find_subscriptions(&self, client_id: &str) -> Result<Vec<StoredSubscription>> {
        Self::scan(&self.subscriptions, client_id)
    }

    // ========================================================================
    // Retained messages
    // ========================================================================

    async fn retain_subscription(
        &self,
        topic: &str,
        message: Option<&StoredMessage>,
    ) -> Result<()> {
        match message {
            Some(msg) => self.retained.insert(topic, Self::serialize(msg)?)?,
            None => self.retained.remove(topic)?,
        }
        Ok(())
    }

    async fn find_retained(&self) -> Result<Vec<StoredMessage>> {
        let mut result = Vec::new();
        for item in self.retained.iter() {
            let (_, value) = item?;
            result.push(Self::deserialize(&value)?);
        }
        Ok(result)
    }

    // ========================================================================
    // Queued messages
    // ========================================================================

    async fn queue_message(&self, client_id: &str, message: &StoredMessage) -> Result<usize> {
        let bytes = Self::serialize(message)?;
        self.with_queued_count(client_id, |count| {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            self.queued
                .insert(client_key(client_id, &seq.to_be_bytes()), bytes)?;
            *count += 1;
            Ok(*count)
        })
    }

    async fn dequeue_message(&self, client_id: &str) -> Result<Option<StoredMessage>> {
        self.with_queued_count(client_id, |count| {
            let Some(item) = self.queued.prefix(client_prefix(client_id)).next() else {
                *count = 0;
                return Ok(None);
            };
            let (key, value) = item?;
            let message = Self::deserialize(&value)?;
            self.queued.remove(key)?;
            *count = count.saturating_sub(1);
            Ok(Some(message))
        })
    }

    async fn queued_len(&self, client_id: &str) -> Result<usize> {
        self.with_queued_count(client_id, |count| Ok(*count))
    }

    // ========================================================================
    // In-flight messages
    // ========================================================================

    async fn insert_message(&self, client_id: &str, message: &StoredMessage) -> Result<()> {
        let packet_id = message
            .packet_id
            .ok_or(StorageError::Invalid("in-flight message without packet id"))?;
        let bytes = Self::serialize(message)?;
        self.inflight
            .insert(client_key(client_id, &packet_id.to_be_bytes()), bytes)?;
        Ok(())
    }

    async fn find_messages(&self, client_id: &str) -> Result<Vec<StoredMessage>> {
        Self::scan(&self.inflight, client_id)
    }

    async fn delete_message(&self, client_id: &str, packet_id: u16) -> Result<bool> {
        let key = client_key(client_id, &packet_id.to_be_bytes());
        let existed = self.inflight.contains_key(&key)?;
        if existed {
            self.inflight.remove(key)?;
        }
        Ok(existed)
    }

    async fn delete_message_with_validator(
        &self,
        client_id: &str,
        validator: &MessageValidator,
    ) -> Result<usize> {
        let prefix = client_prefix(client_id);
        self.with_queued_count(client_id, |count| {
            let mut batch = self.keyspace.batch();
            let mut removed_queued = 0;
            let mut removed_inflight = 0;
            for (partition, removed) in [
                (&self.queued, &mut removed_queued),
                (&self.inflight, &mut removed_inflight),
            ] {
                for item in partition.prefix(&prefix) {
                    let (key, value) = item?;
                    let message: StoredMessage = Self::deserialize(&value)?;
                    if !validator(&message) {
                        batch.remove(partition, key);
                        *removed += 1;
                    }
                }
            }
            batch.commit()?;
            *count = count.saturating_sub(removed_queued);
            Ok(removed_queued + removed_inflight)
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    async fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.flush().await
    }
}
