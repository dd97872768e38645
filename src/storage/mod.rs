//! Session storage collaborator.
//!
//! The broker core only depends on the `SessionStore` contract; the backend
//! is chosen at construction time from configuration:
//! - `MemoryStore` - process-local, lost on restart
//! - `FjallStore` - local LSM-tree storage surviving restarts
//!
//! A store holds four kinds of records per client id: the session identity,
//! its subscriptions, the queue of messages waiting for delivery and the
//! table of in-flight messages keyed by packet id. Retained messages are
//! keyed by topic name.

mod error;
mod fjall;
mod memory;
mod models;


pub use error::{Result, StorageError};
pub use self::fjall::FjallStore;
pub use memory::MemoryStore;
pub use models::{StoredMessage, StoredSession, StoredSubscription};

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{StorageBackendKind, StorageConfig};

/// Predicate deciding whether a stored message may stay
pub type MessageValidator = dyn Fn(&StoredMessage) -> bool + Send + Sync;

/// Storage contract consumed by the session manager and persistent queues
#[async_trait]
pub trait SessionStore: Send + Sync {
    // ========================================================================
    // Sessions
    // ========================================================================

    async fn find_session(&self, client_id: &str) -> Result<Option<StoredSession>>;

    /// Store a new session, replacing any previous record for the client id
    async fn register_session(&self, session: &StoredSession) -> Result<()>;

    /// Update an existing session; fails with `NotFound` when there is none
    async fn update_session(&self, session: &StoredSession) -> Result<()>;

    /// Delete the session together with its subscriptions and messages
    async fn delete_session(&self, client_id: &str) -> Result<()>;

    async fn list_sessions(&self) -> Result<Vec<StoredSession>>;

    // ========================================================================
    // Subscriptions
    // ========================================================================

    async fn add_subscription(&self, client_id: &str, sub: &StoredSubscription) -> Result<()>;

    async fn remove_subscription(&self, client_id: &str, filter: &str) -> Result<bool>;

    async fn find_subscriptions(&self, client_id: &str) -> Result<Vec<StoredSubscription>>;

    // ========================================================================
    // Retained messages
    // ========================================================================

    /// Persist the retained message of `topic`, or clear it with `None`
    async fn retain_subscription(&self, topic: &str, message: Option<&StoredMessage>)
        -> Result<()>;

    async fn find_retained(&self) -> Result<Vec<StoredMessage>>;

    // ========================================================================
    // Queued messages
    // ========================================================================

    /// Append to the client's delivery queue, returning the queue length
    async fn queue_message(&self, client_id: &str, message: &StoredMessage) -> Result<usize>;

    /// Remove and return the oldest queued message
    async fn dequeue_message(&self, client_id: &str) -> Result<Option<StoredMessage>>;

    async fn queued_len(&self, client_id: &str) -> Result<usize>;

    // ========================================================================
    // In-flight messages
    // ========================================================================

    /// Record an in-flight message; it must carry a packet id
    async fn insert_message(&self, client_id: &str, message: &StoredMessage) -> Result<()>;

    /// In-flight messages of a client, in packet id order
    async fn find_messages(&self, client_id: &str) -> Result<Vec<StoredMessage>>;

    async fn delete_message(&self, client_id: &str, packet_id: u16) -> Result<bool>;

    /// Remove every queued or in-flight message of the client that the
    /// validator rejects, returning how many were removed
    async fn delete_message_with_validator(
        &self,
        client_id: &str,
        validator: &MessageValidator,
    ) -> Result<usize>;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Flush pending writes to durable storage
    async fn flush(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Open the store selected by configuration
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn SessionStore>> {
    match config.backend {
        StorageBackendKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackendKind::Fjall => Ok(Arc::new(FjallStore::open(&config.path)?)),
    }
}
