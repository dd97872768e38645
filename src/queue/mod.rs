//! Per-client outbound message queues
//!
//! A queue decouples publish-time fan-out from the socket writes of the
//! receiving session. Writers are the fan-out path; the only reader is the
//! session's send worker, which is woken through a registered
//! `QueueObserver` whenever a write makes messages available.
//!
//! - `TransientQueue` - bounded, in memory, lives as long as the session
//! - `PersistentQueue` - every write and read is a store round-trip, so
//!   messages survive the session and are delivered on resumption. Writes
//!   past its capacity are refused rather than awaited, since the reader
//!   may stay offline indefinitely

mod persistent;
mod transient;

pub use persistent::PersistentQueue;
pub use transient::TransientQueue;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::message::Message;
use crate::storage::StorageError;

/// Errors returned by queue operations
#[derive(Debug)]
pub enum QueueError {
    /// The queue was closed; no further writes are accepted
    Closed,
    /// The queue holds as many messages as it may; the write was refused
    Full,
    /// The backing store failed
    Storage(StorageError),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "queue closed"),
            Self::Full => write!(f, "queue full"),
            Self::Storage(e) => write!(f, "queue storage error: {}", e),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Closed | Self::Full => None,
        }
    }
}

impl From<StorageError> for QueueError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Notified after every successful write
pub trait QueueObserver: Send + Sync {
    /// `available` is the number of messages waiting after the write
    fn on_queue_ready(&self, client_id: &str, available: usize);
}

/// Outbound message queue of one client
#[async_trait]
pub trait Queue: Send + Sync {
    /// Append a message, waiting for room when the queue is full
    async fn write(&self, message: Message) -> Result<()>;

    /// Take the oldest message without waiting
    async fn read(&self) -> Result<Option<Message>>;

    /// Stop accepting writes and wake every blocked writer
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn is_persistent(&self) -> bool;

    /// Replace the observer notified on writes
    fn register_observer(&self, observer: Arc<dyn QueueObserver>);

    /// Drop the current observer, if any
    fn clear_observer(&self);

    async fn len(&self) -> Result<usize>;
}
