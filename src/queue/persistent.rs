//! Store-backed queue
//!
//! No local buffering: each write is acknowledged only after the store has
//! accepted it, and each read pulls one record from the store. A write that
//! finds `capacity` messages already stored fails with `QueueError::Full`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use super::{Queue, QueueError, QueueObserver, Result};
use crate::message::Message;
use crate::storage::{SessionStore, StoredMessage};

pub struct PersistentQueue {
    client_id: Arc<str>,
    store: Arc<dyn SessionStore>,
    capacity: usize,
    closed: AtomicBool,
    observer: RwLock<Option<Arc<dyn QueueObserver>>>,
    /// Serializes the length check with the append
    write_lock: Mutex<()>,
}

impl PersistentQueue {
    pub fn new(client_id: Arc<str>, store: Arc<dyn SessionStore>, capacity: usize) -> Self {
        Self {
            client_id,
            store,
            capacity,
            closed: AtomicBool::new(false),
            observer: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Queue for PersistentQueue {
    async fn write(&self, message: Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }

        let available = {
            let _guard = self.write_lock.lock().await;
            if self.store.queued_len(&self.client_id).await? >= self.capacity {
                return Err(QueueError::Full);
            }
            self.store
                .queue_message(&self.client_id, &StoredMessage::from(&message))
                .await?
        };

        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_queue_ready(&self.client_id, available);
        }
        Ok(())
    }

    async fn read(&self) -> Result<Option<Message>> {
        Ok(self
            .store
            .dequeue_message(&self.client_id)
            .await?
            .map(StoredMessage::into_message))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn register_observer(&self, observer: Arc<dyn QueueObserver>) {
        *self.observer.write() = Some(observer);
    }

    fn clear_observer(&self) {
        *self.observer.write() = None;
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.store.queued_len(&self.client_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::protocol::QoS;
    use crate::queue::test_support::CountingObserver;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_messages_outlive_queue_instance() {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let client: Arc<str> = Arc::from("c1");

        let queue = PersistentQueue::new(client.clone(), store.clone(), 10);
        let observer = Arc::new(CountingObserver::default());
        queue.register_observer(observer.clone());
        queue
            .write(Message::new("a", Bytes::from_static(b"1"), QoS::AtLeastOnce, false))
            .await
            .unwrap();
        queue
            .write(Message::new("a", Bytes::from_static(b"2"), QoS::AtLeastOnce, false))
            .await
            .unwrap();
        assert_eq!(observer.last_available.load(Ordering::SeqCst), 2);
        assert!(queue.is_persistent());
        drop(queue);

        let resumed = PersistentQueue::new(client, store, 10);
        assert_eq!(resumed.len().await.unwrap(), 2);
        let first = resumed.read().await.unwrap().unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"1"));
        assert_eq!(first.qos, QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_writes() {
        let queue = PersistentQueue::new(Arc::from("c1"), Arc::new(MemoryStore::new()), 10);
        queue.close();
        let result = queue
            .write(Message::new("a", Bytes::new(), QoS::AtMostOnce, false))
            .await;
        assert!(matches!(result, Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn test_full_queue_refuses_writes_until_read() {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let queue = PersistentQueue::new(Arc::from("c1"), store.clone(), 2);
        let msg = |payload: &'static [u8]| {
            Message::new("a", Bytes::from_static(payload), QoS::AtLeastOnce, false)
        };

        queue.write(msg(b"1")).await.unwrap();
        queue.write(msg(b"2")).await.unwrap();
        assert!(matches!(queue.write(msg(b"3")).await, Err(QueueError::Full)));
        assert_eq!(store.queued_len("c1").await.unwrap(), 2);

        let first = queue.read().await.unwrap().unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"1"));
        queue.write(msg(b"4")).await.unwrap();

        let rest: Vec<Bytes> = vec![
            queue.read().await.unwrap().unwrap().payload,
            queue.read().await.unwrap().unwrap().payload,
        ];
        assert_eq!(rest, vec![Bytes::from_static(b"2"), Bytes::from_static(b"4")]);
        assert!(queue.read().await.unwrap().is_none());
    }
}
