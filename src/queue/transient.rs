//! Bounded in-memory queue

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use super::{Queue, QueueError, QueueObserver, Result};
use crate::message::Message;

pub struct TransientQueue {
    client_id: Arc<str>,
    capacity: usize,
    messages: Mutex<VecDeque<Message>>,
    /// Signalled when a read frees a slot or the queue closes
    space: Notify,
    closed: AtomicBool,
    observer: RwLock<Option<Arc<dyn QueueObserver>>>,
}

impl TransientQueue {
    pub fn new(client_id: Arc<str>, capacity: usize) -> Self {
        Self {
            client_id,
            capacity: capacity.max(1),
            messages: Mutex::new(VecDeque::new()),
            space: Notify::new(),
            closed: AtomicBool::new(false),
            observer: RwLock::new(None),
        }
    }

    fn notify_ready(&self, available: usize) {
        if let Some(observer) = self.observer.read().as_ref() {
            observer.on_queue_ready(&self.client_id, available);
        }
    }
}

#[async_trait]
impl Queue for TransientQueue {
    async fn write(&self, message: Message) -> Result<()> {
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            // Register before checking so a read in between is not missed
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return Err(QueueError::Closed);
            }

            let available = {
                let mut messages = self.messages.lock();
                if messages.len() < self.capacity {
                    messages.push_back(message.clone());
                    Some(messages.len())
                } else {
                    None
                }
            };

            if let Some(available) = available {
                self.notify_ready(available);
                return Ok(());
            }

            notified.await;
        }
    }

    async fn read(&self) -> Result<Option<Message>> {
        let message = self.messages.lock().pop_front();
        if message.is_some() {
            self.space.notify_one();
        }
        Ok(message)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.space.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn register_observer(&self, observer: Arc<dyn QueueObserver>) {
        *self.observer.write() = Some(observer);
    }

    fn clear_observer(&self) {
        *self.observer.write() = None;
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.messages.lock().len())
    }
}
