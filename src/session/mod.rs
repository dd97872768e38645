//! MQTT Session Management
//!
//! A `Session` is the in-memory state of one live client connection. It is
//! shared by the connection's reader worker, its send worker and the
//! registry. State that must survive the connection (subscriptions, queued
//! and in-flight messages of persistent sessions) lives in the session
//! store, not here.

mod manager;
mod registry;

pub use manager::{ConnectRequest, Connected, SessionManager};
pub use registry::SessionRegistry;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};

use crate::message::{DeliveryState, Direction, Message};
use crate::protocol::{Packet, ProtocolVersion};
use crate::queue::{Queue, QueueError, QueueObserver};
use crate::storage::StorageError;

/// Protocol state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, CONNECT not yet accepted
    New,
    /// CONNACK sent, packets are being processed
    Connected,
    /// The disconnect routine is running
    Disconnecting,
    /// Terminal
    Disconnected,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (New, Connected) | (New, Disconnecting) | (Connected, Disconnecting) | (Disconnecting, Disconnected)
        )
    }
}

/// Why a session was closed from outside its own connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection with the same client id, here or on a peer broker
    TakenOver,
    /// Broker shutdown
    Shutdown,
}

/// Errors returned by session operations
#[derive(Debug)]
pub enum SessionError {
    /// The session's workers are gone
    Closed,
    /// Rejected state transition
    InvalidTransition(SessionState, SessionState),
    Storage(StorageError),
    Queue(QueueError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "session closed"),
            Self::InvalidTransition(from, to) => {
                write!(f, "invalid session transition {:?} -> {:?}", from, to)
            }
            Self::Storage(e) => write!(f, "session storage error: {}", e),
            Self::Queue(e) => write!(f, "session queue error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Queue(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for SessionError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<QueueError> for SessionError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

/// Work items for the send worker
#[derive(Debug)]
pub enum Outbound {
    /// Encode and write a packet
    Packet(Packet),
    /// The client acknowledged an outbound QoS 1 delivery
    Acked(u16),
    /// Deliver a message after every item sent before it, bypassing the queue
    Deliver(Message),
}

/// Receiving ends handed to the connection's send worker
pub struct SessionChannels {
    pub outbound: mpsc::Receiver<Outbound>,
    pub stop: watch::Receiver<bool>,
}

/// Identity and settings fixed at CONNECT
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub client_id: Arc<str>,
    pub session_id: u64,
    pub broker_id: Arc<str>,
    pub protocol_version: ProtocolVersion,
    pub clean_session: bool,
    /// Effective keep alive in seconds (0 = disabled)
    pub keep_alive: u16,
    pub username: Option<String>,
}

/// Live client session
pub struct Session {
    info: SessionInfo,
    state: watch::Sender<SessionState>,
    close: watch::Sender<Option<CloseReason>>,
    stop_sender: watch::Sender<bool>,
    outbound: mpsc::Sender<Outbound>,
    wake: Arc<Notify>,
    queue: Arc<dyn Queue>,
    will: Mutex<Option<Message>>,
}

impl Session {
    /// Create a session in state `New`, with an outbound channel of
    /// `queue_size` packets
    pub fn new(
        info: SessionInfo,
        queue: Arc<dyn Queue>,
        will: Option<Message>,
        queue_size: usize,
    ) -> (Self, SessionChannels) {
        let (outbound, outbound_rx) = mpsc::channel(queue_size.max(1));
        let (stop_sender, stop_rx) = watch::channel(false);
        let (state, _) = watch::channel(SessionState::New);
        let (close, _) = watch::channel(None);

        let session = Self {
            info,
            state,
            close,
            stop_sender,
            outbound,
            wake: Arc::new(Notify::new()),
            queue,
            will: Mutex::new(will),
        };
        let channels = SessionChannels {
            outbound: outbound_rx,
            stop: stop_rx,
        };
        (session, channels)
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn client_id(&self) -> &Arc<str> {
        &self.info.client_id
    }

    pub fn session_id(&self) -> u64 {
        self.info.session_id
    }

    pub fn username(&self) -> Option<&str> {
        self.info.username.as_deref()
    }

    pub fn clean_session(&self) -> bool {
        self.info.clean_session
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    // ========================================================================
    // State machine
    // ========================================================================

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `next` if the state machine allows it
    pub fn transition(&self, next: SessionState) -> Result<(), SessionError> {
        let mut current = SessionState::New;
        let changed = self.state.send_if_modified(|state| {
            current = *state;
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition(current, next))
        }
    }

    /// Wait until the disconnect routine has finished
    pub async fn wait_disconnected(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Disconnected).await;
    }

    // ========================================================================
    // Close signalling
    // ========================================================================

    /// Ask the reader worker to end the connection; the first reason wins
    pub fn kick(&self, reason: CloseReason) {
        self.close.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close.borrow()
    }

    /// Receiver that changes when the session is kicked
    pub fn kicked(&self) -> watch::Receiver<Option<CloseReason>> {
        self.close.subscribe()
    }

    /// Tell the send worker to flush and exit
    pub fn stop_sender(&self) {
        self.stop_sender.send_replace(true);
    }

    // ========================================================================
    // Outbound path
    // ========================================================================

    /// Hand a packet to the send worker, waiting while its channel is full
    pub async fn send(&self, packet: Packet) -> Result<(), SessionError> {
        self.send_outbound(Outbound::Packet(packet)).await
    }

    pub async fn send_outbound(&self, item: Outbound) -> Result<(), SessionError> {
        self.outbound
            .send(item)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Observer that wakes this session's send worker on queue writes
    pub fn queue_observer(&self) -> Arc<dyn QueueObserver> {
        Arc::new(WakeObserver(self.wake.clone()))
    }

    pub fn wake(&self) -> &Notify {
        &self.wake
    }

    /// Take the will message, leaving none behind
    pub fn take_will(&self) -> Option<Message> {
        self.will.lock().take()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.info.client_id)
            .field("session_id", &self.info.session_id)
            .field("state", &self.state())
            .finish()
    }
}

struct WakeObserver(Arc<Notify>);

impl QueueObserver for WakeObserver {
    fn on_queue_ready(&self, _client_id: &str, _available: usize) {
        self.0.notify_one();
    }
}

// ============================================================================
// In-flight table
// ============================================================================

struct InflightEntry {
    message: Message,
    sent_at: Instant,
}

/// Outbound QoS 1 deliveries awaiting PUBACK, keyed by packet id
///
/// Owned by the send worker.
pub struct InflightTable {
    entries: BTreeMap<u16, InflightEntry>,
    next_id: u16,
}

impl Default for InflightTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InflightTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Next free packet identifier, `None` when all 65535 are in use
    pub fn next_packet_id(&mut self) -> Option<u16> {
        if self.is_full() {
            return None;
        }
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.next_id = 1;
            }
            if !self.entries.contains_key(&id) {
                return Some(id);
            }
        }
    }

    /// Record a sent message; it must carry its packet id
    pub fn insert(&mut self, mut message: Message) -> Option<u16> {
        let packet_id = message.packet_id?;
        message.direction = Direction::Out;
        message.state = DeliveryState::AwaitAck;
        self.entries.insert(
            packet_id,
            InflightEntry {
                message,
                sent_at: Instant::now(),
            },
        );
        Some(packet_id)
    }

    pub fn remove(&mut self, packet_id: u16) -> Option<Message> {
        self.entries.remove(&packet_id).map(|e| e.message)
    }

    /// Messages unacknowledged for at least `retry_interval`, marked as
    /// duplicates and stamped as sent again
    pub fn due(&mut self, now: Instant, retry_interval: Duration) -> Vec<Message> {
        self.entries
            .values_mut()
            .filter(|e| now.saturating_duration_since(e.sent_at) >= retry_interval)
            .map(|e| {
                e.sent_at = now;
                e.message.dup = true;
                e.message.clone()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= u16::MAX as usize
    }
}
