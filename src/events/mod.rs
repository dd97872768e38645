//! Event fabric
//!
//! Typed facts about sessions and topics, fanned out to in-process handlers
//! and, in cluster mode, mirrored to other brokers through a
//! `ClusterTransport`. Every event carries the id of the broker that
//! produced it so consumers can tell their own echoes from peer events.

mod bus;
pub mod relay;
mod transport;

pub use bus::{EventBus, EventHandler};
pub use transport::{ClusterTransport, Frame, MemoryTransport, TcpTransport, TransportError};

use std::fmt;

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::protocol::QoS;

/// Wire format version of a mirrored event
const EVENT_WIRE_VERSION: u8 = 1;

/// Event type, one bit each so channel masks can select groups of types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventType {
    SessionCreated = 0x0001,
    SessionDestroyed = 0x0002,
    TopicPublished = 0x0004,
    TopicSubscribed = 0x0008,
    TopicUnsubscribed = 0x0010,
    SessionResumed = 0x0020,
    QuotaChanged = 0x0100,
    AuthChanged = 0x0200,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::SessionCreated,
        EventType::SessionDestroyed,
        EventType::TopicPublished,
        EventType::TopicSubscribed,
        EventType::TopicUnsubscribed,
        EventType::SessionResumed,
        EventType::QuotaChanged,
        EventType::AuthChanged,
    ];

    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.bits() == bits)
    }

    /// Whether this type is routed to the channel selected by `mask`
    pub fn in_mask(self, mask: u32) -> bool {
        self.bits() & mask != 0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SessionCreated => "session-created",
            Self::SessionDestroyed => "session-destroyed",
            Self::TopicPublished => "topic-published",
            Self::TopicSubscribed => "topic-subscribed",
            Self::TopicUnsubscribed => "topic-unsubscribed",
            Self::SessionResumed => "session-resumed",
            Self::QuotaChanged => "quota-changed",
            Self::AuthChanged => "auth-changed",
        };
        f.write_str(s)
    }
}

/// Type-specific event context
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode)]
pub enum EventDetail {
    #[default]
    None,
    /// Session lifecycle events
    Session {
        clean_session: bool,
        protocol_version: u8,
        session_present: bool,
    },
    /// Counter updates
    Quota { counter: String, value: u64 },
    /// Credential changes
    Auth { username: Option<String> },
}

/// Something that happened on some broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,
    /// Broker that produced the event
    pub broker_id: String,
    pub client_id: String,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Whether the client's session outlives its connection
    pub persistent: bool,
    pub detail: EventDetail,
}

#[derive(Encode, Decode)]
struct WireEvent {
    version: u8,
    event_type: u32,
    broker_id: String,
    client_id: String,
    topic: String,
    payload: Vec<u8>,
    qos: u8,
    retain: bool,
    persistent: bool,
    detail: EventDetail,
}

impl Event {
    pub fn new(
        event_type: EventType,
        broker_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            broker_id: broker_id.into(),
            client_id: client_id.into(),
            topic: String::new(),
            payload: Bytes::new(),
            qos: QoS::AtMostOnce,
            retain: false,
            persistent: false,
            detail: EventDetail::None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_message(mut self, payload: Bytes, qos: QoS, retain: bool) -> Self {
        self.payload = payload;
        self.qos = qos;
        self.retain = retain;
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_detail(mut self, detail: EventDetail) -> Self {
        self.detail = detail;
        self
    }

    /// Encode for the cluster transport
    pub fn encode(&self) -> Result<Bytes, TransportError> {
        let wire = WireEvent {
            version: EVENT_WIRE_VERSION,
            event_type: self.event_type.bits(),
            broker_id: self.broker_id.clone(),
            client_id: self.client_id.clone(),
            topic: self.topic.clone(),
            payload: self.payload.to_vec(),
            qos: self.qos as u8,
            retain: self.retain,
            persistent: self.persistent,
            detail: self.detail.clone(),
        };
        bincode::encode_to_vec(&wire, bincode::config::standard())
            .map(Bytes::from)
            .map_err(|e| TransportError::Encode(e.to_string()))
    }

    /// Decode an event received from the cluster transport
    pub fn decode(data: &[u8]) -> Result<Self, TransportError> {
        let (wire, _): (WireEvent, usize) =
            bincode::decode_from_slice(data, bincode::config::standard())
                .map_err(|e| TransportError::Decode(e.to_string()))?;

        if wire.version != EVENT_WIRE_VERSION {
            return Err(TransportError::Decode(format!(
                "unsupported event version {}",
                wire.version
            )));
        }
        let event_type = EventType::from_bits(wire.event_type).ok_or_else(|| {
            TransportError::Decode(format!("unknown event type {:#x}", wire.event_type))
        })?;
        let qos = QoS::from_u8(wire.qos)
            .ok_or_else(|| TransportError::Decode(format!("invalid qos {}", wire.qos)))?;

        Ok(Self {
            event_type,
            broker_id: wire.broker_id,
            client_id: wire.client_id,
            topic: wire.topic,
            payload: Bytes::from(wire.payload),
            qos,
            retain: wire.retain,
            persistent: wire.persistent,
            detail: wire.detail,
        })
    }
}

/// Failure reported by an event handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError(pub String);

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event handler failed: {}", self.0)
    }
}

impl std::error::Error for HandlerError {}

impl From<crate::storage::StorageError> for HandlerError {
    fn from(e: crate::storage::StorageError) -> Self {
        Self(e.to_string())
    }
}

impl From<crate::queue::QueueError> for HandlerError {
    fn from(e: crate::queue::QueueError) -> Self {
        Self(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_bits_are_distinct() {
        let mut seen = 0u32;
        for t in EventType::ALL {
            assert_eq!(seen & t.bits(), 0, "{} overlaps", t);
            seen |= t.bits();
            assert_eq!(EventType::from_bits(t.bits()), Some(t));
        }
        assert_eq!(EventType::from_bits(0x40), None);
    }

    #[test]
    fn test_default_mask_splits_domains() {
        let mask = 0x00FF;
        assert!(EventType::TopicPublished.in_mask(mask));
        assert!(EventType::SessionResumed.in_mask(mask));
        assert!(!EventType::QuotaChanged.in_mask(mask));
        assert!(!EventType::AuthChanged.in_mask(mask));
    }

    #[test]
    fn test_event_wire_form() {
        let event = Event::new(EventType::TopicPublished, "node-a", "c1")
            .with_topic("sensors/room1/temp")
            .with_message(Bytes::from_static(b"21.5"), QoS::AtLeastOnce, true)
            .with_persistent(true)
            .with_detail(EventDetail::Session {
                clean_session: false,
                protocol_version: 4,
                session_present: true,
            });

        let bytes = event.encode().unwrap();
        assert_eq!(Event::decode(&bytes).unwrap(), event);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Event::decode(&[0xff, 0x00, 0x13]),
            Err(TransportError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut bytes = Event::new(EventType::SessionCreated, "b", "c")
            .encode()
            .unwrap()
            .to_vec();
        // The version is the first field and encodes as a single byte
        bytes[0] = 9;
        assert!(Event::decode(&bytes).is_err());
    }
}
