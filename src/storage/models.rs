//! Serializable records kept by session stores.
//!
//! These are storage-friendly versions of runtime types that can be
//! serialized with bincode.

use std::sync::Arc;

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::message::{DeliveryState, Direction, Message};
use crate::protocol::QoS;

/// Stored session identity
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSession {
    pub client_id: String,
    /// Internal identifier, new for every fresh session
    pub session_id: String,
    /// Broker node that owns the session
    pub broker_id: String,
    pub protocol_version: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    /// Whether a client is currently attached
    pub connected: bool,
    /// Unix timestamp in milliseconds of the last change
    pub updated_at: u64,
}

/// Stored subscription
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSubscription {
    /// Topic filter, mount point applied
    pub filter: String,
    pub qos: u8,
}

/// Stored message (queued, in flight or retained)
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
    /// 0 = in, 1 = out
    pub direction: u8,
    /// 0 = queued, 1 = await ack, 2 = await rel, 3 = await comp
    pub state: u8,
    /// Unix timestamp in milliseconds
    pub arrived_at: u64,
}

impl From<&Message> for StoredMessage {
    fn from(msg: &Message) -> Self {
        Self {
            topic: msg.topic.to_string(),
            payload: msg.payload.to_vec(),
            qos: msg.qos as u8,
            retain: msg.retain,
            dup: msg.dup,
            packet_id: msg.packet_id,
            direction: match msg.direction {
                Direction::In => 0,
                Direction::Out => 1,
            },
            state: match msg.state {
                DeliveryState::Queued => 0,
                DeliveryState::AwaitAck => 1,
                DeliveryState::AwaitRel => 2,
                DeliveryState::AwaitComp => 3,
            },
            arrived_at: msg.arrived_at,
        }
    }
}

impl StoredMessage {
    /// Convert back into a runtime message
    ///
    /// Unknown QoS values fall back to QoS 0 rather than failing the read.
    pub fn into_message(self) -> Message {
        Message {
            topic: Arc::from(self.topic),
            payload: Bytes::from(self.payload),
            qos: QoS::from_u8(self.qos).unwrap_or_default(),
            retain: self.retain,
            dup: self.dup,
            packet_id: self.packet_id,
            direction: if self.direction == 0 {
                Direction::In
            } else {
                Direction::Out
            },
            state: match self.state {
                1 => DeliveryState::AwaitAck,
                2 => DeliveryState::AwaitRel,
                3 => DeliveryState::AwaitComp,
                _ => DeliveryState::Queued,
            },
            arrived_at: self.arrived_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_conversion_preserves_fields() {
        let mut msg = Message::new("a/b", Bytes::from_static(b"hello"), QoS::AtLeastOnce, true);
        msg.packet_id = Some(12);
        msg.state = DeliveryState::AwaitAck;
        msg.direction = Direction::Out;

        let stored = StoredMessage::from(&msg);
        assert_eq!(stored.qos, 1);
        assert_eq!(stored.state, 1);
        assert_eq!(stored.into_message(), msg);
    }

    #[test]
    fn test_bincode_roundtrip() {
        let stored = StoredMessage::from(&Message::new(
            "x",
            Bytes::from_static(b"1"),
            QoS::AtMostOnce,
            false,
        ));
        let bytes = bincode::encode_to_vec(&stored, bincode::config::standard()).unwrap();
        let (decoded, _): (StoredMessage, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded, stored);
    }
}
