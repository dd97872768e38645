//! Application messages in flight through the broker
//!
//! A `Message` is created when a PUBLISH arrives (or a will fires) and is
//! shared by the match tree (retained copy), the per-client queues and the
//! in-flight table of the session that is delivering it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::protocol::{Publish, QoS};

/// Which side of the connection a message travels towards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    /// Received from a client
    In,
    /// Being delivered to a client
    #[default]
    Out,
}

/// Delivery progress of a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeliveryState {
    #[default]
    Queued,
    AwaitAck,
    AwaitRel,
    AwaitComp,
}

/// Application payload plus routing metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Packet identifier assigned for the hop this copy belongs to
    pub packet_id: Option<u16>,
    pub direction: Direction,
    pub state: DeliveryState,
    /// Milliseconds since the Unix epoch
    pub arrived_at: u64,
}

impl Message {
    pub fn new(topic: impl Into<Arc<str>>, payload: Bytes, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            retain,
            dup: false,
            packet_id: None,
            direction: Direction::In,
            state: DeliveryState::Queued,
            arrived_at: now_millis(),
        }
    }

    /// Inbound message from a decoded PUBLISH, with the topic already
    /// rewritten for the mount point
    pub fn from_publish(publish: &Publish, topic: Arc<str>) -> Self {
        Self {
            topic,
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
            packet_id: publish.packet_id,
            direction: Direction::In,
            state: DeliveryState::Queued,
            arrived_at: now_millis(),
        }
    }

    /// Copy of this message addressed to one subscriber
    pub fn for_subscriber(&self, qos: QoS) -> Self {
        Self {
            qos,
            dup: false,
            packet_id: None,
            direction: Direction::Out,
            state: DeliveryState::Queued,
            ..self.clone()
        }
    }

    /// Outbound PUBLISH for this message using the given topic
    pub fn to_publish(&self, topic: Arc<str>) -> Publish {
        Publish {
            dup: self.dup,
            qos: self.qos,
            retain: self.retain,
            topic,
            packet_id: if self.qos == QoS::AtMostOnce {
                None
            } else {
                self.packet_id
            },
            payload: self.payload.clone(),
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
