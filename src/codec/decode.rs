//! MQTT Packet Decoder

use std::sync::Arc;

use bytes::Bytes;

use super::{
    read_binary, read_string, read_u16, read_variable_int, DEFAULT_MAX_PACKET_SIZE,
    MAX_REMAINING_LENGTH,
};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolVersion, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, Subscription, UnsubAck,
    Unsubscribe, Will,
};

/// MQTT Packet Decoder
pub struct Decoder {
    /// Maximum remaining length accepted
    max_packet_size: usize,
    /// Protocol version negotiated by CONNECT
    protocol_version: Option<ProtocolVersion>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            protocol_version: None,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = if size == 0 {
            MAX_REMAINING_LENGTH
        } else {
            size.min(MAX_REMAINING_LENGTH)
        };
        self
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = Some(version);
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }

    /// Decode a packet from the buffer
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame, otherwise the packet and the number of bytes it occupied.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        // Checked before waiting for the body so an oversized frame is
        // refused without buffering it
        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => self.decode_connect(flags, body)?,
            2 => decode_connack(flags, body)?,
            3 => decode_publish(flags, body)?,
            4 => Packet::PubAck(PubAck {
                packet_id: decode_ack(flags, 0x00, body)?,
            }),
            5 => Packet::PubRec(PubRec {
                packet_id: decode_ack(flags, 0x00, body)?,
            }),
            6 => Packet::PubRel(PubRel {
                packet_id: decode_ack(flags, 0x02, body)?,
            }),
            7 => Packet::PubComp(PubComp {
                packet_id: decode_ack(flags, 0x00, body)?,
            }),
            8 => decode_subscribe(flags, body)?,
            9 => decode_suback(flags, body)?,
            10 => decode_unsubscribe(flags, body)?,
            11 => Packet::UnsubAck(UnsubAck {
                packet_id: decode_ack(flags, 0x00, body)?,
            }),
            12 | 13 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                if !body.is_empty() {
                    return Err(DecodeError::MalformedPacket("ping carries no payload"));
                }
                if packet_type == 12 {
                    Packet::PingReq
                } else {
                    Packet::PingResp
                }
            }
            14 => self.decode_disconnect(flags, body)?,
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }

    fn decode_connect(&mut self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let mut pos = 0;

        let (protocol_name, len) = read_string(body)?;
        pos += len;

        if pos >= body.len() {
            return Err(DecodeError::MalformedPacket("missing protocol level"));
        }
        let level = body[pos];
        pos += 1;

        // The level must agree with the name: MQIsdp/3 or MQTT/4
        let protocol_version = match (protocol_name, level) {
            ("MQIsdp", 3) => ProtocolVersion::V31,
            ("MQTT", 4) => ProtocolVersion::V311,
            ("MQIsdp", v) | ("MQTT", v) => return Err(DecodeError::InvalidProtocolVersion(v)),
            _ => return Err(DecodeError::InvalidProtocolName),
        };
        self.protocol_version = Some(protocol_version);

        if pos + 3 > body.len() {
            return Err(DecodeError::MalformedPacket("truncated connect header"));
        }
        let connect_flags = body[pos];
        pos += 1;

        // Reserved bit is only enforced from v3.1.1 on
        if protocol_version == ProtocolVersion::V311 && (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let clean_session = (connect_flags & 0x02) != 0;
        let will_flag = (connect_flags & 0x04) != 0;
        let will_qos_bits = (connect_flags >> 3) & 0x03;
        let will_retain = (connect_flags & 0x20) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        let will_qos = QoS::from_u8(will_qos_bits).ok_or(DecodeError::InvalidQoS(will_qos_bits))?;

        if !will_flag && (will_qos_bits != 0 || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }

        if protocol_version == ProtocolVersion::V311 && !username_flag && password_flag {
            return Err(DecodeError::InvalidFlags);
        }

        let keep_alive = read_u16(&body[pos..])?;
        pos += 2;

        let (client_id, len) = read_string(&body[pos..])?;
        pos += len;

        let will = if will_flag {
            let (topic, len) = read_string(&body[pos..])?;
            pos += len;
            let (payload, len) = read_binary(&body[pos..])?;
            pos += len;
            Some(Will {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(payload),
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (s, len) = read_string(&body[pos..])?;
            pos += len;
            Some(s.to_string())
        } else {
            None
        };

        let password = if password_flag {
            let (data, len) = read_binary(&body[pos..])?;
            pos += len;
            Some(Bytes::copy_from_slice(data))
        } else {
            None
        };

        if pos != body.len() {
            return Err(DecodeError::MalformedPacket("trailing bytes after connect payload"));
        }

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id: client_id.to_string(),
            clean_session,
            keep_alive,
            username,
            password,
            will,
        })))
    }

    fn decode_disconnect(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        // v3.1 servers historically ignore the reserved nibble
        if flags != 0 && self.protocol_version != Some(ProtocolVersion::V31) {
            return Err(DecodeError::InvalidFlags);
        }
        if !body.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "DISCONNECT must have zero remaining length",
            ));
        }
        Ok(Packet::Disconnect)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_connack(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() != 2 {
        return Err(DecodeError::MalformedPacket("CONNACK must be 2 bytes"));
    }
    if (body[0] & 0xFE) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let return_code =
        ConnectReturnCode::from_u8(body[1]).ok_or(DecodeError::InvalidReturnCode(body[1]))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: (body[0] & 0x01) != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = (flags & 0x01) != 0;

    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    let mut pos = 0;
    let (topic, len) = read_string(body)?;
    pos += len;

    let packet_id = if qos != QoS::AtMostOnce {
        let id = read_u16(&body[pos..])?;
        if id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }
        pos += 2;
        Some(id)
    } else {
        None
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: Arc::from(topic),
        packet_id,
        payload: Bytes::copy_from_slice(&body[pos..]),
    }))
}

/// Decode the packet identifier of a two-byte acknowledgment
fn decode_ack(flags: u8, expected_flags: u8, body: &[u8]) -> Result<u16, DecodeError> {
    if flags != expected_flags {
        return Err(DecodeError::InvalidFlags);
    }
    if body.len() != 2 {
        return Err(DecodeError::MalformedPacket(
            "acknowledgment must carry only a packet id",
        ));
    }
    read_u16(body)
}

fn decode_subscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }

    let packet_id = read_u16(body)?;
    if packet_id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }

    let mut pos = 2;
    let mut subscriptions = Vec::new();
    while pos < body.len() {
        let (filter, len) = read_string(&body[pos..])?;
        pos += len;

        if pos >= body.len() {
            return Err(DecodeError::MalformedPacket("missing requested QoS"));
        }
        let qos = body[pos];
        pos += 1;

        subscriptions.push(Subscription {
            filter: filter.to_string(),
            qos,
        });
    }

    if subscriptions.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "SUBSCRIBE must have at least one topic",
        ));
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions,
    }))
}

fn decode_suback(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let packet_id = read_u16(body)?;
    let return_codes = body[2..]
        .iter()
        .map(|&b| SubscribeReturnCode::from_u8(b).ok_or(DecodeError::InvalidReturnCode(b)))
        .collect::<Result<Vec<_>, _>>()?;

    if return_codes.is_empty() {
        return Err(DecodeError::MalformedPacket("SUBACK without return codes"));
    }

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0x02 {
        return Err(DecodeError::InvalidFlags);
    }

    let packet_id = read_u16(body)?;
    if packet_id == 0 {
        return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
    }

    let mut pos = 2;
    let mut filters = Vec::new();
    while pos < body.len() {
        let (filter, len) = read_string(&body[pos..])?;
        pos += len;
        filters.push(filter.to_string());
    }

    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket(
            "UNSUBSCRIBE must have at least one topic",
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}
