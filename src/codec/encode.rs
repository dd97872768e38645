//! MQTT Packet Encoder
//!
//! Every packet is written in two steps: the remaining length is computed
//! from the packet fields, then the header and body are written. The number
//! of body bytes actually written must equal the computed length; a mismatch
//! is a bug in this module and trips a debug assertion.

use bytes::{BufMut, BytesMut};

use super::{variable_int_len, write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, ProtocolVersion, Publish, QoS, SubAck, Subscribe,
    Unsubscribe,
};

/// MQTT Packet Encoder
pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
        }
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => encode_connect(p, buf),
            Packet::ConnAck(p) => encode_connack(p, buf),
            Packet::Publish(p) => encode_publish(p, buf),
            Packet::PubAck(p) => encode_ack(0x40, p.packet_id, buf),
            Packet::PubRec(p) => encode_ack(0x50, p.packet_id, buf),
            Packet::PubRel(p) => encode_ack(0x62, p.packet_id, buf),
            Packet::PubComp(p) => encode_ack(0x70, p.packet_id, buf),
            Packet::Subscribe(p) => encode_subscribe(p, buf),
            Packet::SubAck(p) => encode_suback(p, buf),
            Packet::Unsubscribe(p) => encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => encode_ack(0xB0, p.packet_id, buf),
            Packet::PingReq => encode_empty(0xC0, buf),
            Packet::PingResp => encode_empty(0xD0, buf),
            Packet::Disconnect => encode_empty(0xE0, buf),
        }
    }

    /// Encoded size of a packet, header included
    pub fn encoded_len(&self, packet: &Packet) -> usize {
        let remaining = match packet {
            Packet::Connect(p) => connect_remaining_length(p),
            Packet::ConnAck(_) => 2,
            Packet::Publish(p) => publish_remaining_length(p),
            Packet::PubAck(_)
            | Packet::PubRec(_)
            | Packet::PubRel(_)
            | Packet::PubComp(_)
            | Packet::UnsubAck(_) => 2,
            Packet::Subscribe(p) => {
                2 + p
                    .subscriptions
                    .iter()
                    .map(|s| 2 + s.filter.len() + 1)
                    .sum::<usize>()
            }
            Packet::SubAck(p) => 2 + p.return_codes.len(),
            Packet::Unsubscribe(p) => 2 + p.filters.iter().map(|f| 2 + f.len()).sum::<usize>(),
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
        };
        1 + variable_int_len(remaining as u32) + remaining
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V311)
    }
}

/// Write the fixed header and return the buffer length where the body starts
fn write_header(
    buf: &mut BytesMut,
    first_byte: u8,
    remaining_length: usize,
) -> Result<usize, EncodeError> {
    buf.put_u8(first_byte);
    write_variable_int(buf, remaining_length as u32)?;
    buf.reserve(remaining_length);
    Ok(buf.len())
}

#[inline]
fn check_body(buf: &BytesMut, body_start: usize, remaining_length: usize) {
    debug_assert_eq!(
        buf.len() - body_start,
        remaining_length,
        "encoded body length differs from computed remaining length"
    );
}

fn encode_empty(first_byte: u8, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(first_byte);
    buf.put_u8(0x00);
    Ok(())
}

fn encode_ack(first_byte: u8, packet_id: u16, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(first_byte);
    buf.put_u8(0x02);
    buf.put_u16(packet_id);
    Ok(())
}

fn connect_remaining_length(packet: &Connect) -> usize {
    // Protocol name, level, flags, keep alive
    let mut len = 2 + packet.protocol_version.protocol_name().len() + 1 + 1 + 2;
    len += 2 + packet.client_id.len();
    if let Some(ref will) = packet.will {
        len += 2 + will.topic.len();
        len += 2 + will.payload.len();
    }
    if let Some(ref username) = packet.username {
        len += 2 + username.len();
    }
    if let Some(ref password) = packet.password {
        len += 2 + password.len();
    }
    len
}

fn encode_connect(packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let remaining_length = connect_remaining_length(packet);
    let body_start = write_header(buf, 0x10, remaining_length)?;

    write_string(buf, packet.protocol_version.protocol_name())?;
    buf.put_u8(packet.protocol_version as u8);

    let mut connect_flags: u8 = 0;
    if packet.clean_session {
        connect_flags |= 0x02;
    }
    if let Some(ref will) = packet.will {
        connect_flags |= 0x04;
        connect_flags |= (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0x20;
        }
    }
    if packet.password.is_some() {
        connect_flags |= 0x40;
    }
    if packet.username.is_some() {
        connect_flags |= 0x80;
    }
    buf.put_u8(connect_flags);
    buf.put_u16(packet.keep_alive);

    write_string(buf, &packet.client_id)?;

    if let Some(ref will) = packet.will {
        write_string(buf, &will.topic)?;
        write_binary(buf, &will.payload)?;
    }
    if let Some(ref username) = packet.username {
        write_string(buf, username)?;
    }
    if let Some(ref password) = packet.password {
        write_binary(buf, password)?;
    }

    check_body(buf, body_start, remaining_length);
    Ok(())
}

fn encode_connack(packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(0x20);
    buf.put_u8(0x02);
    buf.put_u8(if packet.session_present { 0x01 } else { 0x00 });
    buf.put_u8(packet.return_code as u8);
    Ok(())
}

fn publish_remaining_length(packet: &Publish) -> usize {
    let mut len = 2 + packet.topic.len();
    if packet.qos != QoS::AtMostOnce {
        len += 2;
    }
    len + packet.payload.len()
}

fn encode_publish(packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let packet_id = match (packet.qos, packet.packet_id) {
        (QoS::AtMostOnce, _) => None,
        (_, Some(id)) if id != 0 => Some(id),
        _ => return Err(EncodeError::InvalidPacket("QoS > 0 requires a packet id")),
    };

    let remaining_length = publish_remaining_length(packet);

    let mut first_byte: u8 = 0x30;
    if packet.dup {
        first_byte |= 0x08;
    }
    first_byte |= (packet.qos as u8) << 1;
    if packet.retain {
        first_byte |= 0x01;
    }
    let body_start = write_header(buf, first_byte, remaining_length)?;

    write_string(buf, &packet.topic)?;
    if let Some(id) = packet_id {
        buf.put_u16(id);
    }
    buf.put_slice(&packet.payload);

    check_body(buf, body_start, remaining_length);
    Ok(())
}

fn encode_subscribe(packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    if packet.subscriptions.is_empty() {
        return Err(EncodeError::InvalidPacket("SUBSCRIBE without filters"));
    }

    let remaining_length = 2 + packet
        .subscriptions
        .iter()
        .map(|s| 2 + s.filter.len() + 1)
        .sum::<usize>();
    let body_start = write_header(buf, 0x82, remaining_length)?;

    buf.put_u16(packet.packet_id);
    for sub in &packet.subscriptions {
        write_string(buf, &sub.filter)?;
        buf.put_u8(sub.qos);
    }

    check_body(buf, body_start, remaining_length);
    Ok(())
}

fn encode_suback(packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let remaining_length = 2 + packet.return_codes.len();
    let body_start = write_header(buf, 0x90, remaining_length)?;

    buf.put_u16(packet.packet_id);
    for code in &packet.return_codes {
        buf.put_u8(code.to_u8());
    }

    check_body(buf, body_start, remaining_length);
    Ok(())
}

fn encode_unsubscribe(packet: &Unsubscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    if packet.filters.is_empty() {
        return Err(EncodeError::InvalidPacket("UNSUBSCRIBE without filters"));
    }

    let remaining_length = 2 + packet.filters.iter().map(|f| 2 + f.len()).sum::<usize>();
    let body_start = write_header(buf, 0xA2, remaining_length)?;

    buf.put_u16(packet.packet_id);
    for filter in &packet.filters {
        write_string(buf, filter)?;
    }

    check_body(buf, body_start, remaining_length);
    Ok(())
}
