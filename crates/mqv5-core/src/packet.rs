//! MQTT 5.0 control packet types and codec.
//!
//! Every packet starts with a fixed header: one byte carrying the packet type
//! in the high nibble and type-specific flags in the low nibble, followed by
//! the remaining length as a variable byte integer. [`decode_packet`] is
//! partial-read aware: it returns `Ok(None)` until a whole packet is
//! buffered, so callers can keep appending bytes from the stream.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::properties::{
    AckProperties, AuthProperties, ConnackProperties, ConnectProperties, DisconnectProperties,
    PublishProperties, SubscribeProperties, UnsubscribeProperties, WillProperties,
};
use crate::reason::{ReasonCategory, ReasonCode};
use crate::varint;

/// MQTT control packet types (high nibble of the first byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            15 => Ok(PacketType::Auth),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "invalid QoS: {value}"
            ))),
        }
    }
}

/// MQTT 5.0 control packets.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback(Ack),
    Pubrec(Ack),
    Pubrel(Ack),
    Pubcomp(Ack),
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback(Unsuback),
    Pingreq,
    Pingresp,
    Disconnect(Disconnect),
    Auth(Auth),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Puback(_) => PacketType::Puback,
            Packet::Pubrec(_) => PacketType::Pubrec,
            Packet::Pubrel(_) => PacketType::Pubrel,
            Packet::Pubcomp(_) => PacketType::Pubcomp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::Unsuback(_) => PacketType::Unsuback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect(_) => PacketType::Disconnect,
            Packet::Auth(_) => PacketType::Auth,
        }
    }

    /// Packet identifier, or 0 where the packet type carries none.
    pub fn packet_id(&self) -> u16 {
        match self {
            Packet::Publish(p) => p.packet_id.unwrap_or(0),
            Packet::Puback(a)
            | Packet::Pubrec(a)
            | Packet::Pubrel(a)
            | Packet::Pubcomp(a) => a.packet_id,
            Packet::Subscribe(s) => s.packet_id,
            Packet::Suback(s) => s.packet_id,
            Packet::Unsubscribe(u) => u.packet_id,
            Packet::Unsuback(u) => u.packet_id,
            _ => 0,
        }
    }
}

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub keep_alive: u16,
    pub clean_start: bool,
    pub properties: ConnectProperties,
    pub will: Option<Will>,
}

/// Will message carried in the CONNECT payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: WillProperties,
}

/// CONNACK packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Connack {
    pub session_present: bool,
    pub reason_code: ReasonCode,
    pub properties: ConnackProperties,
}

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    /// May be empty when a topic alias is used instead.
    pub topic: String,
    pub packet_id: Option<u16>,
    pub properties: PublishProperties,
    pub payload: Bytes,
}

/// PUBACK / PUBREC / PUBREL / PUBCOMP.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub packet_id: u16,
    pub reason_code: ReasonCode,
    pub properties: AckProperties,
}

impl Ack {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_code: ReasonCode::SUCCESS,
            properties: AckProperties::default(),
        }
    }
}

/// Per-filter SUBSCRIBE options byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
}

impl SubscriptionOptions {
    pub fn from_byte(byte: u8) -> Result<Self> {
        if byte & 0xC0 != 0 {
            return Err(ProtocolError::MalformedPacket(
                "reserved subscription option bits set".into(),
            ));
        }
        Ok(Self {
            qos: QoS::try_from(byte & 0x03)?,
            no_local: byte & 0x04 != 0,
            retain_as_published: byte & 0x08 != 0,
            retain_handling: (byte >> 4) & 0x03,
        })
    }

    pub fn to_byte(self) -> u8 {
        (self.qos as u8)
            | if self.no_local { 0x04 } else { 0 }
            | if self.retain_as_published { 0x08 } else { 0 }
            | (self.retain_handling << 4)
    }
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub properties: SubscribeProperties,
    pub filters: Vec<(String, SubscriptionOptions)>,
}

/// SUBACK packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Suback {
    pub packet_id: u16,
    pub properties: AckProperties,
    pub reason_codes: Vec<ReasonCode>,
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub properties: UnsubscribeProperties,
    pub topics: Vec<String>,
}

/// UNSUBACK packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Unsuback {
    pub packet_id: u16,
    pub properties: AckProperties,
    pub reason_codes: Vec<ReasonCode>,
}

/// DISCONNECT packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Disconnect {
    pub reason_code: ReasonCode,
    pub properties: DisconnectProperties,
}

impl Default for Disconnect {
    fn default() -> Self {
        Self {
            reason_code: ReasonCode::NORMAL_DISCONNECTION,
            properties: DisconnectProperties::default(),
        }
    }
}

/// AUTH packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Auth {
    pub reason_code: ReasonCode,
    pub properties: AuthProperties,
}

// === Decoding ===

/// Byte-range reader over one packet body.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::IncompletePacket { needed: 1, have: 0 });
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_varint(&mut self) -> Result<u32> {
        match varint::decode(&self.buf[self.pos..])? {
            Some((value, consumed)) => {
                self.pos += consumed;
                Ok(value)
            }
            None => Err(ProtocolError::IncompletePacket {
                needed: 1,
                have: self.remaining(),
            }),
        }
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// UTF-8 string with u16 length prefix. Embedded NUL is rejected
    /// per [MQTT-1.5.4-2].
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        if bytes.contains(&0) {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string contains null character".into(),
            ));
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Binary blob with u16 length prefix.
    pub fn read_binary(&mut self) -> Result<Bytes> {
        let len = self.read_u16()? as usize;
        Ok(Bytes::copy_from_slice(self.read_bytes(len)?))
    }

    /// UTF-8 string pair (user property value).
    pub fn read_string_pair(&mut self) -> Result<(String, String)> {
        Ok((self.read_string()?, self.read_string()?))
    }
}

/// Try to decode one complete packet from the front of `buf`.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` on success, `Ok(None)` when
/// more data is needed. `max_packet_size` of 0 means no limit.
pub fn decode_packet(buf: &[u8], max_packet_size: u32) -> Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let fixed = buf[0];
    let flags = fixed & 0x0F;

    let Some((remaining_len, len_bytes)) = varint::decode(&buf[1..])? else {
        return Ok(None);
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len as usize;

    if max_packet_size > 0 && total_len > max_packet_size as usize {
        return Err(ProtocolError::PacketTooLarge {
            size: total_len,
            max: max_packet_size as usize,
        });
    }

    if buf.len() < total_len {
        return Ok(None);
    }

    let packet_type = PacketType::try_from(fixed >> 4)?;

    // Fixed-header flags are reserved for every type but PUBLISH;
    // PUBREL/SUBSCRIBE/UNSUBSCRIBE must carry 0b0010.
    match packet_type {
        PacketType::Publish => {}
        PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe => {
            if flags != 0x02 {
                return Err(ProtocolError::MalformedPacket(format!(
                    "{packet_type:?} fixed header flags must be 0x02, got {flags:#04x}"
                )));
            }
        }
        _ => {
            if flags != 0 {
                return Err(ProtocolError::MalformedPacket(format!(
                    "{packet_type:?} fixed header flags must be 0, got {flags:#04x}"
                )));
            }
        }
    }

    let mut dec = Decoder::new(&buf[header_len..total_len]);

    let packet = match packet_type {
        PacketType::Connect => decode_connect(&mut dec)?,
        PacketType::Connack => decode_connack(&mut dec)?,
        PacketType::Publish => decode_publish(flags, &mut dec)?,
        PacketType::Puback => Packet::Puback(decode_ack(&mut dec, ReasonCategory::Puback)?),
        PacketType::Pubrec => Packet::Pubrec(decode_ack(&mut dec, ReasonCategory::Pubrec)?),
        PacketType::Pubrel => Packet::Pubrel(decode_ack(&mut dec, ReasonCategory::Pubrel)?),
        PacketType::Pubcomp => Packet::Pubcomp(decode_ack(&mut dec, ReasonCategory::Pubcomp)?),
        PacketType::Subscribe => decode_subscribe(&mut dec)?,
        PacketType::Suback => decode_suback(&mut dec)?,
        PacketType::Unsubscribe => decode_unsubscribe(&mut dec)?,
        PacketType::Unsuback => decode_unsuback(&mut dec)?,
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        PacketType::Disconnect => decode_disconnect(&mut dec)?,
        PacketType::Auth => decode_auth(&mut dec)?,
    };

    if !dec.is_empty() {
        return Err(ProtocolError::MalformedPacket(format!(
            "{} trailing bytes after {packet_type:?}",
            dec.remaining()
        )));
    }

    Ok(Some((packet, total_len)))
}

fn decode_connect(dec: &mut Decoder<'_>) -> Result<Packet> {
    let protocol_name = dec.read_string()?;
    if protocol_name != "MQTT" {
        return Err(ProtocolError::MalformedPacket(format!(
            "invalid protocol name: {protocol_name}"
        )));
    }
    let level = dec.read_u8()?;
    if level != 5 {
        return Err(ProtocolError::MalformedPacket(format!(
            "unsupported protocol level: {level}"
        )));
    }

    let flags = dec.read_u8()?;
    if flags & 0x01 != 0 {
        return Err(ProtocolError::MalformedPacket(
            "reserved connect flag set".into(),
        ));
    }
    let clean_start = flags & 0x02 != 0;
    let will_flag = flags & 0x04 != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = flags & 0x20 != 0;
    let password_flag = flags & 0x40 != 0;
    let username_flag = flags & 0x80 != 0;

    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(ProtocolError::MalformedPacket(
            "will QoS/retain set without will flag".into(),
        ));
    }

    let keep_alive = dec.read_u16()?;
    let properties = ConnectProperties::decode(dec)?;
    let client_id = dec.read_string()?;

    let will = if will_flag {
        let will_properties = WillProperties::decode(dec)?;
        let topic = dec.read_string()?;
        let payload = dec.read_binary()?;
        Some(Will {
            topic,
            payload,
            qos: will_qos,
            retain: will_retain,
            properties: will_properties,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(dec.read_string()?)
    } else {
        None
    };
    let password = if password_flag {
        Some(dec.read_binary()?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        client_id,
        username,
        password,
        keep_alive,
        clean_start,
        properties,
        will,
    }))
}

fn decode_connack(dec: &mut Decoder<'_>) -> Result<Packet> {
    let ack_flags = dec.read_u8()?;
    if ack_flags & 0xFE != 0 {
        return Err(ProtocolError::MalformedPacket(
            "reserved CONNACK flags set".into(),
        ));
    }
    let reason_code = ReasonCode::validate(dec.read_u8()?, ReasonCategory::Connack)?;
    let properties = ConnackProperties::decode(dec)?;
    Ok(Packet::Connack(Connack {
        session_present: ack_flags & 0x01 != 0,
        reason_code,
        properties,
    }))
}

fn decode_publish(flags: u8, dec: &mut Decoder<'_>) -> Result<Packet> {
    let dup = flags & 0x08 != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = flags & 0x01 != 0;

    if dup && qos == QoS::AtMostOnce {
        return Err(ProtocolError::MalformedPacket(
            "DUP set on QoS 0 PUBLISH".into(),
        ));
    }

    let topic = dec.read_string()?;
    let packet_id = if qos != QoS::AtMostOnce {
        let pid = dec.read_u16()?;
        if pid == 0 {
            return Err(ProtocolError::MalformedPacket(
                "zero packet identifier".into(),
            ));
        }
        Some(pid)
    } else {
        None
    };
    let properties = PublishProperties::decode(dec)?;
    let payload = Bytes::copy_from_slice(dec.read_bytes(dec.remaining())?);

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        properties,
        payload,
    }))
}

fn decode_ack(dec: &mut Decoder<'_>, category: ReasonCategory) -> Result<Ack> {
    let packet_id = dec.read_u16()?;
    // MQTT allows abbreviating a two-byte body to mean reason 0x00
    // with no properties.
    if dec.is_empty() {
        return Ok(Ack {
            packet_id,
            reason_code: ReasonCode::validate(0x00, category)?,
            properties: AckProperties::default(),
        });
    }
    let reason_code = ReasonCode::validate(dec.read_u8()?, category)?;
    let properties = if dec.is_empty() {
        AckProperties::default()
    } else {
        AckProperties::decode(dec, ack_name(category))?
    };
    Ok(Ack {
        packet_id,
        reason_code,
        properties,
    })
}

fn ack_name(category: ReasonCategory) -> &'static str {
    match category {
        ReasonCategory::Puback => "PUBACK",
        ReasonCategory::Pubrec => "PUBREC",
        ReasonCategory::Pubrel => "PUBREL",
        ReasonCategory::Pubcomp => "PUBCOMP",
        ReasonCategory::Suback => "SUBACK",
        ReasonCategory::Unsuback => "UNSUBACK",
        _ => "ACK",
    }
}

fn decode_subscribe(dec: &mut Decoder<'_>) -> Result<Packet> {
    let packet_id = dec.read_u16()?;
    let properties = SubscribeProperties::decode(dec)?;

    let mut filters = Vec::new();
    while !dec.is_empty() {
        let filter = dec.read_string()?;
        if filter.is_empty() {
            return Err(ProtocolError::MalformedPacket("empty topic filter".into()));
        }
        let options = SubscriptionOptions::from_byte(dec.read_u8()?)?;
        filters.push((filter, options));
    }
    if filters.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "SUBSCRIBE with no topic filters".into(),
        ));
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        properties,
        filters,
    }))
}

fn decode_suback(dec: &mut Decoder<'_>) -> Result<Packet> {
    let packet_id = dec.read_u16()?;
    let properties = AckProperties::decode(dec, "SUBACK")?;
    let mut reason_codes = Vec::new();
    while !dec.is_empty() {
        reason_codes.push(ReasonCode::validate(dec.read_u8()?, ReasonCategory::Suback)?);
    }
    if reason_codes.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "SUBACK with no reason codes".into(),
        ));
    }
    Ok(Packet::Suback(Suback {
        packet_id,
        properties,
        reason_codes,
    }))
}

fn decode_unsubscribe(dec: &mut Decoder<'_>) -> Result<Packet> {
    let packet_id = dec.read_u16()?;
    let properties = UnsubscribeProperties::decode(dec)?;
    let mut topics = Vec::new();
    while !dec.is_empty() {
        let topic = dec.read_string()?;
        if topic.is_empty() {
            return Err(ProtocolError::MalformedPacket("empty topic filter".into()));
        }
        topics.push(topic);
    }
    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "UNSUBSCRIBE with no topic filters".into(),
        ));
    }
    Ok(Packet::Unsubscribe(Unsubscribe {
        packet_id,
        properties,
        topics,
    }))
}

fn decode_unsuback(dec: &mut Decoder<'_>) -> Result<Packet> {
    let packet_id = dec.read_u16()?;
    let properties = AckProperties::decode(dec, "UNSUBACK")?;
    let mut reason_codes = Vec::new();
    while !dec.is_empty() {
        reason_codes.push(ReasonCode::validate(
            dec.read_u8()?,
            ReasonCategory::Unsuback,
        )?);
    }
    if reason_codes.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "UNSUBACK with no reason codes".into(),
        ));
    }
    Ok(Packet::Unsuback(Unsuback {
        packet_id,
        properties,
        reason_codes,
    }))
}

fn decode_disconnect(dec: &mut Decoder<'_>) -> Result<Packet> {
    // Remaining length 0 abbreviates a normal disconnection.
    if dec.is_empty() {
        return Ok(Packet::Disconnect(Disconnect::default()));
    }
    let reason_code = ReasonCode::validate(dec.read_u8()?, ReasonCategory::Disconnect)?;
    let properties = if dec.is_empty() {
        DisconnectProperties::default()
    } else {
        DisconnectProperties::decode(dec)?
    };
    Ok(Packet::Disconnect(Disconnect {
        reason_code,
        properties,
    }))
}

fn decode_auth(dec: &mut Decoder<'_>) -> Result<Packet> {
    if dec.is_empty() {
        return Ok(Packet::Auth(Auth {
            reason_code: ReasonCode::validate(0x00, ReasonCategory::Auth)?,
            properties: AuthProperties::default(),
        }));
    }
    let reason_code = ReasonCode::validate(dec.read_u8()?, ReasonCategory::Auth)?;
    let properties = if dec.is_empty() {
        AuthProperties::default()
    } else {
        AuthProperties::decode(dec)?
    };
    Ok(Packet::Auth(Auth {
        reason_code,
        properties,
    }))
}

// === Encoding ===

pub(crate) fn write_string(s: &str, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

pub(crate) fn write_binary(b: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(b.len() as u16).to_be_bytes());
    buf.extend_from_slice(b);
}

fn write_fixed_header(packet_type: PacketType, flags: u8, body: &[u8], buf: &mut Vec<u8>) {
    buf.push(((packet_type as u8) << 4) | flags);
    // Body length was bounded while building, encode cannot fail.
    let _ = varint::encode(body.len() as u32, buf);
    buf.extend_from_slice(body);
}

/// Encode a packet, appending its wire form to `buf`.
pub fn encode_packet(packet: &Packet, buf: &mut Vec<u8>) {
    match packet {
        Packet::Connect(c) => encode_connect(c, buf),
        Packet::Connack(c) => encode_connack(c, buf),
        Packet::Publish(p) => encode_publish(p, buf),
        Packet::Puback(a) => encode_ack(PacketType::Puback, a, buf),
        Packet::Pubrec(a) => encode_ack(PacketType::Pubrec, a, buf),
        Packet::Pubrel(a) => encode_ack(PacketType::Pubrel, a, buf),
        Packet::Pubcomp(a) => encode_ack(PacketType::Pubcomp, a, buf),
        Packet::Subscribe(s) => encode_subscribe(s, buf),
        Packet::Suback(s) => encode_suback(s, buf),
        Packet::Unsubscribe(u) => encode_unsubscribe(u, buf),
        Packet::Unsuback(u) => encode_unsuback(u, buf),
        Packet::Pingreq => write_fixed_header(PacketType::Pingreq, 0, &[], buf),
        Packet::Pingresp => write_fixed_header(PacketType::Pingresp, 0, &[], buf),
        Packet::Disconnect(d) => encode_disconnect(d, buf),
        Packet::Auth(a) => encode_auth(a, buf),
    }
}

fn encode_connect(connect: &Connect, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    write_string("MQTT", &mut body);
    body.push(5);

    let mut flags = 0u8;
    if connect.clean_start {
        flags |= 0x02;
    }
    if let Some(ref will) = connect.will {
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    body.push(flags);

    body.extend_from_slice(&connect.keep_alive.to_be_bytes());
    connect.properties.encode(&mut body);
    write_string(&connect.client_id, &mut body);

    if let Some(ref will) = connect.will {
        will.properties.encode(&mut body);
        write_string(&will.topic, &mut body);
        write_binary(&will.payload, &mut body);
    }
    if let Some(ref username) = connect.username {
        write_string(username, &mut body);
    }
    if let Some(ref password) = connect.password {
        write_binary(password, &mut body);
    }

    write_fixed_header(PacketType::Connect, 0, &body, buf);
}

fn encode_connack(connack: &Connack, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    body.push(connack.session_present as u8);
    body.push(connack.reason_code.value());
    connack.properties.encode(&mut body);
    write_fixed_header(PacketType::Connack, 0, &body, buf);
}

fn encode_publish(publish: &Publish, buf: &mut Vec<u8>) {
    let mut flags = (publish.qos as u8) << 1;
    if publish.dup {
        flags |= 0x08;
    }
    if publish.retain {
        flags |= 0x01;
    }

    let mut body = Vec::new();
    write_string(&publish.topic, &mut body);
    if publish.qos != QoS::AtMostOnce {
        body.extend_from_slice(&publish.packet_id.unwrap_or(0).to_be_bytes());
    }
    publish.properties.encode(&mut body);
    body.extend_from_slice(&publish.payload);

    write_fixed_header(PacketType::Publish, flags, &body, buf);
}

fn encode_ack(packet_type: PacketType, ack: &Ack, buf: &mut Vec<u8>) {
    let flags = if packet_type == PacketType::Pubrel {
        0x02
    } else {
        0
    };
    let mut body = Vec::new();
    body.extend_from_slice(&ack.packet_id.to_be_bytes());
    if ack.reason_code != ReasonCode::SUCCESS || !ack.properties.is_empty() {
        body.push(ack.reason_code.value());
        if !ack.properties.is_empty() {
            ack.properties.encode(&mut body);
        }
    }
    write_fixed_header(packet_type, flags, &body, buf);
}

fn encode_subscribe(subscribe: &Subscribe, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(&subscribe.packet_id.to_be_bytes());
    subscribe.properties.encode(&mut body);
    for (filter, options) in &subscribe.filters {
        write_string(filter, &mut body);
        body.push(options.to_byte());
    }
    write_fixed_header(PacketType::Subscribe, 0x02, &body, buf);
}

fn encode_suback(suback: &Suback, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(&suback.packet_id.to_be_bytes());
    suback.properties.encode(&mut body);
    body.extend(suback.reason_codes.iter().map(|rc| rc.value()));
    write_fixed_header(PacketType::Suback, 0, &body, buf);
}

fn encode_unsubscribe(unsubscribe: &Unsubscribe, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(&unsubscribe.packet_id.to_be_bytes());
    unsubscribe.properties.encode(&mut body);
    for topic in &unsubscribe.topics {
        write_string(topic, &mut body);
    }
    write_fixed_header(PacketType::Unsubscribe, 0x02, &body, buf);
}

fn encode_unsuback(unsuback: &Unsuback, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    body.extend_from_slice(&unsuback.packet_id.to_be_bytes());
    unsuback.properties.encode(&mut body);
    body.extend(unsuback.reason_codes.iter().map(|rc| rc.value()));
    write_fixed_header(PacketType::Unsuback, 0, &body, buf);
}

fn encode_disconnect(disconnect: &Disconnect, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    if disconnect.reason_code != ReasonCode::NORMAL_DISCONNECTION
        || !disconnect.properties.is_empty()
    {
        body.push(disconnect.reason_code.value());
        if !disconnect.properties.is_empty() {
            disconnect.properties.encode(&mut body);
        }
    }
    write_fixed_header(PacketType::Disconnect, 0, &body, buf);
}

fn encode_auth(auth: &Auth, buf: &mut Vec<u8>) {
    let mut body = Vec::new();
    body.push(auth.reason_code.value());
    auth.properties.encode(&mut body);
    write_fixed_header(PacketType::Auth, 0, &body, buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::prop;

    fn roundtrip(packet: Packet) -> Packet {
        let mut buf = Vec::new();
        encode_packet(&packet, &mut buf);
        let (decoded, consumed) = decode_packet(&buf, 0).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        decoded
    }

    #[test]
    fn connect_roundtrip() {
        let packet = Packet::Connect(Connect {
            client_id: "sensor-7".into(),
            username: Some("alice".into()),
            password: Some(Bytes::from_static(b"hunter2")),
            keep_alive: 10,
            clean_start: true,
            properties: ConnectProperties {
                session_expiry_interval: Some(120),
                receive_maximum: Some(8),
                ..Default::default()
            },
            will: Some(Will {
                topic: "sensor-7/status".into(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtLeastOnce,
                retain: true,
                properties: WillProperties {
                    will_delay_interval: Some(5),
                    ..Default::default()
                },
            }),
        });
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn connack_roundtrip() {
        let packet = Packet::Connack(Connack {
            session_present: true,
            reason_code: ReasonCode::SUCCESS,
            properties: ConnackProperties {
                receive_maximum: Some(10),
                topic_alias_maximum: Some(4),
                assigned_client_identifier: Some("auto-3".into()),
                ..Default::default()
            },
        });
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn publish_roundtrip_all_qos() {
        for (qos, packet_id) in [
            (QoS::AtMostOnce, None),
            (QoS::AtLeastOnce, Some(7)),
            (QoS::ExactlyOnce, Some(65535)),
        ] {
            let packet = Packet::Publish(Publish {
                dup: qos != QoS::AtMostOnce,
                qos,
                retain: true,
                topic: "metrics/load".into(),
                packet_id,
                properties: PublishProperties {
                    message_expiry_interval: Some(60),
                    ..Default::default()
                },
                payload: Bytes::from_static(b"0.92"),
            });
            assert_eq!(roundtrip(packet.clone()), packet);
        }
    }

    #[test]
    fn ack_roundtrip() {
        let packet = Packet::Puback(Ack {
            packet_id: 42,
            reason_code: ReasonCode::QUOTA_EXCEEDED,
            properties: AckProperties {
                reason_string: Some("slow down".into()),
                ..Default::default()
            },
        });
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn short_ack_decodes_as_success() {
        // PUBACK with only a packet id: reason 0x00, no properties
        let buf = [0x40, 0x02, 0x00, 0x2A];
        let (packet, consumed) = decode_packet(&buf, 0).unwrap().unwrap();
        assert_eq!(consumed, 4);
        match packet {
            Packet::Puback(ack) => {
                assert_eq!(ack.packet_id, 42);
                assert_eq!(ack.reason_code, ReasonCode::SUCCESS);
            }
            other => panic!("expected PUBACK, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_roundtrip() {
        let packet = Packet::Subscribe(Subscribe {
            packet_id: 3,
            properties: SubscribeProperties {
                subscription_identifier: Some(9),
                ..Default::default()
            },
            filters: vec![
                (
                    "a/+/b".into(),
                    SubscriptionOptions {
                        qos: QoS::AtLeastOnce,
                        no_local: true,
                        retain_as_published: false,
                        retain_handling: 1,
                    },
                ),
                ("c/#".into(), SubscriptionOptions::default()),
            ],
        });
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn suback_roundtrip() {
        let packet = Packet::Suback(Suback {
            packet_id: 3,
            properties: AckProperties::default(),
            reason_codes: vec![ReasonCode::GRANTED_QOS_1, ReasonCode::TOPIC_FILTER_INVALID],
        });
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn unsubscribe_unsuback_roundtrip() {
        let packet = Packet::Unsubscribe(Unsubscribe {
            packet_id: 4,
            properties: UnsubscribeProperties::default(),
            topics: vec!["a/b".into()],
        });
        assert_eq!(roundtrip(packet.clone()), packet);

        let packet = Packet::Unsuback(Unsuback {
            packet_id: 4,
            properties: AckProperties::default(),
            reason_codes: vec![ReasonCode::NO_SUBSCRIPTION_EXISTED],
        });
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn ping_and_disconnect_roundtrip() {
        assert_eq!(roundtrip(Packet::Pingreq), Packet::Pingreq);
        assert_eq!(roundtrip(Packet::Pingresp), Packet::Pingresp);

        let packet = Packet::Disconnect(Disconnect {
            reason_code: ReasonCode::NORMAL_DISCONNECTION,
            properties: DisconnectProperties::default(),
        });
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn auth_roundtrip() {
        let packet = Packet::Auth(Auth {
            reason_code: ReasonCode::CONTINUE_AUTHENTICATION,
            properties: AuthProperties {
                authentication_method: Some("SCRAM-SHA-256".into()),
                authentication_data: Some(Bytes::from_static(b"challenge")),
                ..Default::default()
            },
        });
        assert_eq!(roundtrip(packet.clone()), packet);
    }

    #[test]
    fn partial_input_needs_more() {
        let packet = Packet::Connack(Connack {
            session_present: false,
            reason_code: ReasonCode::SUCCESS,
            properties: ConnackProperties::default(),
        });
        let mut buf = Vec::new();
        encode_packet(&packet, &mut buf);
        for end in 0..buf.len() {
            assert!(decode_packet(&buf[..end], 0).unwrap().is_none());
        }
    }

    #[test]
    fn publish_qos_extracted_from_flags() {
        for byte in 0x30u8..=0x3F {
            let qos_bits = (byte >> 1) & 0x03;
            let dup = byte & 0x08 != 0;

            let mut body = vec![0x00, 0x01, b't']; // topic "t"
            if qos_bits > 0 {
                body.extend_from_slice(&[0x00, 0x07]); // packet id
            }
            body.push(0x00); // empty properties
            body.push(0xAA); // one payload byte
            let mut buf = vec![byte, body.len() as u8];
            buf.extend_from_slice(&body);

            match decode_packet(&buf, 0) {
                Ok(Some((Packet::Publish(p), _))) => assert_eq!(p.qos as u8, qos_bits),
                Ok(_) => panic!("incomplete decode for flags {byte:#04x}"),
                // QoS 3 and DUP-on-QoS-0 must be rejected
                Err(_) => assert!(qos_bits == 3 || (dup && qos_bits == 0)),
            }
        }
    }

    #[test]
    fn invalid_reason_code_rejected() {
        // CONNACK with reason 0x01 (granted QoS 1 is not a CONNACK code)
        let buf = [0x20, 0x03, 0x00, 0x01, 0x00];
        assert!(decode_packet(&buf, 0).is_err());
    }

    #[test]
    fn pubrel_flags_enforced() {
        // PUBREL with flags 0000 instead of 0010
        let buf = [0x60, 0x02, 0x00, 0x01];
        assert!(decode_packet(&buf, 0).is_err());
        let buf = [0x62, 0x02, 0x00, 0x01];
        assert!(decode_packet(&buf, 0).unwrap().is_some());
    }

    #[test]
    fn oversized_packet_rejected() {
        let packet = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "t".into(),
            packet_id: None,
            properties: PublishProperties::default(),
            payload: Bytes::from(vec![0u8; 128]),
        });
        let mut buf = Vec::new();
        encode_packet(&packet, &mut buf);
        assert!(decode_packet(&buf, 64).is_err());
        assert!(decode_packet(&buf, 0).unwrap().is_some());
    }

    #[test]
    fn unknown_publish_property_rejected() {
        // PUBLISH QoS 0 whose property block carries receive maximum (0x21)
        let mut body = Vec::new();
        write_string("t", &mut body);
        body.push(3); // property length
        body.push(prop::RECEIVE_MAXIMUM);
        body.extend_from_slice(&5u16.to_be_bytes());
        let mut buf = vec![0x30, body.len() as u8];
        buf.extend_from_slice(&body);
        assert!(decode_packet(&buf, 0).is_err());
    }
}
