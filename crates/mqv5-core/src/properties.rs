//! MQTT 5.0 property blocks.
//!
//! Every property-bearing packet carries a varint-length-prefixed block of
//! (identifier, value) pairs in its variable header. Which identifiers are
//! permitted depends on the packet type; an identifier that is not allowed
//! for the packet being decoded is a malformed-packet error, and only User
//! Property (and Subscription Identifier, where allowed at all) may appear
//! more than once.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::packet::{write_binary, write_string, Decoder};
use crate::varint;

/// Property identifiers, per MQTT 5.0 table 2.4.
pub mod prop {
    pub const PAYLOAD_FORMAT_INDICATOR: u8 = 0x01;
    pub const MESSAGE_EXPIRY_INTERVAL: u8 = 0x02;
    pub const CONTENT_TYPE: u8 = 0x03;
    pub const RESPONSE_TOPIC: u8 = 0x08;
    pub const CORRELATION_DATA: u8 = 0x09;
    pub const SUBSCRIPTION_IDENTIFIER: u8 = 0x0B;
    pub const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
    pub const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
    pub const SERVER_KEEP_ALIVE: u8 = 0x13;
    pub const AUTHENTICATION_METHOD: u8 = 0x15;
    pub const AUTHENTICATION_DATA: u8 = 0x16;
    pub const REQUEST_PROBLEM_INFORMATION: u8 = 0x17;
    pub const WILL_DELAY_INTERVAL: u8 = 0x18;
    pub const REQUEST_RESPONSE_INFORMATION: u8 = 0x19;
    pub const RESPONSE_INFORMATION: u8 = 0x1A;
    pub const SERVER_REFERENCE: u8 = 0x1C;
    pub const REASON_STRING: u8 = 0x1F;
    pub const RECEIVE_MAXIMUM: u8 = 0x21;
    pub const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
    pub const TOPIC_ALIAS: u8 = 0x23;
    pub const MAXIMUM_QOS: u8 = 0x24;
    pub const RETAIN_AVAILABLE: u8 = 0x25;
    pub const USER_PROPERTY: u8 = 0x26;
    pub const MAXIMUM_PACKET_SIZE: u8 = 0x27;
    pub const WILDCARD_SUBSCRIPTION_AVAILABLE: u8 = 0x28;
    pub const SUBSCRIPTION_IDENTIFIERS_AVAILABLE: u8 = 0x29;
    pub const SHARED_SUBSCRIPTION_AVAILABLE: u8 = 0x2A;
}

/// Reject a second occurrence of a non-repeatable property.
fn put<T>(slot: &mut Option<T>, value: T, name: &str) -> Result<()> {
    if slot.is_some() {
        return Err(ProtocolError::MalformedPacket(format!(
            "duplicate {name} property"
        )));
    }
    *slot = Some(value);
    Ok(())
}

fn unknown(packet: &str, id: u8) -> ProtocolError {
    ProtocolError::MalformedPacket(format!("unknown {packet} property: {id:#04x}"))
}

/// Begin a property block: read its varint length, return the end offset.
fn block_end(dec: &mut Decoder<'_>) -> Result<usize> {
    let len = dec.read_varint()? as usize;
    let end = dec.pos() + len;
    if end > dec.len() {
        return Err(ProtocolError::MalformedPacket(
            "property length exceeds packet".into(),
        ));
    }
    Ok(end)
}

/// Write `body` as a varint-length-prefixed property block.
fn write_block(body: Vec<u8>, buf: &mut Vec<u8>) {
    // Property block length always fits a varint: packets are capped well
    // below VARINT_MAX before encoding.
    let _ = varint::encode(body.len() as u32, buf);
    buf.extend_from_slice(&body);
}

fn write_user_properties(pairs: &[(String, String)], body: &mut Vec<u8>) {
    for (key, value) in pairs {
        body.push(prop::USER_PROPERTY);
        write_string(key, body);
        write_string(value, body);
    }
}

/// CONNECT properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectProperties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_packet_size: Option<u32>,
    pub topic_alias_maximum: Option<u16>,
    pub request_response_information: Option<bool>,
    pub request_problem_information: Option<bool>,
    pub user_properties: Vec<(String, String)>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
}

impl ConnectProperties {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut body = Vec::new();
        if let Some(v) = self.session_expiry_interval {
            body.push(prop::SESSION_EXPIRY_INTERVAL);
            body.extend_from_slice(&v.to_be_bytes());
        }
        if let Some(v) = self.receive_maximum {
            body.push(prop::RECEIVE_MAXIMUM);
            body.extend_from_slice(&v.to_be_bytes());
        }
        if let Some(v) = self.maximum_packet_size {
            body.push(prop::MAXIMUM_PACKET_SIZE);
            body.extend_from_slice(&v.to_be_bytes());
        }
        if let Some(v) = self.topic_alias_maximum {
            body.push(prop::TOPIC_ALIAS_MAXIMUM);
            body.extend_from_slice(&v.to_be_bytes());
        }
        if let Some(v) = self.request_response_information {
            body.push(prop::REQUEST_RESPONSE_INFORMATION);
            body.push(v as u8);
        }
        if let Some(v) = self.request_problem_information {
            body.push(prop::REQUEST_PROBLEM_INFORMATION);
            body.push(v as u8);
        }
        write_user_properties(&self.user_properties, &mut body);
        if let Some(ref v) = self.authentication_method {
            body.push(prop::AUTHENTICATION_METHOD);
            write_string(v, &mut body);
        }
        if let Some(ref v) = self.authentication_data {
            body.push(prop::AUTHENTICATION_DATA);
            write_binary(v, &mut body);
        }
        write_block(body, buf);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let end = block_end(dec)?;
        let mut props = Self::default();
        while dec.pos() < end {
            match dec.read_u8()? {
                prop::SESSION_EXPIRY_INTERVAL => put(
                    &mut props.session_expiry_interval,
                    dec.read_u32()?,
                    "session expiry interval",
                )?,
                prop::RECEIVE_MAXIMUM => {
                    put(&mut props.receive_maximum, dec.read_u16()?, "receive maximum")?
                }
                prop::MAXIMUM_PACKET_SIZE => put(
                    &mut props.maximum_packet_size,
                    dec.read_u32()?,
                    "maximum packet size",
                )?,
                prop::TOPIC_ALIAS_MAXIMUM => put(
                    &mut props.topic_alias_maximum,
                    dec.read_u16()?,
                    "topic alias maximum",
                )?,
                prop::REQUEST_RESPONSE_INFORMATION => put(
                    &mut props.request_response_information,
                    dec.read_u8()? != 0,
                    "request response information",
                )?,
                prop::REQUEST_PROBLEM_INFORMATION => put(
                    &mut props.request_problem_information,
                    dec.read_u8()? != 0,
                    "request problem information",
                )?,
                prop::USER_PROPERTY => props.user_properties.push(dec.read_string_pair()?),
                prop::AUTHENTICATION_METHOD => put(
                    &mut props.authentication_method,
                    dec.read_string()?,
                    "authentication method",
                )?,
                prop::AUTHENTICATION_DATA => put(
                    &mut props.authentication_data,
                    dec.read_binary()?,
                    "authentication data",
                )?,
                id => return Err(unknown("CONNECT", id)),
            }
        }
        Ok(props)
    }
}

/// Will properties, carried in the CONNECT payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WillProperties {
    pub will_delay_interval: Option<u32>,
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub user_properties: Vec<(String, String)>,
}

impl WillProperties {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut body = Vec::new();
        if let Some(v) = self.will_delay_interval {
            body.push(prop::WILL_DELAY_INTERVAL);
            body.extend_from_slice(&v.to_be_bytes());
        }
        if let Some(v) = self.payload_format_indicator {
            body.push(prop::PAYLOAD_FORMAT_INDICATOR);
            body.push(v);
        }
        if let Some(v) = self.message_expiry_interval {
            body.push(prop::MESSAGE_EXPIRY_INTERVAL);
            body.extend_from_slice(&v.to_be_bytes());
        }
        if let Some(ref v) = self.content_type {
            body.push(prop::CONTENT_TYPE);
            write_string(v, &mut body);
        }
        if let Some(ref v) = self.response_topic {
            body.push(prop::RESPONSE_TOPIC);
            write_string(v, &mut body);
        }
        if let Some(ref v) = self.correlation_data {
            body.push(prop::CORRELATION_DATA);
            write_binary(v, &mut body);
        }
        write_user_properties(&self.user_properties, &mut body);
        write_block(body, buf);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let end = block_end(dec)?;
        let mut props = Self::default();
        while dec.pos() < end {
            match dec.read_u8()? {
                prop::WILL_DELAY_INTERVAL => put(
                    &mut props.will_delay_interval,
                    dec.read_u32()?,
                    "will delay interval",
                )?,
                prop::PAYLOAD_FORMAT_INDICATOR => put(
                    &mut props.payload_format_indicator,
                    dec.read_u8()?,
                    "payload format indicator",
                )?,
                prop::MESSAGE_EXPIRY_INTERVAL => put(
                    &mut props.message_expiry_interval,
                    dec.read_u32()?,
                    "message expiry interval",
                )?,
                prop::CONTENT_TYPE => {
                    put(&mut props.content_type, dec.read_string()?, "content type")?
                }
                prop::RESPONSE_TOPIC => {
                    put(&mut props.response_topic, dec.read_string()?, "response topic")?
                }
                prop::CORRELATION_DATA => put(
                    &mut props.correlation_data,
                    dec.read_binary()?,
                    "correlation data",
                )?,
                prop::USER_PROPERTY => props.user_properties.push(dec.read_string_pair()?),
                id => return Err(unknown("Will", id)),
            }
        }
        Ok(props)
    }
}

/// CONNACK properties, as granted by the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnackProperties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<bool>,
    pub maximum_packet_size: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub topic_alias_maximum: Option<u16>,
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
    pub wildcard_subscription_available: Option<bool>,
    pub subscription_identifiers_available: Option<bool>,
    pub shared_subscription_available: Option<bool>,
    pub server_keep_alive: Option<u16>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
}

impl ConnackProperties {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut body = Vec::new();
        if let Some(v) = self.session_expiry_interval {
            body.push(prop::SESSION_EXPIRY_INTERVAL);
            body.extend_from_slice(&v.to_be_bytes());
        }
        if let Some(v) = self.receive_maximum {
            body.push(prop::RECEIVE_MAXIMUM);
            body.extend_from_slice(&v.to_be_bytes());
        }
        if let Some(v) = self.maximum_qos {
            body.push(prop::MAXIMUM_QOS);
            body.push(v);
        }
        if let Some(v) = self.retain_available {
            body.push(prop::RETAIN_AVAILABLE);
            body.push(v as u8);
        }
        if let Some(v) = self.maximum_packet_size {
            body.push(prop::MAXIMUM_PACKET_SIZE);
            body.extend_from_slice(&v.to_be_bytes());
        }
        if let Some(ref v) = self.assigned_client_identifier {
            body.push(prop::ASSIGNED_CLIENT_IDENTIFIER);
            write_string(v, &mut body);
        }
        if let Some(v) = self.topic_alias_maximum {
            body.push(prop::TOPIC_ALIAS_MAXIMUM);
            body.extend_from_slice(&v.to_be_bytes());
        }
        if let Some(ref v) = self.reason_string {
            body.push(prop::REASON_STRING);
            write_string(v, &mut body);
        }
        write_user_properties(&self.user_properties, &mut body);
        if let Some(v) = self.wildcard_subscription_available {
            body.push(prop::WILDCARD_SUBSCRIPTION_AVAILABLE);
            body.push(v as u8);
        }
        if let Some(v) = self.subscription_identifiers_available {
            body.push(prop::SUBSCRIPTION_IDENTIFIERS_AVAILABLE);
            body.push(v as u8);
        }
        if let Some(v) = self.shared_subscription_available {
            body.push(prop::SHARED_SUBSCRIPTION_AVAILABLE);
            body.push(v as u8);
        }
        if let Some(v) = self.server_keep_alive {
            body.push(prop::SERVER_KEEP_ALIVE);
            body.extend_from_slice(&v.to_be_bytes());
        }
        if let Some(ref v) = self.response_information {
            body.push(prop::RESPONSE_INFORMATION);
            write_string(v, &mut body);
        }
        if let Some(ref v) = self.server_reference {
            body.push(prop::SERVER_REFERENCE);
            write_string(v, &mut body);
        }
        if let Some(ref v) = self.authentication_method {
            body.push(prop::AUTHENTICATION_METHOD);
            write_string(v, &mut body);
        }
        if let Some(ref v) = self.authentication_data {
            body.push(prop::AUTHENTICATION_DATA);
            write_binary(v, &mut body);
        }
        write_block(body, buf);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let end = block_end(dec)?;
        let mut props = Self::default();
        while dec.pos() < end {
            match dec.read_u8()? {
                prop::SESSION_EXPIRY_INTERVAL => put(
                    &mut props.session_expiry_interval,
                    dec.read_u32()?,
                    "session expiry interval",
                )?,
                prop::RECEIVE_MAXIMUM => {
                    put(&mut props.receive_maximum, dec.read_u16()?, "receive maximum")?
                }
                prop::MAXIMUM_QOS => put(&mut props.maximum_qos, dec.read_u8()?, "maximum QoS")?,
                prop::RETAIN_AVAILABLE => put(
                    &mut props.retain_available,
                    dec.read_u8()? != 0,
                    "retain available",
                )?,
                prop::MAXIMUM_PACKET_SIZE => put(
                    &mut props.maximum_packet_size,
                    dec.read_u32()?,
                    "maximum packet size",
                )?,
                prop::ASSIGNED_CLIENT_IDENTIFIER => put(
                    &mut props.assigned_client_identifier,
                    dec.read_string()?,
                    "assigned client identifier",
                )?,
                prop::TOPIC_ALIAS_MAXIMUM => put(
                    &mut props.topic_alias_maximum,
                    dec.read_u16()?,
                    "topic alias maximum",
                )?,
                prop::REASON_STRING => {
                    put(&mut props.reason_string, dec.read_string()?, "reason string")?
                }
                prop::USER_PROPERTY => props.user_properties.push(dec.read_string_pair()?),
                prop::WILDCARD_SUBSCRIPTION_AVAILABLE => put(
                    &mut props.wildcard_subscription_available,
                    dec.read_u8()? != 0,
                    "wildcard subscription available",
                )?,
                prop::SUBSCRIPTION_IDENTIFIERS_AVAILABLE => put(
                    &mut props.subscription_identifiers_available,
                    dec.read_u8()? != 0,
                    "subscription identifiers available",
                )?,
                prop::SHARED_SUBSCRIPTION_AVAILABLE => put(
                    &mut props.shared_subscription_available,
                    dec.read_u8()? != 0,
                    "shared subscription available",
                )?,
                prop::SERVER_KEEP_ALIVE => put(
                    &mut props.server_keep_alive,
                    dec.read_u16()?,
                    "server keep alive",
                )?,
                prop::RESPONSE_INFORMATION => put(
                    &mut props.response_information,
                    dec.read_string()?,
                    "response information",
                )?,
                prop::SERVER_REFERENCE => put(
                    &mut props.server_reference,
                    dec.read_string()?,
                    "server reference",
                )?,
                prop::AUTHENTICATION_METHOD => put(
                    &mut props.authentication_method,
                    dec.read_string()?,
                    "authentication method",
                )?,
                prop::AUTHENTICATION_DATA => put(
                    &mut props.authentication_data,
                    dec.read_binary()?,
                    "authentication data",
                )?,
                id => return Err(unknown("CONNACK", id)),
            }
        }
        Ok(props)
    }
}

/// PUBLISH properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub topic_alias: Option<u16>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub user_properties: Vec<(String, String)>,
    /// May repeat on inbound messages matching several subscriptions.
    pub subscription_identifiers: Vec<u32>,
    pub content_type: Option<String>,
}

impl PublishProperties {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut body = Vec::new();
        if let Some(v) = self.payload_format_indicator {
            body.push(prop::PAYLOAD_FORMAT_INDICATOR);
            body.push(v);
        }
        if let Some(v) = self.message_expiry_interval {
            body.push(prop::MESSAGE_EXPIRY_INTERVAL);
            body.extend_from_slice(&v.to_be_bytes());
        }
        if let Some(v) = self.topic_alias {
            body.push(prop::TOPIC_ALIAS);
            body.extend_from_slice(&v.to_be_bytes());
        }
        if let Some(ref v) = self.response_topic {
            body.push(prop::RESPONSE_TOPIC);
            write_string(v, &mut body);
        }
        if let Some(ref v) = self.correlation_data {
            body.push(prop::CORRELATION_DATA);
            write_binary(v, &mut body);
        }
        write_user_properties(&self.user_properties, &mut body);
        for &id in &self.subscription_identifiers {
            body.push(prop::SUBSCRIPTION_IDENTIFIER);
            let _ = varint::encode(id, &mut body);
        }
        if let Some(ref v) = self.content_type {
            body.push(prop::CONTENT_TYPE);
            write_string(v, &mut body);
        }
        write_block(body, buf);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let end = block_end(dec)?;
        let mut props = Self::default();
        while dec.pos() < end {
            match dec.read_u8()? {
                prop::PAYLOAD_FORMAT_INDICATOR => put(
                    &mut props.payload_format_indicator,
                    dec.read_u8()?,
                    "payload format indicator",
                )?,
                prop::MESSAGE_EXPIRY_INTERVAL => put(
                    &mut props.message_expiry_interval,
                    dec.read_u32()?,
                    "message expiry interval",
                )?,
                prop::TOPIC_ALIAS => put(&mut props.topic_alias, dec.read_u16()?, "topic alias")?,
                prop::RESPONSE_TOPIC => {
                    put(&mut props.response_topic, dec.read_string()?, "response topic")?
                }
                prop::CORRELATION_DATA => put(
                    &mut props.correlation_data,
                    dec.read_binary()?,
                    "correlation data",
                )?,
                prop::USER_PROPERTY => props.user_properties.push(dec.read_string_pair()?),
                prop::SUBSCRIPTION_IDENTIFIER => {
                    let id = dec.read_varint()?;
                    if id == 0 {
                        return Err(ProtocolError::MalformedPacket(
                            "subscription identifier must be non-zero".into(),
                        ));
                    }
                    props.subscription_identifiers.push(id);
                }
                prop::CONTENT_TYPE => {
                    put(&mut props.content_type, dec.read_string()?, "content type")?
                }
                id => return Err(unknown("PUBLISH", id)),
            }
        }
        Ok(props)
    }
}

/// Properties shared by all acknowledgement packets
/// (PUBACK, PUBREC, PUBREL, PUBCOMP, SUBACK, UNSUBACK).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AckProperties {
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

impl AckProperties {
    pub fn is_empty(&self) -> bool {
        self.reason_string.is_none() && self.user_properties.is_empty()
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut body = Vec::new();
        if let Some(ref v) = self.reason_string {
            body.push(prop::REASON_STRING);
            write_string(v, &mut body);
        }
        write_user_properties(&self.user_properties, &mut body);
        write_block(body, buf);
    }

    pub fn decode(dec: &mut Decoder<'_>, packet: &str) -> Result<Self> {
        let end = block_end(dec)?;
        let mut props = Self::default();
        while dec.pos() < end {
            match dec.read_u8()? {
                prop::REASON_STRING => {
                    put(&mut props.reason_string, dec.read_string()?, "reason string")?
                }
                prop::USER_PROPERTY => props.user_properties.push(dec.read_string_pair()?),
                id => return Err(unknown(packet, id)),
            }
        }
        Ok(props)
    }
}

/// SUBSCRIBE properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeProperties {
    pub subscription_identifier: Option<u32>,
    pub user_properties: Vec<(String, String)>,
}

impl SubscribeProperties {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut body = Vec::new();
        if let Some(id) = self.subscription_identifier {
            body.push(prop::SUBSCRIPTION_IDENTIFIER);
            let _ = varint::encode(id, &mut body);
        }
        write_user_properties(&self.user_properties, &mut body);
        write_block(body, buf);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let end = block_end(dec)?;
        let mut props = Self::default();
        while dec.pos() < end {
            match dec.read_u8()? {
                prop::SUBSCRIPTION_IDENTIFIER => {
                    let id = dec.read_varint()?;
                    if id == 0 {
                        return Err(ProtocolError::MalformedPacket(
                            "subscription identifier must be non-zero".into(),
                        ));
                    }
                    put(&mut props.subscription_identifier, id, "subscription identifier")?;
                }
                prop::USER_PROPERTY => props.user_properties.push(dec.read_string_pair()?),
                id => return Err(unknown("SUBSCRIBE", id)),
            }
        }
        Ok(props)
    }
}

/// UNSUBSCRIBE properties (user properties only).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnsubscribeProperties {
    pub user_properties: Vec<(String, String)>,
}

impl UnsubscribeProperties {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut body = Vec::new();
        write_user_properties(&self.user_properties, &mut body);
        write_block(body, buf);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let end = block_end(dec)?;
        let mut props = Self::default();
        while dec.pos() < end {
            match dec.read_u8()? {
                prop::USER_PROPERTY => props.user_properties.push(dec.read_string_pair()?),
                id => return Err(unknown("UNSUBSCRIBE", id)),
            }
        }
        Ok(props)
    }
}

/// DISCONNECT properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisconnectProperties {
    pub session_expiry_interval: Option<u32>,
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
    pub server_reference: Option<String>,
}

impl DisconnectProperties {
    pub fn is_empty(&self) -> bool {
        self.session_expiry_interval.is_none()
            && self.reason_string.is_none()
            && self.user_properties.is_empty()
            && self.server_reference.is_none()
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut body = Vec::new();
        if let Some(v) = self.session_expiry_interval {
            body.push(prop::SESSION_EXPIRY_INTERVAL);
            body.extend_from_slice(&v.to_be_bytes());
        }
        if let Some(ref v) = self.reason_string {
            body.push(prop::REASON_STRING);
            write_string(v, &mut body);
        }
        write_user_properties(&self.user_properties, &mut body);
        if let Some(ref v) = self.server_reference {
            body.push(prop::SERVER_REFERENCE);
            write_string(v, &mut body);
        }
        write_block(body, buf);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let end = block_end(dec)?;
        let mut props = Self::default();
        while dec.pos() < end {
            match dec.read_u8()? {
                prop::SESSION_EXPIRY_INTERVAL => put(
                    &mut props.session_expiry_interval,
                    dec.read_u32()?,
                    "session expiry interval",
                )?,
                prop::REASON_STRING => {
                    put(&mut props.reason_string, dec.read_string()?, "reason string")?
                }
                prop::USER_PROPERTY => props.user_properties.push(dec.read_string_pair()?),
                prop::SERVER_REFERENCE => put(
                    &mut props.server_reference,
                    dec.read_string()?,
                    "server reference",
                )?,
                id => return Err(unknown("DISCONNECT", id)),
            }
        }
        Ok(props)
    }
}

/// AUTH properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthProperties {
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

impl AuthProperties {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut body = Vec::new();
        if let Some(ref v) = self.authentication_method {
            body.push(prop::AUTHENTICATION_METHOD);
            write_string(v, &mut body);
        }
        if let Some(ref v) = self.authentication_data {
            body.push(prop::AUTHENTICATION_DATA);
            write_binary(v, &mut body);
        }
        if let Some(ref v) = self.reason_string {
            body.push(prop::REASON_STRING);
            write_string(v, &mut body);
        }
        write_user_properties(&self.user_properties, &mut body);
        write_block(body, buf);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let end = block_end(dec)?;
        let mut props = Self::default();
        while dec.pos() < end {
            match dec.read_u8()? {
                prop::AUTHENTICATION_METHOD => put(
                    &mut props.authentication_method,
                    dec.read_string()?,
                    "authentication method",
                )?,
                prop::AUTHENTICATION_DATA => put(
                    &mut props.authentication_data,
                    dec.read_binary()?,
                    "authentication data",
                )?,
                prop::REASON_STRING => {
                    put(&mut props.reason_string, dec.read_string()?, "reason string")?
                }
                prop::USER_PROPERTY => props.user_properties.push(dec.read_string_pair()?),
                id => return Err(unknown("AUTH", id)),
            }
        }
        Ok(props)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T, E, D>(props: &T, encode: E, decode: D) -> T
    where
        E: Fn(&T, &mut Vec<u8>),
        D: Fn(&mut Decoder<'_>) -> Result<T>,
    {
        let mut buf = Vec::new();
        encode(props, &mut buf);
        let mut dec = Decoder::new(&buf);
        decode(&mut dec).unwrap()
    }

    #[test]
    fn connect_properties_roundtrip() {
        let props = ConnectProperties {
            session_expiry_interval: Some(3600),
            receive_maximum: Some(16),
            maximum_packet_size: Some(1 << 20),
            topic_alias_maximum: Some(10),
            request_response_information: Some(true),
            request_problem_information: None,
            user_properties: vec![("k".into(), "v".into()), ("k".into(), "w".into())],
            authentication_method: Some("SCRAM-SHA-256".into()),
            authentication_data: Some(Bytes::from_static(b"nonce")),
        };
        let decoded = roundtrip(&props, ConnectProperties::encode, ConnectProperties::decode);
        assert_eq!(decoded, props);
    }

    #[test]
    fn connack_properties_roundtrip() {
        let props = ConnackProperties {
            receive_maximum: Some(20),
            maximum_qos: Some(1),
            retain_available: Some(false),
            assigned_client_identifier: Some("auto-17".into()),
            topic_alias_maximum: Some(5),
            server_keep_alive: Some(30),
            ..Default::default()
        };
        let decoded = roundtrip(&props, ConnackProperties::encode, ConnackProperties::decode);
        assert_eq!(decoded, props);
    }

    #[test]
    fn publish_properties_roundtrip() {
        let props = PublishProperties {
            topic_alias: Some(3),
            response_topic: Some("replies/42".into()),
            correlation_data: Some(Bytes::from_static(&[1, 2, 3])),
            subscription_identifiers: vec![1, 200],
            content_type: Some("application/json".into()),
            ..Default::default()
        };
        let decoded = roundtrip(&props, PublishProperties::encode, PublishProperties::decode);
        assert_eq!(decoded, props);
    }

    #[test]
    fn unknown_identifier_is_malformed() {
        // topic alias (0x23) is not a CONNECT property
        let buf = [3u8, 0x23, 0x00, 0x01];
        let mut dec = Decoder::new(&buf);
        assert!(ConnectProperties::decode(&mut dec).is_err());
    }

    #[test]
    fn duplicate_property_is_malformed() {
        let mut buf = vec![0u8];
        for _ in 0..2 {
            buf.push(prop::RECEIVE_MAXIMUM);
            buf.extend_from_slice(&10u16.to_be_bytes());
        }
        buf[0] = (buf.len() - 1) as u8;
        let mut dec = Decoder::new(&buf);
        assert!(ConnectProperties::decode(&mut dec).is_err());
    }

    #[test]
    fn zero_subscription_identifier_rejected() {
        let buf = [2u8, prop::SUBSCRIPTION_IDENTIFIER, 0x00];
        let mut dec = Decoder::new(&buf);
        assert!(SubscribeProperties::decode(&mut dec).is_err());
    }

    #[test]
    fn empty_block() {
        let buf = [0u8];
        let mut dec = Decoder::new(&buf);
        let props = AckProperties::decode(&mut dec, "PUBACK").unwrap();
        assert!(props.is_empty());
    }
}
