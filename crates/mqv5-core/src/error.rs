//! Protocol-level error types shared by the codec.

use thiserror::Error;

use crate::reason::ReasonCategory;

/// Errors produced while encoding or decoding MQTT 5.0 packets.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Incomplete packet: need {needed} more bytes, have {have}")]
    IncompletePacket { needed: usize, have: usize },

    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Reason code {code:#04x} not valid for {category:?}")]
    InvalidReasonCode {
        code: u8,
        category: ReasonCategory,
    },

    #[error("Packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Value {0} exceeds the variable byte integer range")]
    VarintOverflow(u32),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
