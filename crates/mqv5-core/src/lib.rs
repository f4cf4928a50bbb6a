//! mqv5-core - Core MQTT 5.0 types and codec.
//!
//! This crate provides packet encoding/decoding, property blocks and reason
//! codes, shared by the client crate and usable on its own.

pub mod error;
pub mod packet;
pub mod properties;
pub mod reason;
pub mod varint;

pub use error::{ProtocolError, Result};
pub use packet::*;
pub use reason::{ReasonCategory, ReasonCode};
