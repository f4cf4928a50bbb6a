//! MQTT 5.0 Reason Codes.
//!
//! A Reason Code is a one-byte value reported in acknowledgement packets.
//! Values below 0x80 indicate success, values of 0x80 and above indicate
//! failure. The same byte can mean different things depending on which packet
//! carried it (0x00 in a SUBACK is "granted QoS 0", not plain success), so a
//! [`ReasonCode`] pairs the byte with the category of packet it came from and
//! equality compares both.
//!
//! Each packet type accepts a fixed set of codes; [`ReasonCode::validate`]
//! checks a received byte against the per-category table and rejects
//! everything else as malformed.

use crate::error::{ProtocolError, Result};

/// The packet family a reason code was carried in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCategory {
    Connack,
    Puback,
    Pubrec,
    Pubrel,
    Pubcomp,
    Suback,
    Unsuback,
    Auth,
    Disconnect,
}

/// A reason code byte together with the category it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReasonCode {
    code: u8,
    category: Option<ReasonCategory>,
}

impl ReasonCode {
    pub const SUCCESS: ReasonCode = ReasonCode::plain(0x00);
    pub const NORMAL_DISCONNECTION: ReasonCode =
        ReasonCode::in_category(0x00, ReasonCategory::Disconnect);
    pub const GRANTED_QOS_0: ReasonCode = ReasonCode::in_category(0x00, ReasonCategory::Suback);
    pub const GRANTED_QOS_1: ReasonCode = ReasonCode::plain(0x01);
    pub const GRANTED_QOS_2: ReasonCode = ReasonCode::plain(0x02);
    pub const DISCONNECT_WITH_WILL_MESSAGE: ReasonCode = ReasonCode::plain(0x04);
    pub const NO_MATCHING_SUBSCRIBERS: ReasonCode = ReasonCode::plain(0x10);
    pub const NO_SUBSCRIPTION_EXISTED: ReasonCode = ReasonCode::plain(0x11);
    pub const CONTINUE_AUTHENTICATION: ReasonCode = ReasonCode::plain(0x18);
    pub const REAUTHENTICATE: ReasonCode = ReasonCode::plain(0x19);
    pub const UNSPECIFIED_ERROR: ReasonCode = ReasonCode::plain(0x80);
    pub const MALFORMED_PACKET: ReasonCode = ReasonCode::plain(0x81);
    pub const PROTOCOL_ERROR: ReasonCode = ReasonCode::plain(0x82);
    pub const IMPLEMENTATION_SPECIFIC_ERROR: ReasonCode = ReasonCode::plain(0x83);
    pub const UNSUPPORTED_PROTOCOL_VERSION: ReasonCode = ReasonCode::plain(0x84);
    pub const CLIENT_ID_NOT_VALID: ReasonCode = ReasonCode::plain(0x85);
    pub const BAD_USERNAME_OR_PASSWORD: ReasonCode = ReasonCode::plain(0x86);
    pub const NOT_AUTHORIZED: ReasonCode = ReasonCode::plain(0x87);
    pub const SERVER_UNAVAILABLE: ReasonCode = ReasonCode::plain(0x88);
    pub const SERVER_BUSY: ReasonCode = ReasonCode::plain(0x89);
    pub const BANNED: ReasonCode = ReasonCode::plain(0x8A);
    pub const SERVER_SHUTTING_DOWN: ReasonCode = ReasonCode::plain(0x8B);
    pub const BAD_AUTHENTICATION_METHOD: ReasonCode = ReasonCode::plain(0x8C);
    pub const KEEP_ALIVE_TIMEOUT: ReasonCode = ReasonCode::plain(0x8D);
    pub const SESSION_TAKEN_OVER: ReasonCode = ReasonCode::plain(0x8E);
    pub const TOPIC_FILTER_INVALID: ReasonCode = ReasonCode::plain(0x8F);
    pub const TOPIC_NAME_INVALID: ReasonCode = ReasonCode::plain(0x90);
    pub const PACKET_ID_IN_USE: ReasonCode = ReasonCode::plain(0x91);
    pub const PACKET_ID_NOT_FOUND: ReasonCode = ReasonCode::plain(0x92);
    pub const RECEIVE_MAXIMUM_EXCEEDED: ReasonCode = ReasonCode::plain(0x93);
    pub const TOPIC_ALIAS_INVALID: ReasonCode = ReasonCode::plain(0x94);
    pub const PACKET_TOO_LARGE: ReasonCode = ReasonCode::plain(0x95);
    pub const MESSAGE_RATE_TOO_HIGH: ReasonCode = ReasonCode::plain(0x96);
    pub const QUOTA_EXCEEDED: ReasonCode = ReasonCode::plain(0x97);
    pub const ADMINISTRATIVE_ACTION: ReasonCode = ReasonCode::plain(0x98);
    pub const PAYLOAD_FORMAT_INVALID: ReasonCode = ReasonCode::plain(0x99);
    pub const RETAIN_NOT_SUPPORTED: ReasonCode = ReasonCode::plain(0x9A);
    pub const QOS_NOT_SUPPORTED: ReasonCode = ReasonCode::plain(0x9B);
    pub const USE_ANOTHER_SERVER: ReasonCode = ReasonCode::plain(0x9C);
    pub const SERVER_MOVED: ReasonCode = ReasonCode::plain(0x9D);
    pub const SHARED_SUBSCRIPTIONS_NOT_SUPPORTED: ReasonCode = ReasonCode::plain(0x9E);
    pub const CONNECTION_RATE_EXCEEDED: ReasonCode = ReasonCode::plain(0x9F);
    pub const MAXIMUM_CONNECT_TIME: ReasonCode = ReasonCode::plain(0xA0);
    pub const SUBSCRIPTION_IDS_NOT_SUPPORTED: ReasonCode = ReasonCode::plain(0xA1);
    pub const WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED: ReasonCode = ReasonCode::plain(0xA2);

    const fn plain(code: u8) -> Self {
        Self {
            code,
            category: None,
        }
    }

    const fn in_category(code: u8, category: ReasonCategory) -> Self {
        Self {
            code,
            category: Some(category),
        }
    }

    /// The raw byte value.
    pub const fn value(&self) -> u8 {
        self.code
    }

    /// Codes of 0x80 and above indicate failure.
    pub const fn is_error(&self) -> bool {
        self.code >= 0x80
    }

    /// Validate a received byte against the set of codes the given packet
    /// category may carry.
    ///
    /// Returns the matching [`ReasonCode`] (carrying the category where the
    /// byte is category-specific) or [`ProtocolError::InvalidReasonCode`].
    pub fn validate(code: u8, category: ReasonCategory) -> Result<ReasonCode> {
        let table = valid_codes(category);
        table
            .binary_search_by_key(&code, |rc| rc.code)
            .map(|idx| table[idx])
            .map_err(|_| ProtocolError::InvalidReasonCode { code, category })
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match (self.code, self.category) {
            (0x00, Some(ReasonCategory::Suback)) => "granted QoS 0",
            (0x00, Some(ReasonCategory::Disconnect)) => "normal disconnection",
            (0x00, _) => "success",
            (0x01, _) => "granted QoS 1",
            (0x02, _) => "granted QoS 2",
            (0x04, _) => "disconnect with will message",
            (0x10, _) => "no matching subscribers",
            (0x11, _) => "no subscription existed",
            (0x18, _) => "continue authentication",
            (0x19, _) => "re-authenticate",
            (0x80, _) => "unspecified error",
            (0x81, _) => "malformed packet",
            (0x82, _) => "protocol error",
            (0x83, _) => "implementation specific error",
            (0x84, _) => "unsupported protocol version",
            (0x85, _) => "client identifier not valid",
            (0x86, _) => "bad user name or password",
            (0x87, _) => "not authorized",
            (0x88, _) => "server unavailable",
            (0x89, _) => "server busy",
            (0x8A, _) => "banned",
            (0x8B, _) => "server shutting down",
            (0x8C, _) => "bad authentication method",
            (0x8D, _) => "keep alive timeout",
            (0x8E, _) => "session taken over",
            (0x8F, _) => "topic filter invalid",
            (0x90, _) => "topic name invalid",
            (0x91, _) => "packet identifier in use",
            (0x92, _) => "packet identifier not found",
            (0x93, _) => "receive maximum exceeded",
            (0x94, _) => "topic alias invalid",
            (0x95, _) => "packet too large",
            (0x96, _) => "message rate too high",
            (0x97, _) => "quota exceeded",
            (0x98, _) => "administrative action",
            (0x99, _) => "payload format invalid",
            (0x9A, _) => "retain not supported",
            (0x9B, _) => "QoS not supported",
            (0x9C, _) => "use another server",
            (0x9D, _) => "server moved",
            (0x9E, _) => "shared subscriptions not supported",
            (0x9F, _) => "connection rate exceeded",
            (0xA0, _) => "maximum connect time",
            (0xA1, _) => "subscription identifiers not supported",
            (0xA2, _) => "wildcard subscriptions not supported",
            _ => "invalid reason code",
        };
        f.write_str(msg)
    }
}

// Per-category tables, sorted by code so validate() can binary search.

const CONNACK_CODES: &[ReasonCode] = &[
    ReasonCode::SUCCESS,
    ReasonCode::UNSPECIFIED_ERROR,
    ReasonCode::MALFORMED_PACKET,
    ReasonCode::PROTOCOL_ERROR,
    ReasonCode::IMPLEMENTATION_SPECIFIC_ERROR,
    ReasonCode::UNSUPPORTED_PROTOCOL_VERSION,
    ReasonCode::CLIENT_ID_NOT_VALID,
    ReasonCode::BAD_USERNAME_OR_PASSWORD,
    ReasonCode::NOT_AUTHORIZED,
    ReasonCode::SERVER_UNAVAILABLE,
    ReasonCode::SERVER_BUSY,
    ReasonCode::BANNED,
    ReasonCode::BAD_AUTHENTICATION_METHOD,
    ReasonCode::TOPIC_NAME_INVALID,
    ReasonCode::PACKET_TOO_LARGE,
    ReasonCode::QUOTA_EXCEEDED,
    ReasonCode::PAYLOAD_FORMAT_INVALID,
    ReasonCode::RETAIN_NOT_SUPPORTED,
    ReasonCode::QOS_NOT_SUPPORTED,
    ReasonCode::USE_ANOTHER_SERVER,
    ReasonCode::SERVER_MOVED,
    ReasonCode::CONNECTION_RATE_EXCEEDED,
];

const PUBACK_PUBREC_CODES: &[ReasonCode] = &[
    ReasonCode::SUCCESS,
    ReasonCode::NO_MATCHING_SUBSCRIBERS,
    ReasonCode::UNSPECIFIED_ERROR,
    ReasonCode::IMPLEMENTATION_SPECIFIC_ERROR,
    ReasonCode::NOT_AUTHORIZED,
    ReasonCode::TOPIC_NAME_INVALID,
    ReasonCode::PACKET_ID_IN_USE,
    ReasonCode::QUOTA_EXCEEDED,
    ReasonCode::PAYLOAD_FORMAT_INVALID,
];

const PUBREL_PUBCOMP_CODES: &[ReasonCode] =
    &[ReasonCode::SUCCESS, ReasonCode::PACKET_ID_NOT_FOUND];

const SUBACK_CODES: &[ReasonCode] = &[
    ReasonCode::GRANTED_QOS_0,
    ReasonCode::GRANTED_QOS_1,
    ReasonCode::GRANTED_QOS_2,
    ReasonCode::UNSPECIFIED_ERROR,
    ReasonCode::IMPLEMENTATION_SPECIFIC_ERROR,
    ReasonCode::NOT_AUTHORIZED,
    ReasonCode::TOPIC_FILTER_INVALID,
    ReasonCode::PACKET_ID_IN_USE,
    ReasonCode::QUOTA_EXCEEDED,
    ReasonCode::SHARED_SUBSCRIPTIONS_NOT_SUPPORTED,
    ReasonCode::SUBSCRIPTION_IDS_NOT_SUPPORTED,
    ReasonCode::WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED,
];

const UNSUBACK_CODES: &[ReasonCode] = &[
    ReasonCode::SUCCESS,
    ReasonCode::NO_SUBSCRIPTION_EXISTED,
    ReasonCode::UNSPECIFIED_ERROR,
    ReasonCode::IMPLEMENTATION_SPECIFIC_ERROR,
    ReasonCode::NOT_AUTHORIZED,
    ReasonCode::TOPIC_FILTER_INVALID,
    ReasonCode::PACKET_ID_IN_USE,
];

const AUTH_CODES: &[ReasonCode] = &[ReasonCode::SUCCESS, ReasonCode::CONTINUE_AUTHENTICATION];

const DISCONNECT_CODES: &[ReasonCode] = &[
    ReasonCode::NORMAL_DISCONNECTION,
    ReasonCode::UNSPECIFIED_ERROR,
    ReasonCode::MALFORMED_PACKET,
    ReasonCode::PROTOCOL_ERROR,
    ReasonCode::IMPLEMENTATION_SPECIFIC_ERROR,
    ReasonCode::NOT_AUTHORIZED,
    ReasonCode::SERVER_BUSY,
    ReasonCode::SERVER_SHUTTING_DOWN,
    ReasonCode::KEEP_ALIVE_TIMEOUT,
    ReasonCode::SESSION_TAKEN_OVER,
    ReasonCode::TOPIC_FILTER_INVALID,
    ReasonCode::TOPIC_NAME_INVALID,
    ReasonCode::RECEIVE_MAXIMUM_EXCEEDED,
    ReasonCode::TOPIC_ALIAS_INVALID,
    ReasonCode::PACKET_TOO_LARGE,
    ReasonCode::MESSAGE_RATE_TOO_HIGH,
    ReasonCode::QUOTA_EXCEEDED,
    ReasonCode::ADMINISTRATIVE_ACTION,
    ReasonCode::PAYLOAD_FORMAT_INVALID,
    ReasonCode::RETAIN_NOT_SUPPORTED,
    ReasonCode::QOS_NOT_SUPPORTED,
    ReasonCode::USE_ANOTHER_SERVER,
    ReasonCode::SERVER_MOVED,
    ReasonCode::SHARED_SUBSCRIPTIONS_NOT_SUPPORTED,
    ReasonCode::CONNECTION_RATE_EXCEEDED,
    ReasonCode::MAXIMUM_CONNECT_TIME,
    ReasonCode::SUBSCRIPTION_IDS_NOT_SUPPORTED,
    ReasonCode::WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED,
];

fn valid_codes(category: ReasonCategory) -> &'static [ReasonCode] {
    match category {
        ReasonCategory::Connack => CONNACK_CODES,
        ReasonCategory::Puback | ReasonCategory::Pubrec => PUBACK_PUBREC_CODES,
        ReasonCategory::Pubrel | ReasonCategory::Pubcomp => PUBREL_PUBCOMP_CODES,
        ReasonCategory::Suback => SUBACK_CODES,
        ReasonCategory::Unsuback => UNSUBACK_CODES,
        ReasonCategory::Auth => AUTH_CODES,
        ReasonCategory::Disconnect => DISCONNECT_CODES,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_sorted() {
        for category in [
            ReasonCategory::Connack,
            ReasonCategory::Puback,
            ReasonCategory::Pubrel,
            ReasonCategory::Suback,
            ReasonCategory::Unsuback,
            ReasonCategory::Auth,
            ReasonCategory::Disconnect,
        ] {
            let table = valid_codes(category);
            assert!(
                table.windows(2).all(|w| w[0].value() < w[1].value()),
                "{category:?} table out of order"
            );
        }
    }

    #[test]
    fn validate_accepts_listed_codes() {
        let rc = ReasonCode::validate(0x88, ReasonCategory::Connack).unwrap();
        assert_eq!(rc, ReasonCode::SERVER_UNAVAILABLE);
        assert!(rc.is_error());

        let rc = ReasonCode::validate(0x00, ReasonCategory::Pubcomp).unwrap();
        assert_eq!(rc, ReasonCode::SUCCESS);
        assert!(!rc.is_error());
    }

    #[test]
    fn validate_rejects_unlisted_codes() {
        // granted QoS 1 is a SUBACK code, never a CONNACK code
        assert!(ReasonCode::validate(0x01, ReasonCategory::Connack).is_err());
        // keep alive timeout belongs to DISCONNECT only
        assert!(ReasonCode::validate(0x8D, ReasonCategory::Puback).is_err());
        assert!(ReasonCode::validate(0xFF, ReasonCategory::Auth).is_err());
    }

    #[test]
    fn category_distinguishes_equal_bytes() {
        let granted = ReasonCode::validate(0x00, ReasonCategory::Suback).unwrap();
        let success = ReasonCode::validate(0x00, ReasonCategory::Puback).unwrap();
        assert_eq!(granted, ReasonCode::GRANTED_QOS_0);
        assert_ne!(granted, success);
        assert_eq!(granted.value(), success.value());
    }
}
