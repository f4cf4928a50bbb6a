//! Will message (Last Will and Testament) support.
//!
//! Implements requirements:
//! - [MQTT-3.1.2-8] If Will Flag is set, Will Message MUST be stored and
//!   published on abnormal disconnect
//! - [MQTT-3.1.2-9] Will Topic and Will Message fields MUST be present if
//!   Will Flag is set

use bytes::Bytes;

use mqv5_core::packet::{self, QoS};
use mqv5_core::properties::WillProperties;

/// Last Will and Testament message.
///
/// The Will Message is published by the broker if the client disconnects
/// unexpectedly (without sending DISCONNECT).
#[derive(Debug, Clone)]
pub struct Will {
    /// Topic to publish the will message to.
    pub topic: String,
    /// Will message payload.
    pub payload: Bytes,
    /// QoS level for will message delivery.
    pub qos: QoS,
    /// Whether the will message should be retained.
    pub retain: bool,
    /// Will properties (delay interval, expiry, content type, ...).
    pub properties: WillProperties,
}

impl Will {
    /// Create a new will message with QoS 0 and no retain.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            properties: WillProperties::default(),
        }
    }

    /// Set the QoS level for the will message.
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set whether the will message should be retained.
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Delay, in seconds, before the broker publishes the will.
    pub fn delay_interval(mut self, seconds: u32) -> Self {
        self.properties.will_delay_interval = Some(seconds);
        self
    }

    /// Set the full property block.
    pub fn properties(mut self, properties: WillProperties) -> Self {
        self.properties = properties;
        self
    }

    pub(crate) fn to_packet(&self) -> packet::Will {
        packet::Will {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos,
            retain: self.retain,
            properties: self.properties.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn will_builder() {
        let will = Will::new("client/status", "offline")
            .qos(QoS::AtLeastOnce)
            .retain(true)
            .delay_interval(30);

        assert_eq!(will.topic, "client/status");
        assert_eq!(will.payload.as_ref(), b"offline");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);

        let wire = will.to_packet();
        assert_eq!(wire.properties.will_delay_interval, Some(30));
    }
}
