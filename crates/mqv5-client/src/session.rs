//! Session state tracking.
//!
//! Holds everything that survives a reconnect of the same logical session:
//! unacknowledged outbound QoS 1/2 publishes (with their QoS 2 phase),
//! inbound QoS 2 packet identifiers awaiting PUBREL, topic alias mappings in
//! both directions and the negotiated flow-control windows.
//!
//! Key requirements:
//! - [MQTT-4.4.0-1] On reconnect with a live session, unacknowledged
//!   PUBLISH packets are re-sent with DUP=1 and their original identifiers;
//!   PUBREL packets are re-sent as-is.
//! - [MQTT-4.6.0-1] Re-delivery happens in the order originally sent.
//! - The number of unacknowledged QoS 1/2 sends never exceeds the broker's
//!   Receive Maximum.

use std::collections::{HashMap, VecDeque};

use tokio::sync::oneshot;

use mqv5_core::packet::{Connack, Publish};
use mqv5_core::reason::ReasonCode;

use crate::error::{ClientError, Result};

/// Progress of an outbound QoS 1/2 publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPhase {
    /// QoS 1: PUBLISH sent, awaiting PUBACK.
    AwaitingPuback,
    /// QoS 2: PUBLISH sent, awaiting PUBREC. The PUBLISH may still be
    /// retransmitted (with DUP set).
    AwaitingPubrec,
    /// QoS 2: PUBREC received, PUBREL sent, awaiting PUBCOMP. Only the
    /// PUBREL may be retransmitted from here on.
    AwaitingPubcomp,
}

/// Channel completing a user publish once its acknowledgement arrives.
pub type PublishResponder = oneshot::Sender<Result<ReasonCode>>;

/// An outbound QoS 1/2 publish awaiting acknowledgement.
#[derive(Debug)]
pub struct InflightPublish {
    pub serial: u32,
    pub publish: Publish,
    pub phase: AckPhase,
    /// Written to the wire at least once since the current connection came
    /// up. Only sent packets count against the flow-control window.
    pub sent: bool,
    pub responder: Option<PublishResponder>,
}

/// What to retransmit for one in-flight entry after a session resumes.
#[derive(Debug, Clone, PartialEq)]
pub enum ResendAction {
    /// Re-send the PUBLISH with DUP=1 and the original packet identifier.
    Publish(Publish),
    /// Re-send a bare PUBREL.
    Pubrel { packet_id: u16 },
}

/// Outcome of outbound topic alias assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasAssignment {
    /// Aliasing is off or the alias space is exhausted; send the full topic.
    None,
    /// First use: send the full topic together with the alias.
    FirstUse(u16),
    /// Established mapping: send an empty topic and the alias.
    Established(u16),
}

/// Client-side session state.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Last CONNACK session-present value.
    session_present: bool,
    /// A session was established at some point in this client's lifetime.
    active: bool,

    /// Outbound QoS 1/2 publishes in original send order.
    in_flight_send: VecDeque<InflightPublish>,
    /// Inbound QoS 2 identifiers: PUBREC sent, awaiting PUBREL.
    in_flight_recv: Vec<u16>,

    /// Outbound aliases: topic -> alias, bounded by the broker's
    /// Topic Alias Maximum from CONNACK.
    aliases_out: HashMap<String, u16>,
    alias_max_out: u16,
    /// Inbound aliases: alias -> topic, bounded by our own Topic Alias
    /// Maximum from CONNECT.
    aliases_in: HashMap<u16, String>,
    alias_max_in: u16,

    /// Broker's Receive Maximum: cap on unacknowledged QoS 1/2 sends.
    receive_max_out: u16,
}

impl SessionState {
    pub fn new(alias_max_in: u16) -> Self {
        Self {
            alias_max_in,
            receive_max_out: u16::MAX,
            ..Default::default()
        }
    }

    pub fn session_present(&self) -> bool {
        self.session_present
    }

    /// Whether this client ever established a session with the broker.
    pub fn active(&self) -> bool {
        self.active
    }

    /// Fold the broker's CONNACK grants into the session.
    pub fn apply_connack(&mut self, connack: &Connack) {
        self.session_present = connack.session_present;
        self.active = true;
        // Receive Maximum of 0 is a protocol error; absence means the
        // protocol default of 65535.
        self.receive_max_out = match connack.properties.receive_maximum {
            Some(0) | None => u16::MAX,
            Some(max) => max,
        };
        self.alias_max_out = connack.properties.topic_alias_maximum.unwrap_or(0);
        // Aliases never survive a network connection, on either side.
        self.aliases_out.clear();
        self.aliases_in.clear();
    }

    // === Outbound QoS 1/2 tracking ===

    pub fn push_inflight(&mut self, entry: InflightPublish) {
        self.in_flight_send.push_back(entry);
    }

    fn position(&self, packet_id: u16) -> Option<usize> {
        self.in_flight_send
            .iter()
            .position(|p| p.publish.packet_id == Some(packet_id))
    }

    /// Count a packet against the flow-control window once it hits the wire.
    pub fn mark_sent(&mut self, packet_id: u16) {
        if let Some(idx) = self.position(packet_id) {
            self.in_flight_send[idx].sent = true;
        }
    }

    /// Unacknowledged QoS 1/2 publishes currently on the wire.
    pub fn sent_count(&self) -> usize {
        self.in_flight_send.iter().filter(|p| p.sent).count()
    }

    /// Whether another throttled packet fits the Receive Maximum window.
    pub fn window_available(&self) -> bool {
        self.sent_count() < self.receive_max_out as usize
    }

    /// Complete a QoS 1 publish. Returns the entry so the caller can free
    /// the identifier and fire the responder.
    pub fn on_puback(&mut self, packet_id: u16) -> Option<InflightPublish> {
        let idx = self.position(packet_id)?;
        if self.in_flight_send[idx].phase != AckPhase::AwaitingPuback {
            return None;
        }
        self.in_flight_send.remove(idx)
    }

    /// Advance a QoS 2 publish to the PUBREL stage. Returns false for an
    /// unknown identifier or a repeated PUBREC.
    pub fn on_pubrec(&mut self, packet_id: u16) -> bool {
        match self.position(packet_id) {
            Some(idx) if self.in_flight_send[idx].phase == AckPhase::AwaitingPubrec => {
                self.in_flight_send[idx].phase = AckPhase::AwaitingPubcomp;
                true
            }
            _ => false,
        }
    }

    /// Abort a QoS 2 publish whose PUBREC carried an error reason code.
    pub fn abort_qos2(&mut self, packet_id: u16) -> Option<InflightPublish> {
        let idx = self.position(packet_id)?;
        self.in_flight_send.remove(idx)
    }

    /// Complete a QoS 2 publish.
    pub fn on_pubcomp(&mut self, packet_id: u16) -> Option<InflightPublish> {
        let idx = self.position(packet_id)?;
        if self.in_flight_send[idx].phase != AckPhase::AwaitingPubcomp {
            return None;
        }
        self.in_flight_send.remove(idx)
    }

    /// Retransmissions owed after a resumed session, in original send order.
    ///
    /// Also clears the per-connection `sent` marks; entries count against
    /// the window again once rewritten.
    pub fn resend_actions(&mut self) -> Vec<ResendAction> {
        self.in_flight_send
            .iter_mut()
            .map(|entry| {
                entry.sent = false;
                match entry.phase {
                    AckPhase::AwaitingPuback | AckPhase::AwaitingPubrec => {
                        let mut publish = entry.publish.clone();
                        publish.dup = true;
                        ResendAction::Publish(publish)
                    }
                    AckPhase::AwaitingPubcomp => ResendAction::Pubrel {
                        packet_id: entry.publish.packet_id.unwrap_or(0),
                    },
                }
            })
            .collect()
    }

    /// Take every in-flight outbound publish, leaving the tracker empty.
    pub fn drain_inflight(&mut self) -> Vec<InflightPublish> {
        self.in_flight_send.drain(..).collect()
    }

    /// Discard the session (broker reported `session_present = false`).
    ///
    /// Completes every pending publish with [`ClientError::SessionExpired`]
    /// and returns the identifiers to release.
    pub fn discard(&mut self) -> Vec<u16> {
        let mut freed = Vec::new();
        for mut entry in self.drain_inflight() {
            if let Some(pid) = entry.publish.packet_id {
                freed.push(pid);
            }
            if let Some(responder) = entry.responder.take() {
                let _ = responder.send(Err(ClientError::SessionExpired));
            }
        }
        self.in_flight_recv.clear();
        self.aliases_out.clear();
        self.aliases_in.clear();
        freed
    }

    // === Inbound QoS 2 tracking ===

    /// Record an inbound QoS 2 publish. Returns false if the identifier is
    /// already pending, i.e. the message is a duplicate and must not be
    /// delivered again.
    pub fn record_incoming_qos2(&mut self, packet_id: u16) -> bool {
        if self.in_flight_recv.contains(&packet_id) {
            return false;
        }
        self.in_flight_recv.push(packet_id);
        true
    }

    /// Complete an inbound QoS 2 exchange on PUBREL.
    pub fn release_incoming_qos2(&mut self, packet_id: u16) -> bool {
        if let Some(idx) = self.in_flight_recv.iter().position(|&p| p == packet_id) {
            self.in_flight_recv.remove(idx);
            true
        } else {
            false
        }
    }

    // === Topic aliases ===

    /// Pick an outbound alias for `topic`, establishing a mapping when
    /// capacity allows.
    pub fn assign_alias(&mut self, topic: &str) -> AliasAssignment {
        if self.alias_max_out == 0 {
            return AliasAssignment::None;
        }
        if let Some(&alias) = self.aliases_out.get(topic) {
            return AliasAssignment::Established(alias);
        }
        let next = self.aliases_out.len() as u16 + 1;
        if next > self.alias_max_out {
            return AliasAssignment::None;
        }
        self.aliases_out.insert(topic.to_string(), next);
        AliasAssignment::FirstUse(next)
    }

    /// Highest outbound alias the broker accepts.
    pub fn alias_max_out(&self) -> u16 {
        self.alias_max_out
    }

    /// Resolve the topic of an inbound publish, maintaining the inbound
    /// alias map.
    pub fn resolve_incoming_topic(
        &mut self,
        topic: &str,
        alias: Option<u16>,
    ) -> Result<String> {
        match alias {
            Some(alias) => {
                if alias == 0 || alias > self.alias_max_in {
                    return Err(ClientError::TopicAliasMaximumReached);
                }
                if topic.is_empty() {
                    self.aliases_in
                        .get(&alias)
                        .cloned()
                        .ok_or(ClientError::TopicAliasMaximumReached)
                } else {
                    self.aliases_in.insert(alias, topic.to_string());
                    Ok(topic.to_string())
                }
            }
            None if topic.is_empty() => Err(ClientError::Protocol(
                mqv5_core::error::ProtocolError::MalformedPacket(
                    "PUBLISH with empty topic and no alias".into(),
                ),
            )),
            None => Ok(topic.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mqv5_core::packet::QoS;
    use mqv5_core::properties::{ConnackProperties, PublishProperties};

    fn publish(packet_id: u16, qos: QoS) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            topic: "t".into(),
            packet_id: Some(packet_id),
            properties: PublishProperties::default(),
            payload: Bytes::from_static(b"x"),
        }
    }

    fn inflight(packet_id: u16, qos: QoS, serial: u32) -> InflightPublish {
        InflightPublish {
            serial,
            publish: publish(packet_id, qos),
            phase: if qos == QoS::AtLeastOnce {
                AckPhase::AwaitingPuback
            } else {
                AckPhase::AwaitingPubrec
            },
            sent: false,
            responder: None,
        }
    }

    fn connack(session_present: bool, properties: ConnackProperties) -> Connack {
        Connack {
            session_present,
            reason_code: ReasonCode::SUCCESS,
            properties,
        }
    }

    #[test]
    fn qos1_lifecycle() {
        let mut session = SessionState::new(0);
        session.push_inflight(inflight(1, QoS::AtLeastOnce, 1));
        session.mark_sent(1);
        assert_eq!(session.sent_count(), 1);

        let done = session.on_puback(1).unwrap();
        assert_eq!(done.publish.packet_id, Some(1));
        assert_eq!(session.sent_count(), 0);
        assert!(session.on_puback(1).is_none());
    }

    #[test]
    fn qos2_lifecycle() {
        let mut session = SessionState::new(0);
        session.push_inflight(inflight(1, QoS::ExactlyOnce, 1));

        assert!(session.on_pubrec(1));
        // repeated PUBREC is ignored
        assert!(!session.on_pubrec(1));
        // PUBACK never completes a QoS 2 publish
        assert!(session.on_puback(1).is_none());
        assert!(session.on_pubcomp(1).is_some());
        assert!(session.on_pubcomp(1).is_none());
    }

    #[test]
    fn resend_order_and_phases() {
        let mut session = SessionState::new(0);
        session.push_inflight(inflight(1, QoS::AtLeastOnce, 1));
        session.push_inflight(inflight(2, QoS::ExactlyOnce, 2));
        session.push_inflight(inflight(3, QoS::ExactlyOnce, 3));
        session.mark_sent(1);
        session.mark_sent(2);
        session.mark_sent(3);
        session.on_pubrec(3);

        let actions = session.resend_actions();
        assert_eq!(actions.len(), 3);
        match &actions[0] {
            ResendAction::Publish(p) => {
                assert_eq!(p.packet_id, Some(1));
                assert!(p.dup);
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert!(matches!(&actions[1], ResendAction::Publish(p) if p.packet_id == Some(2)));
        assert_eq!(actions[2], ResendAction::Pubrel { packet_id: 3 });
        // sent marks reset until the retransmissions hit the wire
        assert_eq!(session.sent_count(), 0);
    }

    #[test]
    fn discard_completes_handlers_with_session_expired() {
        let mut session = SessionState::new(0);
        let (tx, mut rx) = oneshot::channel();
        let mut entry = inflight(7, QoS::AtLeastOnce, 1);
        entry.responder = Some(tx);
        session.push_inflight(entry);

        let freed = session.discard();
        assert_eq!(freed, vec![7]);
        match rx.try_recv().unwrap() {
            Err(ClientError::SessionExpired) => {}
            other => panic!("expected session expired, got {other:?}"),
        }
    }

    #[test]
    fn window_tracks_broker_receive_maximum() {
        let mut session = SessionState::new(0);
        session.apply_connack(&connack(
            false,
            ConnackProperties {
                receive_maximum: Some(2),
                ..Default::default()
            },
        ));

        session.push_inflight(inflight(1, QoS::AtLeastOnce, 1));
        session.push_inflight(inflight(2, QoS::AtLeastOnce, 2));
        assert!(session.window_available());
        session.mark_sent(1);
        assert!(session.window_available());
        session.mark_sent(2);
        assert!(!session.window_available());
        session.on_puback(1);
        assert!(session.window_available());
    }

    #[test]
    fn incoming_qos2_deduplicates() {
        let mut session = SessionState::new(0);
        assert!(session.record_incoming_qos2(100));
        assert!(!session.record_incoming_qos2(100));
        assert!(session.release_incoming_qos2(100));
        assert!(!session.release_incoming_qos2(100));
    }

    #[test]
    fn outbound_aliases_respect_broker_maximum() {
        let mut session = SessionState::new(0);
        session.apply_connack(&connack(
            false,
            ConnackProperties {
                topic_alias_maximum: Some(2),
                ..Default::default()
            },
        ));

        assert_eq!(session.assign_alias("a"), AliasAssignment::FirstUse(1));
        assert_eq!(session.assign_alias("a"), AliasAssignment::Established(1));
        assert_eq!(session.assign_alias("b"), AliasAssignment::FirstUse(2));
        // alias space exhausted: fall back to full topics
        assert_eq!(session.assign_alias("c"), AliasAssignment::None);
    }

    #[test]
    fn incoming_alias_resolution() {
        let mut session = SessionState::new(4);
        assert_eq!(
            session.resolve_incoming_topic("news", Some(2)).unwrap(),
            "news"
        );
        assert_eq!(session.resolve_incoming_topic("", Some(2)).unwrap(), "news");
        assert!(session.resolve_incoming_topic("", Some(3)).is_err());
        assert!(session.resolve_incoming_topic("x", Some(5)).is_err());
        assert!(session.resolve_incoming_topic("", None).is_err());
    }

    #[test]
    fn aliases_cleared_on_reconnect() {
        let mut session = SessionState::new(4);
        session.apply_connack(&connack(
            false,
            ConnackProperties {
                topic_alias_maximum: Some(4),
                ..Default::default()
            },
        ));
        assert_eq!(session.assign_alias("a"), AliasAssignment::FirstUse(1));
        session.resolve_incoming_topic("news", Some(1)).unwrap();

        session.apply_connack(&connack(
            true,
            ConnackProperties {
                topic_alias_maximum: Some(4),
                ..Default::default()
            },
        ));
        assert_eq!(session.assign_alias("a"), AliasAssignment::FirstUse(1));
        assert!(session.resolve_incoming_topic("", Some(1)).is_err());
    }
}
