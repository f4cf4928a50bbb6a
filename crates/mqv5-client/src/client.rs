//! Async MQTT 5.0 client.
//!
//! Split architecture: [`AsyncClient`] (cloneable handle) + [`EventLoop`]
//! (owns the connection). Commands travel over a channel; each user
//! operation completes through its own oneshot once the matching
//! acknowledgement arrives from the broker. Dropping a pending operation
//! future detaches it: the acknowledgement is still consumed and the packet
//! identifier released.
//!
//! ## Basic usage
//!
//! ```ignore
//! let config = ClientConfig::new("broker.example:1883").client_id("sensor-1");
//! let (client, mut eventloop) = AsyncClient::new(config, 10);
//!
//! tokio::spawn(async move {
//!     client.subscribe(&[("commands/#", QoS::AtLeastOnce)]).await?;
//!     client.publish("status", "online", QoS::AtLeastOnce, false).await?;
//! });
//!
//! while let Ok(event) = eventloop.poll().await {
//!     if let Event::Message(msg) = event {
//!         println!("{}: {:?}", msg.topic, msg.payload);
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use mqv5_core::packet::{
    encode_packet, decode_packet, Ack, Auth, Disconnect, Packet, Publish, QoS, Subscribe,
    SubscriptionOptions, Unsubscribe,
};
use mqv5_core::properties::{
    AuthProperties, ConnackProperties, PublishProperties, SubscribeProperties,
    UnsubscribeProperties,
};
use mqv5_core::reason::ReasonCode;

use crate::auth::{AuthStep, Authenticator};
use crate::config::ClientConfig;
use crate::connect::{connect_endpoint, ConnectOutcome};
use crate::error::{ClientError, Result};
use crate::hosts::Endpoints;
use crate::packet_id::PacketIdAllocator;
use crate::send_queue::{send_flags, QueuedPacket, SendQueue};
use crate::session::{AckPhase, AliasAssignment, InflightPublish, SessionState};

const DEFAULT_BUFFER_SIZE: usize = 8192;
/// Back-off after a full unsuccessful pass over the broker list.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Events yielded by the [`EventLoop`].
#[derive(Debug)]
pub enum Event {
    /// Connected to a broker.
    Connected { session_present: bool },
    /// An application message arrived. Topic aliases are already resolved.
    Message(Publish),
    /// The connection went down; the loop keeps reconnecting unless the
    /// disconnect was requested locally.
    Disconnected { reason: Option<ReasonCode> },
    /// A connect attempt failed; the supervisor moves on.
    Reconnecting { attempt: u32 },
}

type AckWaiter = oneshot::Sender<Result<Vec<ReasonCode>>>;

/// Commands sent from [`AsyncClient`] to [`EventLoop`].
enum Command {
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        properties: PublishProperties,
        resp: oneshot::Sender<Result<ReasonCode>>,
    },
    Subscribe {
        filters: Vec<(String, SubscriptionOptions)>,
        properties: SubscribeProperties,
        resp: AckWaiter,
    },
    Unsubscribe {
        topics: Vec<String>,
        properties: UnsubscribeProperties,
        resp: AckWaiter,
    },
    ReAuthenticate {
        resp: oneshot::Sender<Result<()>>,
    },
    Disconnect,
}

/// Async MQTT client handle.
///
/// `Clone` and shareable across tasks. All methods enqueue work for the
/// [`EventLoop`], which must be polled to make progress.
#[derive(Clone)]
pub struct AsyncClient {
    tx: mpsc::Sender<Command>,
}

impl AsyncClient {
    /// Create a new client and event loop pair.
    ///
    /// `cap` is the command channel capacity (10 is usually fine).
    pub fn new(config: ClientConfig, cap: usize) -> (Self, EventLoop) {
        let (tx, rx) = mpsc::channel(cap);
        (Self { tx }, EventLoop::new(config, rx))
    }

    /// Publish a message and await its acknowledgement.
    ///
    /// QoS 0 completes as soon as the message is queued; QoS 1 completes on
    /// PUBACK and QoS 2 on PUBCOMP, yielding the broker's reason code.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<ReasonCode> {
        self.publish_with_properties(topic, payload, qos, retain, PublishProperties::default())
            .await
    }

    /// [`publish`](Self::publish) with an explicit property block.
    pub async fn publish_with_properties(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
        properties: PublishProperties,
    ) -> Result<ReasonCode> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::Publish {
                topic: topic.to_string(),
                payload: payload.into(),
                qos,
                retain,
                properties,
                resp,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Subscribe to topic filters, awaiting the per-filter reason codes.
    pub async fn subscribe(&self, filters: &[(&str, QoS)]) -> Result<Vec<ReasonCode>> {
        let filters = filters
            .iter()
            .map(|(topic, qos)| {
                (
                    topic.to_string(),
                    SubscriptionOptions {
                        qos: *qos,
                        ..Default::default()
                    },
                )
            })
            .collect();
        self.subscribe_with_options(filters, SubscribeProperties::default())
            .await
    }

    /// [`subscribe`](Self::subscribe) with full subscription options and
    /// properties.
    pub async fn subscribe_with_options(
        &self,
        filters: Vec<(String, SubscriptionOptions)>,
        properties: SubscribeProperties,
    ) -> Result<Vec<ReasonCode>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::Subscribe {
                filters,
                properties,
                resp,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Unsubscribe from topic filters.
    pub async fn unsubscribe(&self, topics: &[&str]) -> Result<Vec<ReasonCode>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::Unsubscribe {
                topics: topics.iter().map(|t| t.to_string()).collect(),
                properties: UnsubscribeProperties::default(),
                resp,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Start a re-authentication exchange with the configured authenticator.
    pub async fn re_authenticate(&self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::ReAuthenticate { resp })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Disconnect from the broker.
    pub async fn disconnect(&self) -> Result<()> {
        let _ = self.tx.send(Command::Disconnect).await;
        Ok(())
    }
}

/// The event loop driving MQTT I/O.
///
/// Call [`poll`](Self::poll) repeatedly to process packets, keep-alive and
/// reconnection.
pub struct EventLoop {
    config: ClientConfig,
    rx: mpsc::Receiver<Command>,
    endpoints: Endpoints,

    transport: Option<crate::transport::Transport>,
    /// Bumped whenever a fresh transport is installed; failure observers
    /// holding an older generation lost the race to another reconnect.
    generation: u64,
    read_buf: BytesMut,

    session: SessionState,
    queue: SendQueue,
    packet_ids: PacketIdAllocator,
    authenticator: Option<Box<dyn Authenticator>>,
    /// Broker grants from the last CONNACK.
    ca_props: ConnackProperties,

    sub_waiters: HashMap<u16, AckWaiter>,
    unsub_waiters: HashMap<u16, AckWaiter>,
    reauth_waiter: Option<oneshot::Sender<Result<()>>>,

    /// When the client last wrote a packet; PINGREQ is due at
    /// `last_send + keep_alive`.
    last_send: Instant,
    /// When the broker was last heard from; silence past 1.5x keep-alive
    /// means the connection is dead.
    last_recv: Instant,
    reconnect_attempt: u32,
    /// Retry the next connect with clean start after a session-present
    /// mismatch.
    force_clean_start: bool,
    /// A terminal DISCONNECT is queued; no further sends accepted.
    closing: bool,
    /// The loop is finished.
    closed: bool,
}

impl EventLoop {
    fn new(config: ClientConfig, rx: mpsc::Receiver<Command>) -> Self {
        let endpoints = Endpoints::new(&config.brokers, config.default_port);
        let session = SessionState::new(
            config
                .connect_properties
                .topic_alias_maximum
                .unwrap_or(0),
        );
        Self {
            config,
            rx,
            endpoints,
            transport: None,
            generation: 0,
            read_buf: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            session,
            queue: SendQueue::new(),
            packet_ids: PacketIdAllocator::new(),
            authenticator: None,
            ca_props: ConnackProperties::default(),
            sub_waiters: HashMap::new(),
            unsub_waiters: HashMap::new(),
            reauth_waiter: None,
            last_send: Instant::now(),
            last_recv: Instant::now(),
            reconnect_attempt: 0,
            force_clean_start: false,
            closing: false,
            closed: false,
        }
    }

    /// Install an enhanced authenticator. Must be set before the first
    /// [`poll`](Self::poll).
    pub fn set_authenticator(&mut self, authenticator: Box<dyn Authenticator>) {
        self.authenticator = Some(authenticator);
    }

    /// Check if connected to a broker.
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Session-present value from the last CONNACK.
    pub fn session_present(&self) -> bool {
        self.session.session_present()
    }

    /// Poll for the next event. Drives all I/O; call in a loop.
    pub async fn poll(&mut self) -> Result<Event> {
        let mut buf = [0u8; 4096];
        loop {
            if self.closed {
                return Err(ClientError::ConnectionClosed);
            }

            if self.transport.is_none() {
                if self.closing {
                    self.closed = true;
                    return Ok(Event::Disconnected { reason: None });
                }
                return self.supervise().await;
            }

            // Drain the send queue before waiting for input.
            let generation = self.generation;
            match self.flush_queue().await {
                Ok(true) => {
                    self.closed = true;
                    return Ok(Event::Disconnected { reason: None });
                }
                Ok(false) => {}
                Err(e) => {
                    self.handle_stream_error(generation, e).await?;
                    continue;
                }
            }

            // Hand out packets already buffered.
            match self.process_read_buffer().await {
                Ok(Some(event)) => return Ok(event),
                Ok(None) => {}
                Err(e) => {
                    self.handle_stream_error(generation, e).await?;
                    continue;
                }
            }

            // Keep-alive deadlines are anchored to the last send and the
            // last receive, not to this loop iteration: a PINGREQ is due
            // once the client has sent nothing for the keep-alive interval
            // (inbound traffic must not postpone it), and the connection is
            // dead once the broker has sent nothing for 1.5x that.
            let (ping_deadline, read_deadline) = if self.config.keep_alive > 0 {
                let interval = Duration::from_secs(self.config.keep_alive as u64);
                (
                    Some(self.last_send + interval),
                    Some(self.last_recv + interval * 3 / 2),
                )
            } else {
                (None, None)
            };
            let timer_deadline = match (ping_deadline, read_deadline) {
                (Some(ping), Some(read)) => ping.min(read),
                // keep-alive disabled: park the timer arm
                _ => Instant::now() + Duration::from_secs(3600),
            };

            enum Action {
                Read(std::io::Result<usize>),
                Command(Option<Command>),
                Timeout,
            }

            let action = {
                let transport = match self.transport.as_mut() {
                    Some(t) => t,
                    None => continue,
                };
                tokio::select! {
                    result = transport.read(&mut buf) => Action::Read(result),
                    cmd = self.rx.recv() => Action::Command(cmd),
                    _ = tokio::time::sleep_until(timer_deadline) => Action::Timeout,
                }
            };

            match action {
                Action::Read(Ok(0)) => {
                    log::debug!("connection closed by broker");
                    self.request_reconnect(generation);
                }
                Action::Read(Ok(n)) => {
                    self.last_recv = Instant::now();
                    self.read_buf.extend_from_slice(&buf[..n]);
                }
                Action::Read(Err(e)) => {
                    self.handle_stream_error(generation, ClientError::Io(e)).await?;
                }
                Action::Command(Some(cmd)) => self.handle_command(cmd).await,
                Action::Command(None) => {
                    // every handle dropped: clean disconnect
                    self.begin_disconnect();
                }
                Action::Timeout => {
                    let now = Instant::now();
                    if read_deadline.is_some_and(|deadline| now >= deadline) {
                        log::warn!("no broker traffic within 1.5x keep-alive, reconnecting");
                        self.request_reconnect(generation);
                    } else if ping_deadline.is_some_and(|deadline| now >= deadline) {
                        // the flush at the top of the loop writes it and
                        // advances last_send
                        let _ = self.enqueue(&Packet::Pingreq, send_flags::PRIORITIZED);
                    }
                }
            }
        }
    }

    // === Reconnect supervision ===

    /// One connect attempt per call. Emits `Connected` on success and
    /// `Reconnecting` on a retriable failure; fatal failures end the loop.
    async fn supervise(&mut self) -> Result<Event> {
        self.reconnect_attempt += 1;
        let attempt = self.reconnect_attempt;

        // A completed pass over the broker list backs off before wrapping;
        // an empty or unresolvable list is unrecoverable.
        let (addrs, broker) = match self.endpoints.next_endpoint().await {
            Ok(endpoint) => endpoint,
            Err(ClientError::TryAgain) => {
                log::debug!("broker list exhausted, backing off");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                return Ok(Event::Reconnecting { attempt });
            }
            Err(e) => {
                self.fail_pending();
                return Err(e);
            }
        };

        match self.establish(&addrs, &broker).await {
            Ok(session_present) => {
                self.reconnect_attempt = 0;
                Ok(Event::Connected { session_present })
            }
            Err(e) if e.is_fatal() => {
                self.fail_pending();
                Err(e)
            }
            // connect failures (timeouts, refusals, authenticator errors)
            // move straight to the next endpoint
            Err(e) => {
                log::warn!("connect attempt {attempt} to {broker} failed: {e}");
                Ok(Event::Reconnecting { attempt })
            }
        }
    }

    async fn establish(
        &mut self,
        addrs: &[std::net::SocketAddr],
        broker: &crate::hosts::Broker,
    ) -> Result<bool> {
        let clean_start = if self.force_clean_start {
            true
        } else if !self.session.active() {
            self.config.clean_start
        } else {
            // resuming an existing session
            false
        };

        let outcome = tokio::time::timeout(
            self.config.connect_timeout,
            connect_endpoint(
                &self.config,
                broker,
                addrs,
                &mut self.authenticator,
                clean_start,
            ),
        )
        .await
        .map_err(|_| ClientError::ConnectionTimeout)??;
        let ConnectOutcome {
            mut transport,
            connack,
        } = outcome;

        if connack.session_present && (clean_start || !self.session.active()) {
            // The broker claims a session we never had: refuse it and retry
            // from scratch.
            log::warn!("broker reported an unknown session, retrying with clean start");
            let mut wire = Vec::new();
            encode_packet(
                &Packet::Disconnect(Disconnect {
                    reason_code: ReasonCode::PROTOCOL_ERROR,
                    properties: Default::default(),
                }),
                &mut wire,
            );
            let _ = transport.write_all(&wire).await;
            let _ = transport.flush().await;
            self.force_clean_start = true;
            return Err(ClientError::TryAgain);
        }

        if !connack.session_present && self.session.active() {
            // Our session is gone on the broker side.
            log::warn!("broker session expired, discarding local session state");
            for pid in self.session.discard() {
                self.packet_ids.free(pid);
            }
        }

        self.force_clean_start = false;
        self.session.apply_connack(&connack);
        self.ca_props = connack.properties.clone();
        self.transport = Some(transport);
        self.generation += 1;
        self.read_buf.clear();
        self.last_send = Instant::now();
        self.last_recv = self.last_send;
        self.queue.reopen();

        if connack.session_present {
            self.arm_session_replay();
        }
        Ok(connack.session_present)
    }

    /// Re-enqueue unacknowledged QoS 1/2 traffic at the head of the queue:
    /// PUBLISH with DUP set for entries still awaiting PUBREC/PUBACK, bare
    /// PUBREL for entries past PUBREC. Original packet identifiers and send
    /// order are preserved.
    fn arm_session_replay(&mut self) {
        use crate::session::ResendAction;

        let actions = self.session.resend_actions();
        if actions.is_empty() {
            return;
        }
        log::debug!("re-arming {} in-flight packets", actions.len());
        let replays = actions
            .into_iter()
            .map(|action| {
                let (packet, packet_id) = match action {
                    ResendAction::Publish(publish) => {
                        let pid = publish.packet_id.unwrap_or(0);
                        (Packet::Publish(publish), pid)
                    }
                    ResendAction::Pubrel { packet_id } => {
                        (Packet::Pubrel(Ack::new(packet_id)), packet_id)
                    }
                };
                let mut bytes = Vec::new();
                encode_packet(&packet, &mut bytes);
                QueuedPacket {
                    serial: self.queue.next_serial(),
                    flags: send_flags::THROTTLED,
                    packet_id,
                    bytes: bytes.into(),
                }
            })
            .collect();
        self.queue.requeue_front(replays);
    }

    /// Accept one reconnect request per live stream. A caller holding a
    /// stale generation observed a failure on a stream that has already
    /// been replaced; its request is dropped and the operation retried on
    /// the fresh stream.
    fn request_reconnect(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.transport.is_none() {
            return false;
        }
        self.drop_transport();
        true
    }

    fn drop_transport(&mut self) {
        self.transport = None;
        self.read_buf.clear();
    }

    async fn handle_stream_error(&mut self, generation: u64, error: ClientError) -> Result<()> {
        match &error {
            ClientError::Protocol(e) => {
                // the broker violated the protocol: tell it why, then
                // replace the stream
                log::warn!("protocol error from broker: {e}");
                self.send_disconnect_now(ReasonCode::MALFORMED_PACKET).await;
                self.request_reconnect(generation);
                Ok(())
            }
            ClientError::TopicAliasMaximumReached => {
                self.send_disconnect_now(ReasonCode::TOPIC_ALIAS_INVALID).await;
                self.request_reconnect(generation);
                Ok(())
            }
            e if e.should_reconnect() => {
                log::debug!("transport error: {error}");
                self.request_reconnect(generation);
                Ok(())
            }
            _ => Err(error),
        }
    }

    /// Best-effort DISCONNECT ahead of dropping a broken stream.
    async fn send_disconnect_now(&mut self, reason_code: ReasonCode) {
        if let Some(transport) = self.transport.as_mut() {
            let mut wire = Vec::new();
            encode_packet(
                &Packet::Disconnect(Disconnect {
                    reason_code,
                    properties: Default::default(),
                }),
                &mut wire,
            );
            let _ = transport.write_all(&wire).await;
            let _ = transport.flush().await;
        }
    }

    fn fail_pending(&mut self) {
        for (_, waiter) in self.sub_waiters.drain() {
            let _ = waiter.send(Err(ClientError::NoRecovery));
        }
        for (_, waiter) in self.unsub_waiters.drain() {
            let _ = waiter.send(Err(ClientError::NoRecovery));
        }
        if let Some(waiter) = self.reauth_waiter.take() {
            let _ = waiter.send(Err(ClientError::NoRecovery));
        }
        for mut entry in self.session.drain_inflight() {
            if let Some(pid) = entry.publish.packet_id {
                self.packet_ids.free(pid);
            }
            if let Some(responder) = entry.responder.take() {
                let _ = responder.send(Err(ClientError::NoRecovery));
            }
        }
    }

    // === Write pump ===

    /// Write every eligible packet. Returns true once a terminal packet
    /// went out and the connection was shut down.
    async fn flush_queue(&mut self) -> Result<bool> {
        while let Some(packet) = self.queue.pop(self.session.window_available()) {
            let transport = self.transport.as_mut().ok_or(ClientError::NotConnected)?;
            transport.write_all(&packet.bytes).await?;
            self.last_send = Instant::now();
            if packet.is(send_flags::THROTTLED) && packet.packet_id != 0 {
                self.session.mark_sent(packet.packet_id);
            }
            if packet.is(send_flags::TERMINAL) {
                transport.flush().await?;
                let _ = transport.shutdown().await;
                self.drop_transport();
                return Ok(true);
            }
        }
        if let Some(transport) = self.transport.as_mut() {
            transport.flush().await?;
        }
        Ok(false)
    }

    fn enqueue(&mut self, packet: &Packet, flags: u8) -> Result<()> {
        let mut bytes = Vec::new();
        encode_packet(packet, &mut bytes);
        let serial = self.queue.next_serial();
        self.queue.push(QueuedPacket {
            serial,
            flags,
            packet_id: packet.packet_id(),
            bytes: bytes.into(),
        })
    }

    fn begin_disconnect(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        if self.transport.is_some() {
            let _ = self.enqueue(
                &Packet::Disconnect(Disconnect::default()),
                send_flags::PRIORITIZED | send_flags::TERMINAL,
            );
        } else {
            self.closed = true;
        }
    }

    // === Read pump ===

    async fn process_read_buffer(&mut self) -> Result<Option<Event>> {
        loop {
            let Some((packet, consumed)) =
                decode_packet(&self.read_buf[..], self.config.max_packet_size)?
            else {
                return Ok(None);
            };
            let _ = self.read_buf.split_to(consumed);
            if let Some(event) = self.handle_packet(packet).await? {
                return Ok(Some(event));
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<Option<Event>> {
        match packet {
            Packet::Publish(publish) => self.handle_incoming_publish(publish),
            Packet::Puback(ack) => {
                if let Some(mut entry) = self.session.on_puback(ack.packet_id) {
                    self.packet_ids.free(ack.packet_id);
                    if let Some(responder) = entry.responder.take() {
                        let _ = responder.send(Ok(ack.reason_code));
                    }
                }
                Ok(None)
            }
            Packet::Pubrec(ack) => {
                if ack.reason_code.is_error() {
                    // the exchange stops here; hand the reason code back
                    if let Some(mut entry) = self.session.abort_qos2(ack.packet_id) {
                        self.packet_ids.free(ack.packet_id);
                        if let Some(responder) = entry.responder.take() {
                            let _ = responder.send(Ok(ack.reason_code));
                        }
                    }
                } else if self.session.on_pubrec(ack.packet_id) {
                    // a dropped PUBREL replays after the next reconnect
                    let _ = self.enqueue(
                        &Packet::Pubrel(Ack::new(ack.packet_id)),
                        send_flags::PRIORITIZED,
                    );
                }
                Ok(None)
            }
            Packet::Pubcomp(ack) => {
                if let Some(mut entry) = self.session.on_pubcomp(ack.packet_id) {
                    self.packet_ids.free(ack.packet_id);
                    if let Some(responder) = entry.responder.take() {
                        let _ = responder.send(Ok(ack.reason_code));
                    }
                }
                Ok(None)
            }
            Packet::Pubrel(ack) => {
                let reason_code = if self.session.release_incoming_qos2(ack.packet_id) {
                    ReasonCode::SUCCESS
                } else {
                    ReasonCode::PACKET_ID_NOT_FOUND
                };
                let _ = self.enqueue(
                    &Packet::Pubcomp(Ack {
                        reason_code,
                        ..Ack::new(ack.packet_id)
                    }),
                    send_flags::PRIORITIZED,
                );
                Ok(None)
            }
            Packet::Suback(suback) => {
                if let Some(waiter) = self.sub_waiters.remove(&suback.packet_id) {
                    self.packet_ids.free(suback.packet_id);
                    let _ = waiter.send(Ok(suback.reason_codes));
                }
                Ok(None)
            }
            Packet::Unsuback(unsuback) => {
                if let Some(waiter) = self.unsub_waiters.remove(&unsuback.packet_id) {
                    self.packet_ids.free(unsuback.packet_id);
                    let _ = waiter.send(Ok(unsuback.reason_codes));
                }
                Ok(None)
            }
            // PINGRESP already counted as inbound traffic at read time
            Packet::Pingresp => Ok(None),
            Packet::Disconnect(disconnect) => {
                log::warn!("broker disconnected: {}", disconnect.reason_code);
                self.drop_transport();
                Ok(Some(Event::Disconnected {
                    reason: Some(disconnect.reason_code),
                }))
            }
            Packet::Auth(auth) => self.handle_auth(auth).await,
            other => Err(ClientError::Protocol(
                mqv5_core::error::ProtocolError::MalformedPacket(format!(
                    "unexpected {:?} from broker",
                    other.packet_type()
                )),
            )),
        }
    }

    fn handle_incoming_publish(&mut self, mut publish: Publish) -> Result<Option<Event>> {
        let topic = self
            .session
            .resolve_incoming_topic(&publish.topic, publish.properties.topic_alias)?;
        publish.topic = topic;
        publish.properties.topic_alias = None;

        match publish.qos {
            QoS::AtMostOnce => Ok(Some(Event::Message(publish))),
            QoS::AtLeastOnce => {
                let packet_id = publish.packet_id.unwrap_or(0);
                let _ =
                    self.enqueue(&Packet::Puback(Ack::new(packet_id)), send_flags::PRIORITIZED);
                Ok(Some(Event::Message(publish)))
            }
            QoS::ExactlyOnce => {
                let packet_id = publish.packet_id.unwrap_or(0);
                // deliver only the first copy; PUBREC goes out either way
                let fresh = self.session.record_incoming_qos2(packet_id);
                let _ =
                    self.enqueue(&Packet::Pubrec(Ack::new(packet_id)), send_flags::PRIORITIZED);
                Ok(fresh.then_some(Event::Message(publish)))
            }
        }
    }

    /// Server-driven AUTH rounds outside the connect handshake
    /// (re-authentication).
    async fn handle_auth(&mut self, auth: Auth) -> Result<Option<Event>> {
        let method = match self.authenticator.as_ref().map(|a| a.method().to_string()) {
            Some(m) if !m.is_empty() => m,
            _ => {
                self.send_disconnect_now(ReasonCode::PROTOCOL_ERROR).await;
                let generation = self.generation;
                self.request_reconnect(generation);
                return Ok(None);
            }
        };
        if auth
            .properties
            .authentication_method
            .as_deref()
            .is_some_and(|m| m != method)
        {
            self.send_disconnect_now(ReasonCode::PROTOCOL_ERROR).await;
            let generation = self.generation;
            self.request_reconnect(generation);
            return Ok(None);
        }

        let data = auth.properties.authentication_data.clone().unwrap_or_default();
        let authenticator = self
            .authenticator
            .as_mut()
            .expect("checked above");

        if auth.reason_code == ReasonCode::CONTINUE_AUTHENTICATION {
            match authenticator.auth(AuthStep::ServerChallenge, data).await {
                Ok(response) => {
                    let _ = self.enqueue(
                        &Packet::Auth(Auth {
                            reason_code: ReasonCode::CONTINUE_AUTHENTICATION,
                            properties: AuthProperties {
                                authentication_method: Some(method),
                                authentication_data: Some(response),
                                ..Default::default()
                            },
                        }),
                        send_flags::NONE,
                    );
                }
                Err(e) => {
                    log::warn!("authenticator failed mid-exchange: {e}");
                    if let Some(waiter) = self.reauth_waiter.take() {
                        let _ = waiter.send(Err(ClientError::TryAgain));
                    }
                    self.send_disconnect_now(ReasonCode::UNSPECIFIED_ERROR).await;
                    let generation = self.generation;
                    self.request_reconnect(generation);
                }
            }
        } else {
            // reason code Success: exchange complete
            let result = authenticator
                .auth(AuthStep::ServerFinal, data)
                .await
                .map(|_| ())
                .map_err(|_| ClientError::TryAgain);
            if let Some(waiter) = self.reauth_waiter.take() {
                let _ = waiter.send(result);
            }
        }
        Ok(None)
    }

    // === Commands ===

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                properties,
                resp,
            } => self.cmd_publish(topic, payload, qos, retain, properties, resp),
            Command::Subscribe {
                filters,
                properties,
                resp,
            } => self.cmd_subscribe(filters, properties, resp),
            Command::Unsubscribe {
                topics,
                properties,
                resp,
            } => self.cmd_unsubscribe(topics, properties, resp),
            Command::ReAuthenticate { resp } => self.cmd_reauthenticate(resp).await,
            Command::Disconnect => self.begin_disconnect(),
        }
    }

    fn cmd_publish(
        &mut self,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        properties: PublishProperties,
        resp: oneshot::Sender<Result<ReasonCode>>,
    ) {
        if self.transport.is_none() {
            let _ = resp.send(Err(ClientError::NotConnected));
            return;
        }
        // broker capability checks from CONNACK
        if let Some(max_qos) = self.ca_props.maximum_qos {
            if qos as u8 > max_qos {
                let _ = resp.send(Err(ClientError::QosNotSupported));
                return;
            }
        }
        if retain && self.ca_props.retain_available == Some(false) {
            let _ = resp.send(Err(ClientError::RetainNotAvailable));
            return;
        }
        if let Some(alias) = properties.topic_alias {
            if alias == 0 || alias > self.session.alias_max_out() {
                let _ = resp.send(Err(ClientError::TopicAliasMaximumReached));
                return;
            }
        }

        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => match self.packet_ids.allocate() {
                Some(pid) => Some(pid),
                None => {
                    let _ = resp.send(Err(ClientError::PidOverrun));
                    return;
                }
            },
        };

        // The retained record keeps the full topic so retransmission never
        // depends on alias state.
        let mut record_properties = properties.clone();
        record_properties.topic_alias = None;
        let record = Publish {
            dup: false,
            qos,
            retain,
            topic: topic.clone(),
            packet_id,
            properties: record_properties,
            payload,
        };

        let mut wire = record.clone();
        if properties.topic_alias.is_some() {
            wire.properties.topic_alias = properties.topic_alias;
        } else {
            match self.session.assign_alias(&topic) {
                AliasAssignment::FirstUse(alias) => wire.properties.topic_alias = Some(alias),
                AliasAssignment::Established(alias) => {
                    wire.properties.topic_alias = Some(alias);
                    wire.topic = String::new();
                }
                AliasAssignment::None => {}
            }
        }

        let mut bytes = Vec::new();
        encode_packet(&Packet::Publish(wire), &mut bytes);

        if let Some(max) = self.ca_props.maximum_packet_size {
            if bytes.len() > max as usize {
                if let Some(pid) = packet_id {
                    self.packet_ids.free(pid);
                }
                let _ = resp.send(Err(ClientError::PacketTooLarge {
                    size: bytes.len(),
                    max: max as usize,
                }));
                return;
            }
        }

        let serial = self.queue.next_serial();
        let queued = QueuedPacket {
            serial,
            flags: if packet_id.is_some() {
                send_flags::THROTTLED
            } else {
                send_flags::NONE
            },
            packet_id: packet_id.unwrap_or(0),
            bytes: bytes.into(),
        };
        if let Err(e) = self.queue.push(queued) {
            if let Some(pid) = packet_id {
                self.packet_ids.free(pid);
            }
            let _ = resp.send(Err(e));
            return;
        }

        match packet_id {
            None => {
                let _ = resp.send(Ok(ReasonCode::SUCCESS));
            }
            Some(_) => {
                let phase = if qos == QoS::AtLeastOnce {
                    AckPhase::AwaitingPuback
                } else {
                    AckPhase::AwaitingPubrec
                };
                self.session.push_inflight(InflightPublish {
                    serial,
                    publish: record,
                    phase,
                    sent: false,
                    responder: Some(resp),
                });
            }
        }
    }

    fn cmd_subscribe(
        &mut self,
        filters: Vec<(String, SubscriptionOptions)>,
        properties: SubscribeProperties,
        resp: AckWaiter,
    ) {
        if self.transport.is_none() {
            let _ = resp.send(Err(ClientError::NotConnected));
            return;
        }
        let Some(packet_id) = self.packet_ids.allocate() else {
            let _ = resp.send(Err(ClientError::PidOverrun));
            return;
        };
        let packet = Packet::Subscribe(Subscribe {
            packet_id,
            properties,
            filters,
        });
        if let Err(e) = self.enqueue(&packet, send_flags::NONE) {
            self.packet_ids.free(packet_id);
            let _ = resp.send(Err(e));
            return;
        }
        self.sub_waiters.insert(packet_id, resp);
    }

    fn cmd_unsubscribe(
        &mut self,
        topics: Vec<String>,
        properties: UnsubscribeProperties,
        resp: AckWaiter,
    ) {
        if self.transport.is_none() {
            let _ = resp.send(Err(ClientError::NotConnected));
            return;
        }
        let Some(packet_id) = self.packet_ids.allocate() else {
            let _ = resp.send(Err(ClientError::PidOverrun));
            return;
        };
        let packet = Packet::Unsubscribe(Unsubscribe {
            packet_id,
            properties,
            topics,
        });
        if let Err(e) = self.enqueue(&packet, send_flags::NONE) {
            self.packet_ids.free(packet_id);
            let _ = resp.send(Err(e));
            return;
        }
        self.unsub_waiters.insert(packet_id, resp);
    }

    async fn cmd_reauthenticate(&mut self, resp: oneshot::Sender<Result<()>>) {
        if self.transport.is_none() {
            let _ = resp.send(Err(ClientError::NotConnected));
            return;
        }
        let method = match self.authenticator.as_ref().map(|a| a.method().to_string()) {
            Some(m) if !m.is_empty() => m,
            _ => {
                let _ = resp.send(Err(ClientError::InvalidState(
                    "no authenticator configured".to_string(),
                )));
                return;
            }
        };
        let authenticator = self.authenticator.as_mut().expect("checked above");
        let data = match authenticator.auth(AuthStep::ClientInitial, Bytes::new()).await {
            Ok(data) => data,
            Err(e) => {
                log::warn!("authenticator failed to start re-authentication: {e}");
                let _ = resp.send(Err(ClientError::TryAgain));
                return;
            }
        };
        let packet = Packet::Auth(Auth {
            reason_code: ReasonCode::REAUTHENTICATE,
            properties: AuthProperties {
                authentication_method: Some(method),
                authentication_data: Some(data),
                ..Default::default()
            },
        });
        if let Err(e) = self.enqueue(&packet, send_flags::NONE) {
            let _ = resp.send(Err(e));
            return;
        }
        self.reauth_waiter = Some(resp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqv5_core::packet::Connack;

    fn event_loop() -> (AsyncClient, EventLoop) {
        AsyncClient::new(ClientConfig::new("broker.test:1883"), 4)
    }

    fn connack(session_present: bool, properties: ConnackProperties) -> Connack {
        Connack {
            session_present,
            reason_code: ReasonCode::SUCCESS,
            properties,
        }
    }

    fn pop_all(queue: &mut SendQueue) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Some(queued) = queue.pop(true) {
            let (packet, _) = decode_packet(&queued.bytes[..], 0).unwrap().unwrap();
            packets.push(packet);
        }
        packets
    }

    #[tokio::test]
    async fn puback_completes_pending_publish() {
        let (_client, mut el) = event_loop();
        let pid = el.packet_ids.allocate().unwrap();
        let (tx, mut rx) = oneshot::channel();
        el.session.push_inflight(InflightPublish {
            serial: 1,
            publish: Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: "t".into(),
                packet_id: Some(pid),
                properties: PublishProperties::default(),
                payload: Bytes::from_static(b"x"),
            },
            phase: AckPhase::AwaitingPuback,
            sent: true,
            responder: Some(tx),
        });

        el.handle_packet(Packet::Puback(Ack::new(pid))).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap(), ReasonCode::SUCCESS);
        // identifier is free again
        assert_eq!(el.packet_ids.allocate(), Some(pid));
    }

    #[tokio::test]
    async fn qos2_duplicate_delivered_once_but_always_acknowledged() {
        let (_client, mut el) = event_loop();
        let publish = Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: "t".into(),
            packet_id: Some(9),
            properties: PublishProperties::default(),
            payload: Bytes::from_static(b"x"),
        };

        let first = el
            .handle_packet(Packet::Publish(publish.clone()))
            .await
            .unwrap();
        assert!(matches!(first, Some(Event::Message(_))));

        let mut dup = publish;
        dup.dup = true;
        let second = el.handle_packet(Packet::Publish(dup)).await.unwrap();
        assert!(second.is_none());

        let acks = pop_all(&mut el.queue);
        assert_eq!(acks.len(), 2);
        assert!(acks
            .iter()
            .all(|p| matches!(p, Packet::Pubrec(a) if a.packet_id == 9)));
    }

    #[tokio::test]
    async fn pubrel_releases_and_completes_with_pubcomp() {
        let (_client, mut el) = event_loop();
        assert!(el.session.record_incoming_qos2(5));

        el.handle_packet(Packet::Pubrel(Ack::new(5))).await.unwrap();
        let packets = pop_all(&mut el.queue);
        assert!(
            matches!(&packets[..], [Packet::Pubcomp(a)] if a.packet_id == 5
                && a.reason_code == ReasonCode::SUCCESS)
        );

        // unknown identifier answers with Packet Identifier Not Found
        el.handle_packet(Packet::Pubrel(Ack::new(6))).await.unwrap();
        let packets = pop_all(&mut el.queue);
        assert!(
            matches!(&packets[..], [Packet::Pubcomp(a)] if a.packet_id == 6
                && a.reason_code == ReasonCode::PACKET_ID_NOT_FOUND)
        );
    }

    #[tokio::test]
    async fn replay_sets_dup_and_keeps_packet_id() {
        let (_client, mut el) = event_loop();
        el.session.apply_connack(&connack(false, ConnackProperties::default()));
        el.session.push_inflight(InflightPublish {
            serial: 1,
            publish: Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: "metrics".into(),
                packet_id: Some(42),
                properties: PublishProperties::default(),
                payload: Bytes::from_static(b"v"),
            },
            phase: AckPhase::AwaitingPuback,
            sent: true,
            responder: None,
        });
        el.session.push_inflight(InflightPublish {
            serial: 2,
            publish: Publish {
                dup: false,
                qos: QoS::ExactlyOnce,
                retain: false,
                topic: "metrics".into(),
                packet_id: Some(43),
                properties: PublishProperties::default(),
                payload: Bytes::from_static(b"w"),
            },
            phase: AckPhase::AwaitingPubcomp,
            sent: true,
            responder: None,
        });

        el.session.apply_connack(&connack(true, ConnackProperties::default()));
        el.arm_session_replay();

        let packets = pop_all(&mut el.queue);
        match &packets[..] {
            [Packet::Publish(publish), Packet::Pubrel(pubrel)] => {
                assert!(publish.dup);
                assert_eq!(publish.packet_id, Some(42));
                assert_eq!(pubrel.packet_id, 43);
            }
            other => panic!("unexpected replay {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_disconnect_surfaces_reason() {
        let (_client, mut el) = event_loop();
        let event = el
            .handle_packet(Packet::Disconnect(Disconnect {
                reason_code: ReasonCode::SERVER_SHUTTING_DOWN,
                properties: Default::default(),
            }))
            .await
            .unwrap();
        assert!(matches!(
            event,
            Some(Event::Disconnected {
                reason: Some(rc)
            }) if rc == ReasonCode::SERVER_SHUTTING_DOWN
        ));
    }

    #[tokio::test]
    async fn unexpected_packet_is_protocol_error() {
        let (_client, mut el) = event_loop();
        let result = el.handle_packet(Packet::Pingreq).await;
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }

    #[tokio::test]
    async fn reauth_challenge_round_sends_continue() {
        let (_client, mut el) = event_loop();
        el.set_authenticator(Box::new(crate::auth::testing::EchoAuthenticator {
            steps: Vec::new(),
        }));

        el.handle_packet(Packet::Auth(Auth {
            reason_code: ReasonCode::CONTINUE_AUTHENTICATION,
            properties: AuthProperties {
                authentication_method: Some("ECHO".into()),
                authentication_data: Some(Bytes::from_static(b"challenge")),
                ..Default::default()
            },
        }))
        .await
        .unwrap();

        let packets = pop_all(&mut el.queue);
        match &packets[..] {
            [Packet::Auth(reply)] => {
                assert_eq!(reply.reason_code, ReasonCode::CONTINUE_AUTHENTICATION);
                assert_eq!(
                    reply.properties.authentication_method.as_deref(),
                    Some("ECHO")
                );
                assert_eq!(
                    reply.properties.authentication_data.as_deref(),
                    Some(b"challenge".as_slice())
                );
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn reauth_completes_on_final_auth() {
        let (_client, mut el) = event_loop();
        el.set_authenticator(Box::new(crate::auth::testing::EchoAuthenticator {
            steps: Vec::new(),
        }));
        let (tx, mut rx) = oneshot::channel();
        el.reauth_waiter = Some(tx);

        el.handle_packet(Packet::Auth(Auth {
            reason_code: ReasonCode::SUCCESS,
            properties: AuthProperties {
                authentication_method: Some("ECHO".into()),
                ..Default::default()
            },
        }))
        .await
        .unwrap();

        assert!(rx.try_recv().unwrap().is_ok());
    }
}
