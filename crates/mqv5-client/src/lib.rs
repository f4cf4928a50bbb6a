//! mqv5-client - Asynchronous MQTT 5.0 client.
//!
//! A tokio-based client core: connection state machine with broker failover,
//! QoS 1/2 session replay across reconnects, flow control and topic
//! aliasing, TLS and WebSocket transports, and pluggable enhanced
//! authentication.

mod auth;
mod client;
mod config;
mod connect;
mod error;
mod hosts;
mod packet_id;
mod send_queue;
mod session;
mod tls;
mod transport;
mod will;

pub use auth::{AuthStep, Authenticator};
pub use client::{AsyncClient, Event, EventLoop};
pub use config::{ClientConfig, TlsConfig};
pub use error::{ClientError, Result};
pub use hosts::{parse_brokers, Broker};
pub use packet_id::PacketIdAllocator;
pub use will::Will;

// Re-export wire-level types the public API speaks in.
pub use mqv5_core::packet::{Publish, QoS, SubscriptionOptions};
pub use mqv5_core::properties::{
    ConnectProperties, PublishProperties, SubscribeProperties,
};
pub use mqv5_core::reason::{ReasonCategory, ReasonCode};
