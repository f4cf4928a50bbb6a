//! Client configuration types.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;

use mqv5_core::properties::ConnectProperties;

use crate::will::Will;

/// TLS configuration for broker connections.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Enable TLS.
    pub enabled: bool,
    /// Path to a PEM file with the CA certificate(s) to trust instead of the
    /// system roots.
    pub ca_cert: Option<PathBuf>,
    /// Client certificate for mutual TLS.
    pub client_cert: Option<PathBuf>,
    /// Client private key for mutual TLS.
    pub client_key: Option<PathBuf>,
    /// Override the server name used for SNI and certificate verification.
    pub server_name: Option<String>,
    /// Accept any server certificate. Testing only.
    pub accept_invalid_certs: bool,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Comma-separated broker list: `host[:port][/path]`, where a path
    /// selects the WebSocket transport.
    pub brokers: String,
    /// Port used when a broker entry omits one.
    pub default_port: u16,
    /// Client identifier. Empty means the broker assigns one.
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Bytes>,
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,
    /// Request a fresh session on the first connect.
    pub clean_start: bool,
    /// Deadline for one connect attempt, handshakes and CONNACK included.
    pub connect_timeout: Duration,
    /// CONNECT properties sent to the broker.
    pub connect_properties: ConnectProperties,
    /// Last Will and Testament message.
    pub will: Option<Will>,
    /// Largest inbound packet accepted, in bytes (0 = unlimited).
    pub max_packet_size: u32,
    /// TLS settings.
    pub tls: TlsConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost".to_string(),
            default_port: 1883,
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: 10,
            clean_start: true,
            connect_timeout: Duration::from_secs(5),
            connect_properties: ConnectProperties::default(),
            will: None,
            max_packet_size: 0,
            tls: TlsConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a new config with the given broker list.
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            ..Default::default()
        }
    }

    /// Set the port used when a broker entry omits one.
    pub fn default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    /// Set the client ID.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Set username and password.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<Bytes>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep-alive interval in seconds.
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set the clean start flag for the first connect.
    pub fn clean_start(mut self, clean: bool) -> Self {
        self.clean_start = clean;
        self
    }

    /// Set the per-attempt connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the CONNECT properties.
    pub fn connect_properties(mut self, properties: ConnectProperties) -> Self {
        self.connect_properties = properties;
        self
    }

    /// Set the session expiry interval CONNECT property, in seconds.
    pub fn session_expiry_interval(mut self, seconds: u32) -> Self {
        self.connect_properties.session_expiry_interval = Some(seconds);
        self
    }

    /// Set the receive maximum CONNECT property (inbound QoS 1/2 window).
    pub fn receive_maximum(mut self, maximum: u16) -> Self {
        self.connect_properties.receive_maximum = Some(maximum);
        self
    }

    /// Set the topic alias maximum CONNECT property (inbound aliases).
    pub fn topic_alias_maximum(mut self, maximum: u16) -> Self {
        self.connect_properties.topic_alias_maximum = Some(maximum);
        self
    }

    /// Set the Last Will and Testament message.
    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// Limit the size of inbound packets.
    pub fn max_packet_size(mut self, bytes: u32) -> Self {
        self.max_packet_size = bytes;
        self
    }

    /// Set the TLS configuration.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }
}
