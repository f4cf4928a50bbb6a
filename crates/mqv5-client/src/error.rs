//! Client error types.
//!
//! Errors are grouped by recovery policy: transient transport errors trigger
//! a reconnect and surface [`ClientError::TryAgain`] to the operation that
//! observed them; fatal errors ([`ClientError::NoRecovery`] and friends) stop
//! the connection loop; per-operation errors complete a single user operation
//! and leave the connection up.

use std::io;

use thiserror::Error;

use mqv5_core::error::ProtocolError;
use mqv5_core::reason::ReasonCode;

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The broker refused the connection with a retriable reason code.
    #[error("Connection refused: {0}")]
    ConnectionRefused(ReasonCode),

    /// The broker refused the connection with a non-retriable reason code.
    #[error("Access denied: {0}")]
    AccessDenied(ReasonCode),

    /// The broker closed the session with a DISCONNECT packet.
    #[error("Disconnected by broker: {0}")]
    DisconnectedByServer(ReasonCode),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Not connected")]
    NotConnected,

    /// The operation should be retried; another reconnect already replaced
    /// the stream or a full pass over the broker list completed.
    #[error("Try again")]
    TryAgain,

    /// The connection cannot be recovered; the client loop has stopped.
    #[error("No recovery possible")]
    NoRecovery,

    /// The configured broker list is empty or nothing resolved.
    #[error("Host not found")]
    HostNotFound,

    /// The operation was cancelled before its acknowledgement arrived.
    #[error("Operation cancelled")]
    Cancelled,

    /// All 65535 packet identifiers are in flight.
    #[error("No packet identifiers available")]
    PidOverrun,

    /// The session no longer exists on the broker.
    #[error("Session expired")]
    SessionExpired,

    #[error("The broker does not support the requested QoS")]
    QosNotSupported,

    #[error("The broker does not support retained messages")]
    RetainNotAvailable,

    #[error("Topic alias exceeds the negotiated maximum")]
    TopicAliasMaximumReached,

    #[error("Packet of {size} bytes exceeds the broker maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("WebSocket error: {0}")]
    Websocket(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl ClientError {
    /// Transient transport errors that warrant replacing the stream and
    /// retrying the operation.
    pub fn should_reconnect(&self) -> bool {
        match self {
            ClientError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            ClientError::ConnectionClosed
            | ClientError::ConnectionTimeout
            | ClientError::NotConnected => true,
            _ => false,
        }
    }

    /// Errors that end the connection loop instead of moving to the next
    /// endpoint.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::AccessDenied(_) | ClientError::HostNotFound | ClientError::NoRecovery
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_reconnect() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::NotConnected,
            io::ErrorKind::TimedOut,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
        ] {
            assert!(ClientError::Io(io::Error::new(kind, "boom")).should_reconnect());
        }
        assert!(ClientError::ConnectionClosed.should_reconnect());
        assert!(!ClientError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "no"))
            .should_reconnect());
    }

    #[test]
    fn fatal_errors_stop_the_loop() {
        assert!(ClientError::AccessDenied(ReasonCode::NOT_AUTHORIZED).is_fatal());
        assert!(ClientError::HostNotFound.is_fatal());
        assert!(!ClientError::ConnectionRefused(ReasonCode::SERVER_BUSY).is_fatal());
        assert!(!ClientError::TryAgain.is_fatal());
    }
}
