//! Enhanced authentication interface.
//!
//! MQTT 5.0 enhanced authentication is a SASL-style challenge/response
//! exchange carried in CONNECT/AUTH packets. The client core drives an
//! opaque [`Authenticator`]: its `method()` is attached to CONNECT as the
//! Authentication Method property and [`Authenticator::auth`] is invoked for
//! each step until the broker sends CONNACK.

use async_trait::async_trait;
use bytes::Bytes;

/// Position of an [`Authenticator::auth`] call within the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStep {
    /// Produce the initial data sent with CONNECT (or a re-authentication
    /// AUTH packet). Input data is empty.
    ClientInitial,
    /// Answer a broker challenge from an AUTH packet with reason code
    /// Continue Authentication.
    ServerChallenge,
    /// Verify the broker's final data from CONNACK (or AUTH with reason
    /// code Success). The returned bytes are discarded.
    ServerFinal,
}

/// Pluggable multi-step authenticator.
///
/// Errors abort the connection attempt; the supervisor moves on to the next
/// endpoint.
#[async_trait]
pub trait Authenticator: Send {
    /// Authentication method name, e.g. `"SCRAM-SHA-256"`.
    fn method(&self) -> &str;

    /// Perform one step of the exchange.
    async fn auth(
        &mut self,
        step: AuthStep,
        data: Bytes,
    ) -> std::result::Result<Bytes, Box<dyn std::error::Error + Send + Sync>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Authenticator echoing each challenge back, for exercising the
    /// connect state machine.
    pub struct EchoAuthenticator {
        pub steps: Vec<AuthStep>,
    }

    #[async_trait]
    impl Authenticator for EchoAuthenticator {
        fn method(&self) -> &str {
            "ECHO"
        }

        async fn auth(
            &mut self,
            step: AuthStep,
            data: Bytes,
        ) -> std::result::Result<Bytes, Box<dyn std::error::Error + Send + Sync>> {
            self.steps.push(step);
            Ok(data)
        }
    }
}
