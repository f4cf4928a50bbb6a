//! One connection attempt to a single endpoint.
//!
//! The attempt is a linear sequence: TCP connect, then the handshake phases
//! the endpoint calls for (TLS when configured, WebSocket when the broker
//! entry carries a path), then the MQTT exchange: CONNECT out, AUTH
//! challenge rounds while the broker demands them, CONNACK in. The caller
//! owns the attempt deadline.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use mqv5_core::packet::{encode_packet, decode_packet, Auth, Connack, Connect, Packet};
use mqv5_core::properties::AuthProperties;
use mqv5_core::reason::ReasonCode;

use crate::auth::{AuthStep, Authenticator};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::hosts::Broker;
use crate::tls;
use crate::transport::{Transport, WsByteStream};

/// A successfully established connection.
pub(crate) struct ConnectOutcome {
    pub transport: Transport,
    pub connack: Connack,
}

/// Map a failing CONNACK reason code onto the retry policy: a busy or
/// unavailable broker is worth another attempt elsewhere, everything else
/// is a credential/configuration problem.
fn connack_error(rc: ReasonCode) -> ClientError {
    if rc == ReasonCode::UNSPECIFIED_ERROR
        || rc == ReasonCode::SERVER_UNAVAILABLE
        || rc == ReasonCode::SERVER_BUSY
        || rc == ReasonCode::CONNECTION_RATE_EXCEEDED
    {
        ClientError::ConnectionRefused(rc)
    } else {
        ClientError::AccessDenied(rc)
    }
}

pub(crate) async fn connect_endpoint(
    config: &ClientConfig,
    broker: &Broker,
    addrs: &[SocketAddr],
    authenticator: &mut Option<Box<dyn Authenticator>>,
    clean_start: bool,
) -> Result<ConnectOutcome> {
    let addr = addrs.first().ok_or(ClientError::HostNotFound)?;
    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true)?;

    let websocket = !broker.path.is_empty();
    let mut transport = match (config.tls.enabled, websocket) {
        (false, false) => Transport::Plain(tcp),
        (true, false) => Transport::Tls(tls_handshake(tcp, config, broker).await?),
        (false, true) => Transport::Ws(ws_handshake(tcp, broker, "ws").await?),
        (true, true) => {
            let tls = tls_handshake(tcp, config, broker).await?;
            Transport::Wss(ws_handshake(tls, broker, "wss").await?)
        }
    };

    let connack = mqtt_handshake(&mut transport, config, authenticator, clean_start).await?;
    Ok(ConnectOutcome { transport, connack })
}

async fn tls_handshake(
    tcp: TcpStream,
    config: &ClientConfig,
    broker: &Broker,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let connector = tls::connector(&config.tls)?;
    let server_name = tls::server_name(&config.tls, &broker.host)?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ClientError::Tls(e.to_string()))
}

async fn ws_handshake<S>(stream: S, broker: &Broker, scheme: &str) -> Result<WsByteStream<S>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let url = format!("{scheme}://{}:{}{}", broker.host, broker.port, broker.path);
    let mut request = url
        .into_client_request()
        .map_err(|e| ClientError::Websocket(e.to_string()))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));

    let (ws, _response) = tokio_tungstenite::client_async(request, stream)
        .await
        .map_err(|e| ClientError::Websocket(e.to_string()))?;
    Ok(WsByteStream::new(ws))
}

fn auth_method(authenticator: &Option<Box<dyn Authenticator>>) -> Option<String> {
    authenticator
        .as_ref()
        .map(|a| a.method())
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

async fn mqtt_handshake(
    transport: &mut Transport,
    config: &ClientConfig,
    authenticator: &mut Option<Box<dyn Authenticator>>,
    clean_start: bool,
) -> Result<Connack> {
    let mut co_props = config.connect_properties.clone();

    let method = auth_method(authenticator);
    if let Some(ref method) = method {
        let auth = authenticator.as_mut().expect("method implies authenticator");
        co_props.authentication_method = Some(method.clone());
        let data = auth
            .auth(AuthStep::ClientInitial, Bytes::new())
            .await
            .map_err(|_| ClientError::TryAgain)?;
        co_props.authentication_data = Some(data);
    }

    let connect = Packet::Connect(Connect {
        client_id: config.client_id.clone(),
        username: config.username.clone(),
        password: config.password.clone(),
        keep_alive: config.keep_alive,
        clean_start,
        properties: co_props,
        will: config.will.as_ref().map(|w| w.to_packet()),
    });

    let mut wire = Vec::new();
    encode_packet(&connect, &mut wire);
    transport.write_all(&wire).await?;
    transport.flush().await?;

    let mut read_buf = BytesMut::with_capacity(4096);
    loop {
        let packet = read_packet(transport, &mut read_buf, config.max_packet_size).await?;
        match packet {
            Packet::Connack(connack) => {
                if connack.reason_code.is_error() {
                    return Err(connack_error(connack.reason_code));
                }
                if let Some(ref method) = method {
                    verify_method(connack.properties.authentication_method.as_deref(), method)?;
                    let auth = authenticator.as_mut().expect("method implies authenticator");
                    let data = connack
                        .properties
                        .authentication_data
                        .clone()
                        .unwrap_or_default();
                    auth.auth(AuthStep::ServerFinal, data)
                        .await
                        .map_err(|_| ClientError::TryAgain)?;
                }
                return Ok(connack);
            }
            Packet::Auth(server_auth) => {
                let Some(ref method) = method else {
                    return Err(ClientError::Protocol(
                        mqv5_core::error::ProtocolError::MalformedPacket(
                            "AUTH without configured authentication method".into(),
                        ),
                    ));
                };
                verify_method(
                    server_auth.properties.authentication_method.as_deref(),
                    method,
                )?;

                let auth = authenticator.as_mut().expect("method implies authenticator");
                let challenge = server_auth
                    .properties
                    .authentication_data
                    .clone()
                    .unwrap_or_default();
                let data = auth
                    .auth(AuthStep::ServerChallenge, challenge)
                    .await
                    .map_err(|_| ClientError::TryAgain)?;

                let reply = Packet::Auth(Auth {
                    reason_code: ReasonCode::CONTINUE_AUTHENTICATION,
                    properties: AuthProperties {
                        authentication_method: Some(method.clone()),
                        authentication_data: Some(data),
                        ..Default::default()
                    },
                });
                let mut wire = Vec::new();
                encode_packet(&reply, &mut wire);
                transport.write_all(&wire).await?;
                transport.flush().await?;
            }
            // nothing else is legal before CONNACK; try the next endpoint
            _ => return Err(ClientError::TryAgain),
        }
    }
}

fn verify_method(server: Option<&str>, ours: &str) -> Result<()> {
    match server {
        None => Ok(()),
        Some(m) if m == ours => Ok(()),
        Some(_) => Err(ClientError::Protocol(
            mqv5_core::error::ProtocolError::MalformedPacket(
                "authentication method mismatch".into(),
            ),
        )),
    }
}

async fn read_packet(
    transport: &mut Transport,
    read_buf: &mut BytesMut,
    max_packet_size: u32,
) -> Result<Packet> {
    loop {
        if let Some((packet, consumed)) = decode_packet(&read_buf[..], max_packet_size)? {
            let _ = read_buf.split_to(consumed);
            return Ok(packet);
        }
        let n = transport.read_buf(read_buf).await?;
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_codes_are_retriable() {
        for rc in [
            ReasonCode::UNSPECIFIED_ERROR,
            ReasonCode::SERVER_UNAVAILABLE,
            ReasonCode::SERVER_BUSY,
            ReasonCode::CONNECTION_RATE_EXCEEDED,
        ] {
            assert!(matches!(
                connack_error(rc),
                ClientError::ConnectionRefused(code) if code == rc
            ));
        }
    }

    #[test]
    fn other_failures_deny_access() {
        for rc in [
            ReasonCode::BAD_USERNAME_OR_PASSWORD,
            ReasonCode::NOT_AUTHORIZED,
            ReasonCode::BANNED,
            ReasonCode::CLIENT_ID_NOT_VALID,
        ] {
            assert!(matches!(
                connack_error(rc),
                ClientError::AccessDenied(code) if code == rc
            ));
        }
    }

    #[test]
    fn method_mismatch_is_malformed() {
        assert!(verify_method(None, "SCRAM-SHA-256").is_ok());
        assert!(verify_method(Some("SCRAM-SHA-256"), "SCRAM-SHA-256").is_ok());
        assert!(verify_method(Some("PLAIN"), "SCRAM-SHA-256").is_err());
    }
}
