//! TLS connector assembly for broker connections.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use tokio_rustls::TlsConnector;

use crate::config::TlsConfig;
use crate::error::{ClientError, Result};

/// Build the connector an endpoint attempt handshakes with.
pub(crate) fn connector(config: &TlsConfig) -> Result<TlsConnector> {
    let tls_config = if config.accept_invalid_certs {
        // testing escape hatch for self-signed brokers
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::AcceptAnyCert))
            .with_no_client_auth()
    } else {
        verified_config(config)?
    };
    Ok(TlsConnector::from(Arc::new(tls_config)))
}

/// Name presented for SNI and certificate verification: the configured
/// override, or the broker host from the endpoint list.
pub(crate) fn server_name(config: &TlsConfig, host: &str) -> Result<ServerName<'static>> {
    let name = config.server_name.as_deref().unwrap_or(host);
    ServerName::try_from(name.to_string())
        .map_err(|_| ClientError::Tls(format!("invalid server name: {name}")))
}

fn verified_config(config: &TlsConfig) -> Result<rustls::ClientConfig> {
    let mut roots = RootCertStore::empty();
    match &config.ca_cert {
        Some(path) => {
            for cert in read_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| tls_error(path, "CA certificate rejected", e))?;
            }
        }
        // no CA override: trust the bundled web roots
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    match (&config.client_cert, &config.client_key) {
        (Some(cert_path), Some(key_path)) => builder
            .with_client_auth_cert(read_certs(cert_path)?, read_key(key_path)?)
            .map_err(|e| tls_error(cert_path, "client certificate rejected", e)),
        // mutual TLS needs both halves; a lone cert or key is ignored
        _ => Ok(builder.with_no_client_auth()),
    }
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut open_pem(path)?)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(path, "unreadable certificate", e))
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open_pem(path)?)
        .map_err(|e| tls_error(path, "unreadable private key", e))?
        .ok_or_else(|| ClientError::Tls(format!("no private key in {}", path.display())))
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| tls_error(path, "cannot open", e))
}

fn tls_error(path: &Path, what: &str, err: impl std::fmt::Display) -> ClientError {
    ClientError::Tls(format!("{what} {}: {err}", path.display()))
}

mod danger {
    //! Certificate verifier that accepts anything. The trait surface is
    //! dictated by rustls; only the scheme list below is ours.

    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub(super) struct AcceptAnyCert;

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn server_name_prefers_configured_override() {
        let config = TlsConfig {
            server_name: Some("edge.example".into()),
            ..Default::default()
        };
        assert!(server_name(&config, "10.0.0.1").is_ok());
        // without an override an IP literal is still a valid server name
        assert!(server_name(&TlsConfig::default(), "10.0.0.1").is_ok());
        assert!(server_name(&TlsConfig::default(), "bad name").is_err());
    }

    #[test]
    fn missing_pem_files_surface_their_path() {
        let config = TlsConfig {
            enabled: true,
            ca_cert: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        match connector(&config) {
            Err(ClientError::Tls(msg)) => assert!(msg.contains("/nonexistent/ca.pem")),
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("expected a TLS error"),
        }
    }

    #[test]
    fn insecure_mode_skips_certificate_loading() {
        let config = TlsConfig {
            enabled: true,
            accept_invalid_certs: true,
            ca_cert: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        assert!(connector(&config).is_ok());
    }
}
