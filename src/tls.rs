//! TLS transport for both sides of the relay
//!
//! Upstream (relay to SUT): rustls client with certificate verification
//! disabled (the SUT runs inside the fuzzing container with a self-signed
//! certificate) and ALPN offering exactly `h2`. A peer that negotiates
//! anything else fails the handshake before any frame is exchanged.
//!
//! Inbound (fuzzer to relay): optional rustls server config loaded from PEM
//! files; when unset the listener stays plaintext, which is what the stock
//! fuzzing harness expects.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{RelayError, Result};

/// The single application protocol the relay negotiates (RFC 9113)
pub const ALPN_H2: &[u8] = b"h2";

/// Accepts any certificate the SUT presents. Verification is meaningless
/// here: the upstream is a fuzz target with a throwaway self-signed cert.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
            SignatureScheme::ED448,
        ]
    }
}

/// Client config for the SUT side: no verification, ALPN `h2` only
pub fn upstream_client_config() -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();

    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    Arc::new(config)
}

/// Establish TCP + TLS to the SUT and require ALPN to select `h2`.
///
/// TCP-level failure (refused, timed out) maps to the distinct
/// `Unreachable` error the supervisor keys its restart policy on.
pub async fn connect_upstream(
    host: &str,
    port: u16,
    dur: Duration,
) -> Result<TlsStream<TcpStream>> {
    let addr = format!("{host}:{port}");

    let unreachable = |source: std::io::Error| RelayError::Unreachable {
        host: host.to_string(),
        port,
        source,
    };

    let tcp = timeout(dur, TcpStream::connect(&addr))
        .await
        .map_err(|_| unreachable(std::io::Error::from(std::io::ErrorKind::TimedOut)))?
        .map_err(unreachable)?;

    let connector = TlsConnector::from(upstream_client_config());
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| RelayError::Handshake(format!("invalid upstream server name: {e}")))?;

    let tls = timeout(dur, connector.connect(server_name, tcp))
        .await
        .map_err(|_| RelayError::Timeout(dur))?
        .map_err(|e| RelayError::Handshake(format!("TLS handshake with {addr} failed: {e}")))?;

    let selected = tls.get_ref().1.alpn_protocol().map(|p| p.to_vec());
    if selected.as_deref() != Some(ALPN_H2) {
        return Err(RelayError::AlpnMismatch {
            selected: selected.map(|p| String::from_utf8_lossy(&p).into_owned()),
        });
    }

    debug!(%addr, "upstream TLS established, ALPN h2");
    Ok(tls)
}

/// Server config for the optional fuzzer-facing TLS listener
pub fn inbound_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
        cert_path,
    )?))
    .collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(RelayError::Handshake(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut std::io::BufReader::new(std::fs::File::open(key_path)?))?
            .ok_or_else(|| {
                RelayError::Handshake(format!("no private key found in {}", key_path.display()))
            })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RelayError::Handshake(format!("inbound TLS config: {e}")))?;

    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    Ok(Arc::new(config))
}
