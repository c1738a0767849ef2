//! TLS client layering over the connection façade.
//!
//! Certificate verification is disabled on purpose: the scanner's job is
//! reaching the HTTP layer behind the handshake, not authenticating the
//! peer. SNI carries the hostname being probed.

use std::io;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Verifier that accepts any certificate chain and signature.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Connector with verification disabled and no client certificate.
pub fn connector() -> TlsConnector {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Run the client handshake over `stream` with `host` as SNI.
pub async fn wrap<S>(stream: S, host: &str) -> io::Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = ServerName::try_from(host.to_string()).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid SNI host '{host}': {e}"),
        )
    })?;
    connector().connect(name, stream).await
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_builds() {
        // Constructing the config exercises the verifier wiring.
        let _ = connector();
    }

    #[test]
    fn test_verifier_accepts_arbitrary_certificate() {
        let verifier = AcceptAnyCert;
        let cert = CertificateDer::from(vec![0u8; 16]);
        let name = ServerName::try_from("example.com").unwrap();
        let verdict =
            verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::since_unix_epoch(std::time::Duration::from_secs(0)));
        assert!(verdict.is_ok(), "any certificate must pass");
    }

    #[test]
    fn test_verifier_advertises_schemes() {
        assert!(!AcceptAnyCert.supported_verify_schemes().is_empty());
    }

    #[tokio::test]
    async fn test_wrap_rejects_invalid_sni() {
        let (client, _server) = tokio::io::duplex(64);
        let err = wrap(client, "not a hostname").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
