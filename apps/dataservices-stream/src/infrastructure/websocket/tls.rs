//! TLS Connector Selection
//!
//! Picks the connector handed to `tokio-tungstenite`:
//!
//! - `ws://` endpoints connect in plain text.
//! - `wss://` with verification uses the built-in webpki roots.
//! - `wss://` without verification keeps encryption but accepts any
//!   server certificate.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_tungstenite::Connector;

/// Connector for `url`.
///
/// `None` lets `tokio-tungstenite` build its default verifying client.
///
/// # Errors
///
/// Returns an error if the insecure client configuration cannot be built.
pub fn connector_for(url: &str, verify: bool) -> Result<Option<Connector>, rustls::Error> {
    if url.starts_with("ws://") {
        return Ok(Some(Connector::Plain));
    }
    if verify {
        return Ok(None);
    }
    Ok(Some(Connector::Rustls(Arc::new(insecure_client_config()?))))
}

/// Client configuration that skips certificate verification.
///
/// # Errors
///
/// Returns an error if the provider supports no safe protocol version.
pub fn insecure_client_config() -> Result<ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
        .with_no_client_auth();
    Ok(config)
}

/// Accepts every certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_endpoints_skip_tls() {
        assert!(matches!(
            connector_for("ws://127.0.0.1:9000", true).unwrap(),
            Some(Connector::Plain)
        ));
    }

    #[test]
    fn verified_endpoints_use_default_connector() {
        assert!(connector_for("wss://example.com", true).unwrap().is_none());
    }

    #[test]
    fn unverified_endpoints_keep_tls() {
        assert!(matches!(
            connector_for("wss://example.com", false).unwrap(),
            Some(Connector::Rustls(_))
        ));
    }

    #[test]
    fn insecure_config_accepts_any_certificate() {
        let verifier = AcceptAnyCertificate {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        };
        let name = ServerName::try_from("example.com").unwrap();
        assert!(
            verifier
                .verify_server_cert(
                    &CertificateDer::from(vec![0_u8; 4]),
                    &[],
                    &name,
                    &[],
                    UnixTime::now(),
                )
                .is_ok()
        );
        assert!(!verifier.supported_verify_schemes().is_empty());
    }
}
