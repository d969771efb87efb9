/// TLS identity and QUIC crypto configuration
///
/// The identity is created once per process and shared read-only by every
/// QUIC listener and dialer.

use quinn::{ClientConfig, ServerConfig};
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{self, CryptoProvider},
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    DigitallySignedStruct, SignatureScheme,
};
use std::{path::Path, sync::Arc, time::Duration};

use crate::{config::QuicOptions, error::TransportError};

/// Certificate chain and private key presented by the QUIC listener
#[derive(Debug)]
pub struct TlsIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Generate a self-signed certificate for `localhost`
    pub fn self_signed() -> Result<Self, TransportError> {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| TransportError::config_error("tls", format!("certificate generation failed: {}", e)))?;

        tracing::debug!("[SECURITY] Generated self-signed QUIC certificate");
        Ok(Self {
            certs: vec![certified.cert.der().clone()],
            key: PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()).into(),
        })
    }

    /// Load a certificate chain and private key from PEM files
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, TransportError> {
        let cert_pem = std::fs::read(cert_path)
            .map_err(|e| TransportError::config_error("quic.cert_pem_path", format!("{}: {}", cert_path.display(), e)))?;
        let key_pem = std::fs::read(key_path)
            .map_err(|e| TransportError::config_error("quic.key_pem_path", format!("{}: {}", key_path.display(), e)))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Parse a certificate chain and private key from PEM data
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TransportError> {
        let certs = rustls_pemfile::certs(&mut std::io::Cursor::new(cert_pem))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TransportError::config_error("quic.cert_pem_path", format!("failed to parse certificates: {}", e)))?;
        if certs.is_empty() {
            return Err(TransportError::config_error("quic.cert_pem_path", "no certificates found in PEM data"));
        }

        let key = rustls_pemfile::private_key(&mut std::io::Cursor::new(key_pem))
            .map_err(|e| TransportError::config_error("quic.key_pem_path", format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| TransportError::config_error("quic.key_pem_path", "no private key found in PEM data"))?;

        tracing::debug!("[SECURITY] Loaded QUIC certificate chain ({} certs)", certs.len());
        Ok(Self { certs, key })
    }

    /// Build the identity described by the options
    pub fn from_options(options: &QuicOptions) -> Result<Self, TransportError> {
        match (&options.cert_pem_path, &options.key_pem_path) {
            (Some(cert), Some(key)) => Self::from_pem_files(cert, key),
            _ => Self::self_signed(),
        }
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certs[0]
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(crypto::ring::default_provider())
}

fn transport_config(options: &QuicOptions) -> Result<quinn::TransportConfig, TransportError> {
    let mut transport = quinn::TransportConfig::default();
    let idle: quinn::IdleTimeout = options
        .max_idle_timeout
        .try_into()
        .map_err(|e| TransportError::config_error("quic.max_idle_timeout", format!("{}", e)))?;
    transport.max_idle_timeout(Some(idle));
    if options.keep_alive_interval > Duration::ZERO {
        transport.keep_alive_interval(Some(options.keep_alive_interval));
    }
    Ok(transport)
}

/// QUIC server configuration presenting `identity`
pub fn server_config(identity: &TlsIdentity, options: &QuicOptions) -> Result<ServerConfig, TransportError> {
    let mut crypto = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::config_error("tls", e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(identity.certs.clone(), identity.key.clone_key())
        .map_err(|e| TransportError::config_error("tls", format!("TLS configuration error: {}", e)))?;
    crypto.alpn_protocols = vec![options.alpn.as_bytes().to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
        .map_err(|e| TransportError::config_error("tls", format!("QUIC configuration error: {}", e)))?;

    let mut server = ServerConfig::with_crypto(Arc::new(crypto));
    server.transport_config(Arc::new(transport_config(options)?));
    Ok(server)
}

/// QUIC client configuration
///
/// Unless `verify_certificate` is set the peer certificate is accepted without
/// validation; only the handshake signature is checked.
pub fn client_config(options: &QuicOptions) -> Result<ClientConfig, TransportError> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::config_error("tls", e.to_string()))?;

    let mut crypto = if options.verify_certificate {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        tracing::debug!("[SECURITY] QUIC client verifies peers against WebPKI roots");
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        tracing::warn!("[SECURITY] QUIC client skips peer certificate verification");
        builder
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth()
    };
    crypto.alpn_protocols = vec![options.alpn.as_bytes().to_vec()];

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| TransportError::config_error("tls", format!("QUIC client config error: {}", e)))?;

    let mut client = ClientConfig::new(Arc::new(crypto));
    client.transport_config(Arc::new(transport_config(options)?));
    Ok(client)
}

// Accepts any server certificate but still checks handshake signatures
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
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
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_identity_builds_configs() {
        let identity = TlsIdentity::self_signed().unwrap();
        assert!(!identity.certificate().is_empty());

        let options = QuicOptions::default();
        assert!(server_config(&identity, &options).is_ok());
        assert!(client_config(&options).is_ok());
    }

    #[test]
    fn test_pem_round_trip() {
        let certified = rcgen::generate_simple_self_signed(vec!["relay.test".to_string()]).unwrap();
        let cert_pem = certified.cert.pem();
        let key_pem = certified.key_pair.serialize_pem();

        let identity = TlsIdentity::from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
        assert_eq!(identity.certificate(), certified.cert.der());
    }

    #[test]
    fn test_pem_without_key_is_config_error() {
        let certified = rcgen::generate_simple_self_signed(vec!["relay.test".to_string()]).unwrap();
        let err = TlsIdentity::from_pem(certified.cert.pem().as_bytes(), b"").unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }
}
