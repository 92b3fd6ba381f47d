//! TLS encryptor implementation

use async_trait::async_trait;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::common::{Destination, Result, Stream};
use crate::config::TlsSettings;
use crate::error::Error;

use super::Encryptor;

/// TLS client for encrypting connections toward peers and origins
pub struct TlsEncryptor {
    connector: TlsConnector,
}

impl TlsEncryptor {
    pub fn new(settings: &TlsSettings) -> Result<Self> {
        let connector = Self::build_connector(settings)?;
        Ok(Self { connector })
    }

    fn build_connector(settings: &TlsSettings) -> Result<TlsConnector> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(ca_file) = &settings.ca_file {
            for cert in Self::load_certs(ca_file)? {
                root_store
                    .add(cert)
                    .map_err(|e| Error::Config(format!("Invalid CA certificate in {}: {}", ca_file, e)))?;
            }
        }

        let mut tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if !settings.alpn.is_empty() {
            tls_config.alpn_protocols = settings
                .alpn
                .iter()
                .map(|s| s.as_bytes().to_vec())
                .collect();
        }

        if settings.allow_insecure {
            tls_config
                .dangerous()
                .set_certificate_verifier(Arc::new(InsecureVerifier));
        }

        Ok(TlsConnector::from(Arc::new(tls_config)))
    }

    fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
        let file = File::open(path)
            .map_err(|e| Error::Config(format!("Failed to open CA file {}: {}", path, e)))?;
        let mut reader = BufReader::new(file);
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Config(format!("Failed to parse certificates: {}", e)))?;
        if certs.is_empty() {
            return Err(Error::Config(format!("No certificates found in {}", path)));
        }
        Ok(certs)
    }
}

#[async_trait]
impl Encryptor for TlsEncryptor {
    async fn secure(&self, stream: Stream, destination: &Destination) -> Result<Stream> {
        let server_name = destination.tls_name();
        let domain = ServerName::try_from(server_name.clone())
            .map_err(|_| Error::Tls(format!("Invalid server name: {}", server_name)))?;

        debug!("TLS handshake with {} (sni {})", destination.address, server_name);
        let tls_stream = self
            .connector
            .connect(domain, stream)
            .await
            .map_err(|e| Error::Tls(format!("handshake with {} failed: {}", destination.address, e)))?;
        Ok(Box::new(tls_stream))
    }
}

/// Certificate verifier that accepts anything, for peers with self-signed certs
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;

    #[test]
    fn test_builds_with_defaults() {
        assert!(TlsEncryptor::new(&TlsSettings::default()).is_ok());
    }

    #[test]
    fn test_missing_ca_file_is_config_error() {
        let settings = TlsSettings {
            ca_file: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        assert!(matches!(TlsEncryptor::new(&settings), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_handshake_failure_is_tls_error() {
        let encryptor = TlsEncryptor::new(&TlsSettings::default()).unwrap();
        let (client, server) = tokio::io::duplex(1024);
        // Peer hangs up before answering the ClientHello
        drop(server);

        let dest = Destination::origin(Address::domain("example.com", 443)).with_tls(None);
        let result = encryptor.secure(Box::new(client), &dest).await;
        assert!(matches!(result, Err(Error::Tls(_))));
    }
}
