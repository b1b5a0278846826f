//! Connections to the local target

use crate::common::error::{Result, TunnelError};
use crate::config::TunnelConfig;
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Bidirectional byte stream to the local target
pub trait LocalIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> LocalIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed local stream, plain or TLS
pub type LocalStream = Box<dyn LocalIo>;

/// Opens a fresh connection to the local target per inbound request
#[derive(Clone)]
pub struct LocalConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl std::fmt::Debug for LocalConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl LocalConnector {
    /// Create a connector, building the TLS client configuration once
    pub fn new(config: &TunnelConfig) -> Result<Self> {
        let (host, port) = config.local_target();

        let tls = if config.local_https {
            let client_config = build_tls_config(config)?;
            let server_name = resolve_server_name(host)?;
            Some((TlsConnector::from(client_config), server_name))
        } else {
            None
        };

        Ok(Self {
            host: host.to_string(),
            port,
            connect_timeout: config.timeouts.connect,
            tls,
        })
    }

    /// `host:port` of the local target
    pub fn target(&self) -> String {
        format_authority(&self.host, self.port)
    }

    /// Connect to the local target
    pub async fn connect(&self) -> Result<LocalStream> {
        let target = self.target();

        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| TunnelError::LocalConnect {
            target: target.clone(),
            reason: format!("connect timed out after {:?}", self.connect_timeout),
        })?
        .map_err(|e| TunnelError::LocalConnect {
            target: target.clone(),
            reason: e.to_string(),
        })?;
        stream.set_nodelay(true).ok();

        let Some((connector, server_name)) = &self.tls else {
            debug!("Connected to local target {}", target);
            return Ok(Box::new(stream));
        };

        let tls_stream = timeout(
            self.connect_timeout,
            connector.connect(server_name.clone(), stream),
        )
        .await
        .map_err(|_| TunnelError::Tls(format!("TLS handshake with {target} timed out")))?
        .map_err(|e| TunnelError::Tls(format!("TLS handshake with {target} failed: {e}")))?;

        debug!("TLS connection to local target {} established", target);
        Ok(Box::new(tls_stream))
    }
}

fn build_tls_config(config: &TunnelConfig) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut root_store = RootCertStore::empty();
    if let Some(ca_pem) = &config.local_ca {
        for cert in CertificateDer::pem_slice_iter(ca_pem) {
            let cert = cert.map_err(|e| TunnelError::Tls(format!("parse CA certificate: {e}")))?;
            root_store
                .add(cert)
                .map_err(|e| TunnelError::Tls(format!("add CA certificate: {e}")))?;
        }
        if root_store.is_empty() {
            return Err(TunnelError::Tls(
                "CA bundle contains no certificates".to_string(),
            ));
        }
    } else {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TunnelError::Tls(e.to_string()))?
        .with_root_certificates(root_store);

    let mut client_config = match (&config.local_cert, &config.local_key) {
        (Some(cert_pem), Some(key_pem)) => {
            let certs = CertificateDer::pem_slice_iter(cert_pem)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| TunnelError::Tls(format!("parse client certificate: {e}")))?;
            let key = PrivateKeyDer::from_pem_slice(key_pem)
                .map_err(|e| TunnelError::Tls(format!("parse client key: {e}")))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TunnelError::Tls(format!("client certificate rejected: {e}")))?
        }
        _ => builder.with_no_client_auth(),
    };

    if config.allow_invalid_cert {
        warn!("Certificate validation for the local target is disabled; connections are insecure");
        client_config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification(provider)));
    }

    Ok(Arc::new(client_config))
}

fn resolve_server_name(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }

    ServerName::try_from(host.to_owned())
        .map_err(|e| TunnelError::Config(format!("invalid local host {host}: {e}")))
}

fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Accepts any certificate; signatures are still checked against the provider
#[derive(Debug)]
struct NoCertificateVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoCertificateVerification {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_format_authority() {
        assert_eq!(format_authority("localhost", 80), "localhost:80");
        assert_eq!(format_authority("::1", 80), "[::1]:80");
        assert_eq!(format_authority("[::1]", 80), "[::1]:80");
    }

    #[test]
    fn test_server_names() {
        assert!(matches!(
            resolve_server_name("127.0.0.1").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            resolve_server_name("[::1]").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            resolve_server_name("localhost").unwrap(),
            ServerName::DnsName(_)
        ));
    }

    #[test]
    fn test_tls_connector_builds() {
        let config = TunnelConfig::new(8443).with_local_https(true);
        assert!(LocalConnector::new(&config).unwrap().tls.is_some());

        let config = TunnelConfig::new(8443)
            .with_local_https(true)
            .with_allow_invalid_cert(true);
        assert!(LocalConnector::new(&config).is_ok());
    }

    #[test]
    fn test_bad_pem_material() {
        let config = TunnelConfig::new(8443)
            .with_local_https(true)
            .with_local_ca(b"not a certificate".to_vec());
        let err = LocalConnector::new(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TlsHandshakeFailure);
    }

    #[tokio::test]
    async fn test_plain_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello").await.unwrap();
        });

        let connector =
            LocalConnector::new(&TunnelConfig::new(port).with_local_host("127.0.0.1")).unwrap();
        assert_eq!(connector.target(), format!("127.0.0.1:{port}"));

        let mut stream = connector.connect().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let connector =
            LocalConnector::new(&TunnelConfig::new(port).with_local_host("127.0.0.1")).unwrap();
        let err = connector.connect().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::LocalConnectFailure);
    }
}
