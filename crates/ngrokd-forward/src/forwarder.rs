//! Per-connection forwarding to the binding ingress.

use crate::binding::upgrade_to_binding_connection;
use crate::http::{raw_proxy, rewrite_http_host};
use crate::ForwardError;
use ngrokd_cert::Identity;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_rustls::TlsConnector;
use tracing::debug;

const DEFAULT_INGRESS: &str = "kubernetes-binding-ingress.ngrok.io:443";
const DEFAULT_CA_DIR: &str = "/etc/ssl/certs/ngrok";
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(180);

/// A bound endpoint as materialised for forwarding.
#[derive(Debug, Clone)]
pub struct BoundEndpoint {
    /// Endpoint id, used as the listener key.
    pub name: String,
    /// Remote endpoint URL (`scheme://host[:port]`).
    pub uri: String,
    /// Remote endpoint port.
    pub port: u16,
    /// Local listen port.
    pub local_port: u16,
    /// Local listen address.
    pub local_address: String,
}

impl BoundEndpoint {
    /// Hostname of the remote endpoint, without port.
    pub fn hostname(&self) -> Result<String, ForwardError> {
        let parsed = url::Url::parse(&self.uri).map_err(|e| ForwardError::BadUri {
            uri: self.uri.clone(),
            reason: e.to_string(),
        })?;
        parsed
            .host_str()
            .map(str::to_string)
            .ok_or_else(|| ForwardError::BadUri {
                uri: self.uri.clone(),
                reason: "no host".to_string(),
            })
    }
}

/// Forwarder configuration
pub struct ForwarderConfig {
    /// Ingress `host:port`; defaults to the well-known binding ingress.
    pub ingress_endpoint: String,
    /// Client credential for mTLS.
    pub identity: Identity,
    /// Directory of additional CA certificates for ingress verification.
    pub ca_dir: PathBuf,
    /// TCP dial timeout.
    pub dial_timeout: Duration,
}

impl ForwarderConfig {
    pub fn new(identity: Identity) -> Self {
        Self {
            ingress_endpoint: DEFAULT_INGRESS.to_string(),
            identity,
            ca_dir: PathBuf::from(DEFAULT_CA_DIR),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// Forwards accepted local connections into binding tunnels.
pub struct Forwarder {
    ingress_endpoint: String,
    connector: TlsConnector,
    server_name: ServerName<'static>,
    dial_timeout: Duration,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Result<Self, ForwardError> {
        ensure_crypto_provider();

        let ingress_endpoint = if config.ingress_endpoint.is_empty() {
            DEFAULT_INGRESS.to_string()
        } else {
            config.ingress_endpoint
        };

        let hostname = ingress_endpoint
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(ingress_endpoint.as_str())
            .to_string();

        let server_name = ServerName::try_from(hostname.clone()).map_err(|_| {
            ForwardError::BadUri {
                uri: ingress_endpoint.clone(),
                reason: "invalid ingress hostname".to_string(),
            }
        })?;

        let custom_cas = load_custom_cas(&config.ca_dir);

        // The ingress chain may be signed by an intermediate absent from the
        // host trust store. With custom CA material present, verify against
        // it; otherwise skip server-identity verification. The client
        // certificate remains the boundary the remote peer enforces.
        let client_config = if let Some(roots) = custom_cas {
            debug!(ca_dir = %config.ca_dir.display(), "using custom CA material for ingress verification");
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_client_auth_cert(config.identity.cert_chain, config.identity.private_key)?
        } else {
            debug!("no custom CA material found, skipping ingress server verification");
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipServerVerification::new())
                .with_client_auth_cert(config.identity.cert_chain, config.identity.private_key)?
        };

        Ok(Self {
            ingress_endpoint,
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name,
            dial_timeout: config.dial_timeout,
        })
    }

    /// Forward one accepted local connection to its bound endpoint.
    ///
    /// Dials the ingress over mTLS, performs the binding upgrade, then
    /// bridges until either side finishes. HTTP(S) endpoints get their
    /// first request's Host header rewritten to the endpoint hostname.
    pub async fn forward_connection<C>(
        &self,
        local_conn: C,
        endpoint: &BoundEndpoint,
    ) -> Result<(), ForwardError>
    where
        C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        debug!(
            endpoint = %endpoint.name,
            uri = %endpoint.uri,
            port = endpoint.port,
            "forwarding connection"
        );

        let mut ingress_conn = self.dial_ingress(&self.ingress_endpoint).await?;
        debug!(address = %self.ingress_endpoint, "mTLS connection established");

        let host = endpoint.hostname()?;
        let response =
            upgrade_to_binding_connection(&mut ingress_conn, &host, endpoint.port).await?;

        debug!(
            endpoint_id = %response.endpoint_id,
            proto = %response.proto,
            "connection upgraded"
        );

        let result = match response.proto.as_str() {
            "http" | "https" => rewrite_http_host(local_conn, ingress_conn, &host).await,
            _ => raw_proxy(local_conn, ingress_conn).await,
        };

        match result {
            Ok(()) => {
                debug!(endpoint = %endpoint.name, "connection closed");
                Ok(())
            }
            Err(e) => {
                debug!(endpoint = %endpoint.name, error = %e, "connection closed with error");
                Err(e.into())
            }
        }
    }

    async fn dial_ingress<A: ToSocketAddrs>(
        &self,
        address: A,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ForwardError> {
        let tcp = tokio::time::timeout(self.dial_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ForwardError::Dial {
                address: self.ingress_endpoint.clone(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timeout"),
            })?
            .map_err(|e| ForwardError::Dial {
                address: self.ingress_endpoint.clone(),
                source: e,
            })?;

        let tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| ForwardError::Dial {
                address: self.ingress_endpoint.clone(),
                source: e,
            })?;

        Ok(tls)
    }
}

/// Load every PEM certificate under `ca_dir` into a root store.
/// Returns `None` when the directory is absent or contains no usable certs.
fn load_custom_cas(ca_dir: &Path) -> Option<RootCertStore> {
    let entries = std::fs::read_dir(ca_dir).ok()?;

    let mut roots = RootCertStore::empty();
    let mut loaded = 0usize;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(pem) = std::fs::read(&path) else {
            continue;
        };
        let mut reader = std::io::BufReader::new(pem.as_slice());
        for cert in rustls_pemfile::certs(&mut reader).flatten() {
            if roots.add(cert).is_ok() {
                loaded += 1;
            }
        }
    }

    if loaded == 0 {
        None
    } else {
        // System anchors still apply alongside the custom material.
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Some(roots)
    }
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("rustls crypto provider already installed");
        }
    });
}

// Server-identity verification disabled; client-cert auth is the boundary.
#[derive(Debug)]
struct SkipServerVerification;

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    fn throwaway_identity() -> Identity {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).unwrap();
        let cert = CertificateParams::default().self_signed(&key_pair).unwrap();
        ngrokd_cert::Provisioner::parse_identity(
            cert.pem().as_bytes(),
            key_pair.serialize_pem().as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn hostname_extraction() {
        let ep = BoundEndpoint {
            name: "ep_1".to_string(),
            uri: "https://my-app.ngrok.app:81".to_string(),
            port: 81,
            local_port: 9080,
            local_address: "127.0.0.1".to_string(),
        };
        assert_eq!(ep.hostname().unwrap(), "my-app.ngrok.app");

        let ep = BoundEndpoint {
            name: "ep_2".to_string(),
            uri: "tcp://db.internal:5432".to_string(),
            port: 5432,
            local_port: 9081,
            local_address: "127.0.0.1".to_string(),
        };
        assert_eq!(ep.hostname().unwrap(), "db.internal");
    }

    #[test]
    fn forwarder_builds_with_defaults() {
        let fwd = Forwarder::new(ForwarderConfig::new(throwaway_identity())).unwrap();
        assert_eq!(fwd.ingress_endpoint, DEFAULT_INGRESS);
    }

    #[test]
    fn empty_ingress_falls_back_to_default() {
        let mut config = ForwarderConfig::new(throwaway_identity());
        config.ingress_endpoint = String::new();
        let fwd = Forwarder::new(config).unwrap();
        assert_eq!(fwd.ingress_endpoint, DEFAULT_INGRESS);
    }

    #[test]
    fn missing_ca_dir_yields_no_custom_roots() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(load_custom_cas(&missing).is_none());
        // An empty directory likewise.
        assert!(load_custom_cas(dir.path()).is_none());
    }

    #[test]
    fn ca_dir_with_cert_yields_roots() {
        let dir = tempfile::TempDir::new().unwrap();
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).unwrap();
        let cert = CertificateParams::default().self_signed(&key_pair).unwrap();
        std::fs::write(dir.path().join("ingress-ca.pem"), cert.pem()).unwrap();

        let roots = load_custom_cas(dir.path()).unwrap();
        assert!(!roots.is_empty());
    }
}
