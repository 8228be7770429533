//! Client certificate lifecycle.
//!
//! On first start the daemon generates an EC P-384 keypair, builds a CSR and
//! registers as a kubernetes operator; the control plane signs the CSR and
//! returns the client certificate used for mTLS toward the binding ingress.
//! Key, certificate and operator id are persisted so restarts skip
//! registration entirely.

mod provision;

pub use provision::Provisioner;

use ngrokd_api::{Client, CreateOperator, OperatorBindingCreate};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("CSR generation failed: {0}")]
    CsrGeneration(String),

    #[error("registration failed: {0}")]
    Registration(#[from] ngrokd_api::ApiError),

    #[error("no certificate returned in API response")]
    MissingCertificate,

    #[error("failed to parse certificate material: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A usable TLS client identity: certificate chain plus private key.
pub struct Identity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

/// Configuration for certificate provisioning
#[derive(Debug, Clone)]
pub struct Config {
    pub cert_dir: PathBuf,
    pub api_url: String,
    pub api_key: String,
    pub description: String,
    pub metadata: String,
    pub region: String,
}

/// Manages the client credential on disk and the registration that mints it.
pub struct Manager {
    provisioner: Provisioner,
    api: Client,
    operator_id: String,
}

impl Manager {
    pub fn new(config: &Config) -> Self {
        Self {
            provisioner: Provisioner::new(&config.cert_dir),
            api: Client::with_base_url(&config.api_url, &config.api_key),
            operator_id: String::new(),
        }
    }

    /// Returns a TLS identity, loading the persisted one when both files
    /// exist and parse, provisioning a fresh one via the API otherwise.
    pub async fn ensure_certificate(&mut self, config: &Config) -> Result<Identity, CertError> {
        if self.provisioner.certificate_exists() {
            info!(
                key = %self.provisioner.key_path().display(),
                cert = %self.provisioner.cert_path().display(),
                "loading existing certificate"
            );

            match self.provisioner.load_certificate() {
                Ok(identity) => {
                    self.load_operator_id();
                    return Ok(identity);
                }
                Err(e) => {
                    info!(error = %e, "failed to load existing certificate, provisioning a new one");
                }
            }
        }

        info!("provisioning new certificate via ngrok API");
        self.provision(config).await
    }

    async fn provision(&mut self, config: &Config) -> Result<Identity, CertError> {
        info!("generating private key and CSR");
        let (key_pem, csr_pem) = self.provisioner.generate_key_and_csr()?;

        let description = if config.description.is_empty() {
            "ngrok forward proxy agent".to_string()
        } else {
            config.description.clone()
        };
        let metadata = if config.metadata.is_empty() {
            r#"{"type":"forward-proxy"}"#.to_string()
        } else {
            config.metadata.clone()
        };
        let region = if config.region.is_empty() {
            "global".to_string()
        } else {
            config.region.clone()
        };

        info!("registering with ngrok API");
        let operator = self
            .api
            .create_operator(&CreateOperator {
                description,
                metadata,
                enabled_features: vec!["bindings".to_string()],
                region,
                binding: Some(OperatorBindingCreate {
                    endpoint_selectors: vec![],
                    csr: csr_pem.clone(),
                }),
            })
            .await?;

        self.operator_id = operator.id.clone();

        let binding = operator.binding.ok_or(CertError::MissingCertificate)?;
        if binding.cert.cert.is_empty() {
            return Err(CertError::MissingCertificate);
        }

        info!(
            operator_id = %operator.id,
            ingress_endpoint = %binding.ingress_endpoint,
            not_before = %binding.cert.not_before,
            not_after = %binding.cert.not_after,
            "registered with ngrok"
        );

        self.provisioner
            .save_certificate(key_pem.as_bytes(), binding.cert.cert.as_bytes())?;
        info!(
            key = %self.provisioner.key_path().display(),
            cert = %self.provisioner.cert_path().display(),
            "certificate saved"
        );

        if let Err(e) = self.save_operator_id() {
            info!(error = %e, "failed to save operator id");
        }

        Provisioner::parse_identity(binding.cert.cert.as_bytes(), key_pem.as_bytes())
    }

    /// Operator id, empty until registered or loaded.
    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    /// Fetch the ingress endpoint for this operator, falling back to the
    /// well-known default when the API does not report one.
    pub async fn ingress_endpoint(&self) -> Result<String, CertError> {
        if self.operator_id.is_empty() {
            return Err(CertError::Parse("operator not registered".to_string()));
        }

        let operator = self.api.get_operator(&self.operator_id).await?;
        if let Some(binding) = operator.binding {
            if !binding.ingress_endpoint.is_empty() {
                return Ok(binding.ingress_endpoint);
            }
        }
        Ok("kubernetes-binding-ingress.ngrok.io:443".to_string())
    }

    fn operator_id_path(&self) -> PathBuf {
        self.provisioner.cert_dir().join("operator_id")
    }

    fn save_operator_id(&self) -> std::io::Result<()> {
        std::fs::write(self.operator_id_path(), self.operator_id.as_bytes())
    }

    fn load_operator_id(&mut self) {
        if let Ok(data) = std::fs::read_to_string(self.operator_id_path()) {
            self.operator_id = data.trim().to_string();
        }
    }
}

/// Read a persisted operator id, if any.
pub fn load_operator_id(cert_dir: &Path) -> Option<String> {
    let data = std::fs::read_to_string(cert_dir.join("operator_id")).ok()?;
    let id = data.trim().to_string();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}
