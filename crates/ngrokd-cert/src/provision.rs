//! Key and CSR generation, certificate persistence.

use crate::{CertError, Identity};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::PrivateKeyDer;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Generates keys/CSRs and owns the on-disk layout of the cert directory.
pub struct Provisioner {
    cert_dir: PathBuf,
}

impl Provisioner {
    pub fn new(cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            cert_dir: cert_dir.into(),
        }
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join("tls.key")
    }

    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join("tls.crt")
    }

    /// Generate an EC P-384 keypair and a CSR for it, both PEM-encoded.
    ///
    /// The CSR carries only an Organization; the control plane rejects CSRs
    /// with a CommonName set.
    pub fn generate_key_and_csr(&self) -> Result<(String, String), CertError> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| CertError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "ngrok-forward-proxy");
        params.distinguished_name = dn;

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| CertError::CsrGeneration(e.to_string()))?;
        let csr_pem = csr
            .pem()
            .map_err(|e| CertError::CsrGeneration(e.to_string()))?;

        Ok((key_pair.serialize_pem(), csr_pem))
    }

    /// Persist key (0600) and certificate (0644) under the cert directory.
    pub fn save_certificate(&self, key_pem: &[u8], cert_pem: &[u8]) -> Result<(), CertError> {
        std::fs::create_dir_all(&self.cert_dir)?;

        let key_path = self.key_path();
        std::fs::write(&key_path, key_pem)?;
        restrict_permissions(&key_path, 0o600)?;

        let cert_path = self.cert_path();
        std::fs::write(&cert_path, cert_pem)?;
        restrict_permissions(&cert_path, 0o644)?;

        Ok(())
    }

    /// Load the persisted identity.
    pub fn load_certificate(&self) -> Result<Identity, CertError> {
        let cert_pem = std::fs::read(self.cert_path())?;
        let key_pem = std::fs::read(self.key_path())?;
        Self::parse_identity(&cert_pem, &key_pem)
    }

    /// Parse PEM cert + key into a rustls-ready identity.
    pub fn parse_identity(cert_pem: &[u8], key_pem: &[u8]) -> Result<Identity, CertError> {
        let mut reader = BufReader::new(cert_pem);
        let cert_chain = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertError::Parse(format!("bad certificate PEM: {e}")))?;
        if cert_chain.is_empty() {
            return Err(CertError::Parse("no certificates in PEM".to_string()));
        }

        let mut reader = BufReader::new(key_pem);
        let private_key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| CertError::Parse(format!("bad key PEM: {e}")))?
            .ok_or_else(|| CertError::Parse("no private key in PEM".to_string()))?;

        Ok(Identity {
            cert_chain,
            private_key,
        })
    }

    /// True when both key and certificate files are present.
    pub fn certificate_exists(&self) -> bool {
        self.key_path().exists() && self.cert_path().exists()
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generates_p384_key_and_csr() {
        let dir = TempDir::new().unwrap();
        let prov = Provisioner::new(dir.path());

        let (key_pem, csr_pem) = prov.generate_key_and_csr().unwrap();
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));
        assert!(csr_pem.contains("BEGIN CERTIFICATE REQUEST"));
    }

    #[test]
    fn save_and_detect_certificate() {
        let dir = TempDir::new().unwrap();
        let prov = Provisioner::new(dir.path());
        assert!(!prov.certificate_exists());

        prov.save_certificate(b"key material", b"cert material")
            .unwrap();
        assert!(prov.certificate_exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(prov.key_path())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn round_trips_self_signed_identity() {
        let dir = TempDir::new().unwrap();
        let prov = Provisioner::new(dir.path());

        // A self-signed certificate stands in for the control-plane-signed one.
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).unwrap();
        let cert = CertificateParams::default().self_signed(&key_pair).unwrap();

        prov.save_certificate(key_pair.serialize_pem().as_bytes(), cert.pem().as_bytes())
            .unwrap();

        let identity = prov.load_certificate().unwrap();
        assert_eq!(identity.cert_chain.len(), 1);
    }
}
