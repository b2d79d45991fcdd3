//! Root CA lifecycle: created once per installation, reused afterwards.

use std::sync::Arc;

use rsa::RsaPrivateKey;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::CertificateConfig;
use crate::key_store::{KeyStore, StoreError};
use crate::pem;
use crate::x509::{self, CertificateError, Validity};

#[derive(Debug, Error)]
pub enum CaError {
    #[error(transparent)]
    Certificate(#[from] CertificateError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0} was stored but cannot be read back")]
    NotPersisted(String),
}

pub struct CertificateAuthority {
    store: Arc<dyn KeyStore>,
    settings: CertificateConfig,
}

impl CertificateAuthority {
    pub fn new(store: Arc<dyn KeyStore>, settings: CertificateConfig) -> Self {
        let ca = Self { store, settings };
        if ca.is_generated() {
            info!(target: "ca", label = %ca.settings.label, "found existing root CA certificate");
        } else {
            info!(target: "ca", label = %ca.settings.label, "no existing root CA found");
        }
        ca
    }

    pub fn settings(&self) -> &CertificateConfig {
        &self.settings
    }

    pub fn is_generated(&self) -> bool {
        self.certificate().is_some()
    }

    /// DER bytes of the persisted certificate.
    pub fn certificate(&self) -> Option<Vec<u8>> {
        self.store.get_certificate(&self.settings.label)
    }

    /// PEM rendering of the persisted certificate, regenerated on every call.
    pub fn export_pem(&self) -> Option<String> {
        self.certificate().map(|der| pem::encode_certificate(&der))
    }

    /// Returns the persisted root certificate, generating it first if the store
    /// holds none. What comes back is always what the store holds, so callers
    /// racing on first launch converge on one certificate.
    pub fn ensure_root_ca(&self) -> Result<Vec<u8>, CaError> {
        if let Some(existing) = self.certificate() {
            return Ok(existing);
        }

        info!(target: "ca", common_name = %self.settings.common_name, "generating root CA certificate");

        let key = self.persisted_private_key()?;
        let window = Validity::starting_now(self.settings.validity_days);
        let der = x509::build_self_signed(&key, &self.settings.common_name, &window)?;
        drop(key);

        x509::verify_self_signed(&der)?;
        check_trust_anchor(&der)?;

        self.store.store_certificate(&der, &self.settings.label)?;
        let persisted = self
            .certificate()
            .ok_or_else(|| CaError::NotPersisted(self.settings.label.clone()))?;

        if persisted != der {
            warn!(target: "ca", "another generation attempt stored its certificate first, using that one");
        }
        info!(target: "ca", bytes = persisted.len(), "root CA certificate generated and stored");
        Ok(persisted)
    }

    /// The signing key the certificate must match. A key left behind by an
    /// earlier attempt is reused; otherwise a fresh one is generated, stored,
    /// and read back so a concurrent writer's key wins consistently. A key the
    /// store holds but cannot return is an error, never replaced in memory.
    fn persisted_private_key(&self) -> Result<RsaPrivateKey, CaError> {
        let label = self.settings.private_key_label();
        if let Some(existing) = self.store.get_private_key(&label) {
            info!(target: "ca", "reusing stored root CA private key");
            return Ok(existing);
        }

        let generated = x509::generate_key_pair(self.settings.key_bits)?;
        self.store.store_private_key(&generated, &label)?;
        drop(generated);
        self.store
            .get_private_key(&label)
            .ok_or(CaError::NotPersisted(label))
    }
}

/// Loads the certificate into a rustls root store, the same check a TLS client
/// performs before accepting it as a trust anchor.
pub fn check_trust_anchor(der: &[u8]) -> Result<(), CertificateError> {
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(&rustls::Certificate(der.to_vec()))
        .map_err(CertificateError::UntrustedEncoding)
}
