//! The root CA: its key, its self-signed certificate, and the rcgen issuer
//! derived from them.

use std::fmt;

use rcgen::{Issuer, KeyPair};
use x509_parser::parse_x509_certificate;

use super::encoder::{self, Certificate, SubjectAttrs, Validity};
use super::key::{KeyAlgorithm, KeyMaterial};
use crate::error::{CaError, CaResult};

/// A root key and its self-signed certificate.
///
/// Construction checks that the certificate is a self-issued CA certificate
/// for exactly this key.
pub struct CaEntry {
    key: KeyMaterial,
    certificate: Certificate,
    issuer: Issuer<'static, KeyPair>,
}

impl CaEntry {
    pub fn new(key: KeyMaterial, certificate: Certificate) -> CaResult<Self> {
        if !certificate.is_self_issued() {
            return Err(CaError::Encoding(format!(
                "root certificate issuer {} differs from subject {}",
                certificate.issuer(),
                certificate.subject()
            )));
        }
        if !certificate.is_ca() {
            return Err(CaError::Encoding(
                "root certificate lacks the CA basic constraint".to_string(),
            ));
        }
        if certificate.public_key_raw() != key.public_key_raw() {
            return Err(CaError::Encoding(
                "root certificate does not match the private key".to_string(),
            ));
        }

        let issuer = Issuer::from_ca_cert_der(certificate.der(), key.duplicate()?)
            .map_err(|e| CaError::Encoding(format!("unusable root certificate: {e}")))?;

        Ok(Self {
            key,
            certificate,
            issuer,
        })
    }

    /// Generates a new key and self-signs a root certificate for it.
    pub fn generate(
        algorithm: KeyAlgorithm,
        bits: u32,
        subject: &SubjectAttrs,
        validity: &Validity,
    ) -> CaResult<Self> {
        let key = KeyMaterial::generate(algorithm, bits)?;
        let certificate = encoder::self_sign(&key, subject, validity)?;
        Self::new(key, certificate)
    }

    pub fn key(&self) -> &KeyMaterial {
        &self.key
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Checks that `cert` names this root as issuer and carries a signature
    /// made with the root key.
    pub fn verify(&self, cert: &Certificate) -> CaResult<()> {
        let (_, root) = parse_x509_certificate(self.certificate.der())
            .map_err(|e| CaError::Encoding(format!("malformed root certificate: {e}")))?;
        let (_, child) = parse_x509_certificate(cert.der())
            .map_err(|e| CaError::Encoding(format!("malformed certificate: {e}")))?;

        if child.issuer().as_raw() != root.subject().as_raw() {
            return Err(CaError::Encoding(format!(
                "certificate issued by {} not {}",
                cert.issuer(),
                self.certificate.subject()
            )));
        }
        child
            .verify_signature(Some(root.public_key()))
            .map_err(|e| {
                CaError::Encoding(format!(
                    "signature on {} does not verify against {}: {e}",
                    cert.subject(),
                    self.certificate.subject()
                ))
            })
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }
}

impl fmt::Debug for CaEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaEntry")
            .field("subject", &self.certificate.subject())
            .field("serial", &self.certificate.serial_hex())
            .field("not_after", &self.certificate.not_after())
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
