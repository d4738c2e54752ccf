//! X.509 certificate construction using rcgen, and a parsed view of the result.

use std::net::IpAddr;

use pem::{EncodeConfig, LineEnding, Pem};
use rand::RngCore;
use rand::rngs::OsRng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use time::{Duration, OffsetDateTime};
use tracing::debug;
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

use super::key::{KeyAlgorithm, KeyMaterial};
use super::root::CaEntry;
use crate::error::{CaError, CaResult};

/// Certificates start this far in the past to tolerate client clock skew.
const CLOCK_SKEW_ALLOWANCE: Duration = Duration::days(2);

/// Last instant a GeneralizedTime can carry.
const MAX_NOT_AFTER: OffsetDateTime = time::macros::datetime!(9999-12-31 23:59:59 UTC);

/// Longest value X.509 allows in a commonName attribute.
const MAX_COMMON_NAME_LEN: usize = 64;

/// Distinguished name attributes for a root certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectAttrs {
    pub common_name: String,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
}

impl SubjectAttrs {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: None,
            organizational_unit: None,
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn with_organizational_unit(mut self, unit: impl Into<String>) -> Self {
        self.organizational_unit = Some(unit.into());
        self
    }

    fn distinguished_name(&self) -> CaResult<DistinguishedName> {
        let mut dn = DistinguishedName::new();
        check_attribute("common name", &self.common_name)?;
        dn.push(DnType::CommonName, self.common_name.as_str());
        if let Some(org) = &self.organization {
            check_attribute("organization", org)?;
            dn.push(DnType::OrganizationName, org.as_str());
        }
        if let Some(unit) = &self.organizational_unit {
            check_attribute("organizational unit", unit)?;
            dn.push(DnType::OrganizationalUnitName, unit.as_str());
        }
        Ok(dn)
    }
}

/// A not-before / not-after window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

impl Validity {
    pub fn new(not_before: OffsetDateTime, not_after: OffsetDateTime) -> CaResult<Self> {
        let validity = Self {
            not_before,
            not_after,
        };
        validity.check()?;
        Ok(validity)
    }

    /// A window ending `lifetime` from now, backdated for clock skew.
    /// Fails when the end falls past year 9999.
    pub fn for_duration(lifetime: std::time::Duration) -> CaResult<Self> {
        let now = OffsetDateTime::now_utc();
        let not_after = Duration::try_from(lifetime)
            .ok()
            .and_then(|lifetime| now.checked_add(lifetime))
            .filter(|end| *end <= MAX_NOT_AFTER)
            .ok_or_else(|| {
                CaError::Encoding(format!(
                    "lifetime of {}s ends after {MAX_NOT_AFTER}",
                    lifetime.as_secs()
                ))
            })?;
        Ok(Self {
            not_before: now - CLOCK_SKEW_ALLOWANCE,
            not_after,
        })
    }

    pub fn days_from_now(days: u32) -> CaResult<Self> {
        Self::for_duration(std::time::Duration::from_secs(u64::from(days) * 86_400))
    }

    fn check(&self) -> CaResult<()> {
        if self.not_after <= self.not_before {
            return Err(CaError::Encoding(format!(
                "validity window ends ({}) before it starts ({})",
                self.not_after, self.not_before
            )));
        }
        if self.not_after > MAX_NOT_AFTER {
            return Err(CaError::Encoding(format!(
                "validity window ends after {MAX_NOT_AFTER}"
            )));
        }
        Ok(())
    }
}

/// A signed certificate, parsed once and kept with its encodings.
#[derive(Debug, Clone)]
pub struct Certificate {
    der: CertificateDer<'static>,
    pem: String,
    subject: String,
    issuer: String,
    self_issued: bool,
    serial: Vec<u8>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    public_key: Vec<u8>,
    signature: Vec<u8>,
    subject_alt_names: Vec<String>,
    is_ca: bool,
}

impl Certificate {
    pub fn from_der(der: Vec<u8>) -> CaResult<Self> {
        let pem = pem::encode_config(
            &Pem::new("CERTIFICATE", der.as_slice()),
            EncodeConfig::new().set_line_ending(LineEnding::LF),
        );
        Self::parse(CertificateDer::from(der), pem)
    }

    /// Parses the first CERTIFICATE block; the text is kept as given.
    pub fn from_pem(pem: &str) -> CaResult<Self> {
        let der = CertificateDer::from_pem_slice(pem.as_bytes())
            .map_err(|e| CaError::Encoding(format!("malformed PEM certificate: {e}")))?;
        Self::parse(der, pem.to_string())
    }

    fn parse(der: CertificateDer<'static>, pem: String) -> CaResult<Self> {
        let (rest, cert) = parse_x509_certificate(&der)
            .map_err(|e| CaError::Encoding(format!("malformed certificate: {e}")))?;
        if !rest.is_empty() {
            return Err(CaError::Encoding(
                "trailing bytes after certificate".to_string(),
            ));
        }

        let subject_alt_names = match cert.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(general_name_to_string)
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                return Err(CaError::Encoding(format!(
                    "malformed subject alternative names: {e}"
                )));
            }
        };

        let subject = cert.subject().to_string();
        let issuer = cert.issuer().to_string();
        let self_issued = cert.subject().as_raw() == cert.issuer().as_raw();
        let serial = cert.raw_serial().to_vec();
        let not_before = cert.validity().not_before.to_datetime();
        let not_after = cert.validity().not_after.to_datetime();
        let public_key = cert.public_key().subject_public_key.data.to_vec();
        let signature = cert.signature_value.data.to_vec();
        let is_ca = cert.is_ca();

        Ok(Self {
            der,
            pem,
            subject,
            issuer,
            self_issued,
            serial,
            not_before,
            not_after,
            public_key,
            signature,
            subject_alt_names,
            is_ca,
        })
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// True when subject and issuer are byte-identical names.
    pub fn is_self_issued(&self) -> bool {
        self.self_issued
    }

    /// Raw big-endian serial number.
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    pub fn serial_hex(&self) -> String {
        self.serial.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// The subject public key bits, comparable with `KeyMaterial::public_key_raw`.
    pub fn public_key_raw(&self) -> &[u8] {
        &self.public_key
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// DNS names and IP addresses from the subjectAltName extension.
    pub fn subject_alt_names(&self) -> &[String] {
        &self.subject_alt_names
    }

    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.not_after
    }
}

/// Builds a self-signed root certificate marked as a CA.
pub fn self_sign(
    key: &KeyMaterial,
    subject: &SubjectAttrs,
    validity: &Validity,
) -> CaResult<Certificate> {
    validity.check()?;

    let mut params = CertificateParams::default();
    params.distinguished_name = subject.distinguished_name()?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = validity.not_before;
    params.not_after = validity.not_after;
    params.serial_number = Some(random_serial()?);

    let cert = params
        .self_signed(key.signing_key())
        .map_err(|e| CaError::Encoding(format!("failed to self-sign root: {e}")))?;

    debug!("self-signed root certificate for {}", subject.common_name);
    Certificate::parse(cert.der().clone(), cert.pem())
}

/// Builds a leaf certificate for `subject_name`, signed by `ca`.
pub fn sign_leaf(
    ca: &CaEntry,
    leaf_key: &KeyMaterial,
    subject_name: &str,
    validity: &Validity,
) -> CaResult<Certificate> {
    check_subject_name(subject_name)?;
    validity.check()?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    if subject_name.len() <= MAX_COMMON_NAME_LEN {
        dn.push(DnType::CommonName, subject_name);
    }
    params.distinguished_name = dn;
    params.subject_alt_names = subject_alt_names(subject_name)?;
    params.is_ca = IsCa::ExplicitNoCa;
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    // RSA key exchange only exists for RSA keys.
    if leaf_key.algorithm() == KeyAlgorithm::Rsa {
        params.key_usages.push(KeyUsagePurpose::KeyEncipherment);
    }
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.not_before = validity.not_before;
    params.not_after = validity.not_after;
    params.serial_number = Some(random_serial()?);

    let cert = params
        .signed_by(leaf_key.signing_key(), ca.issuer())
        .map_err(|e| CaError::Encoding(format!("failed to sign {subject_name}: {e}")))?;

    debug!("signed leaf certificate for {}", subject_name);
    Certificate::parse(cert.der().clone(), cert.pem())
}

/// `*.example.com` for `api.example.com`; `None` when the parent is a bare TLD.
pub fn wildcard_form(name: &str) -> Option<String> {
    if name.starts_with("*.") || name.parse::<IpAddr>().is_ok() {
        return None;
    }
    let (_, parent) = name.split_once('.')?;
    if parent.split('.').filter(|label| !label.is_empty()).count() < 2 {
        return None;
    }
    Some(format!("*.{parent}"))
}

/// Rejects empty names and names with control characters or whitespace.
pub(crate) fn check_subject_name(name: &str) -> CaResult<()> {
    if name.is_empty() {
        return Err(CaError::Encoding("subject name is empty".to_string()));
    }
    if name.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(CaError::Encoding(format!(
            "subject name {name:?} contains control or whitespace characters"
        )));
    }
    Ok(())
}

fn check_attribute(label: &str, value: &str) -> CaResult<()> {
    if value.trim().is_empty() {
        return Err(CaError::Encoding(format!("{label} is empty")));
    }
    if value.chars().any(char::is_control) {
        return Err(CaError::Encoding(format!(
            "{label} {value:?} contains control characters"
        )));
    }
    Ok(())
}

fn subject_alt_names(name: &str) -> CaResult<Vec<SanType>> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(vec![SanType::IpAddress(ip)]);
    }
    let mut sans = vec![dns_san(name)?];
    if let Some(wildcard) = wildcard_form(name) {
        sans.push(dns_san(&wildcard)?);
    }
    Ok(sans)
}

fn dns_san(name: &str) -> CaResult<SanType> {
    let ia5 = name
        .try_into()
        .map_err(|_| CaError::Encoding(format!("{name:?} is not a valid DNS name")))?;
    Ok(SanType::DnsName(ia5))
}

/// 16 random bytes, top bit clear and first byte non-zero so the DER
/// integer stays positive and keeps its full length.
fn random_serial() -> CaResult<SerialNumber> {
    let mut bytes = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CaError::Encoding(format!("random source unavailable for serial: {e}")))?;
    bytes[0] &= 0x7f;
    if bytes[0] == 0 {
        bytes[0] = 1;
    }
    Ok(SerialNumber::from_slice(&bytes))
}

fn general_name_to_string(name: &GeneralName<'_>) -> Option<String> {
    match name {
        GeneralName::DNSName(dns) => Some((*dns).to_string()),
        GeneralName::IPAddress(bytes) => match bytes.len() {
            4 => <[u8; 4]>::try_from(*bytes)
                .ok()
                .map(|octets| IpAddr::from(octets).to_string()),
            16 => <[u8; 16]>::try_from(*bytes)
                .ok()
                .map(|octets| IpAddr::from(octets).to_string()),
            _ => None,
        },
        _ => None,
    }
}
