//! Certificate authority: root bootstrap and CSR signing.
//!
//! Runs only in the authority process. Creates an ECDSA P-256 root with
//! `rcgen` once per deployment and signs worker CSRs, overriding whatever
//! the CSR asked for with the CA's own subject, usages and validity.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rcgen::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use time::OffsetDateTime;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::{FromDer, X509Certificate};
use zeroize::Zeroizing;

use crate::certfiles::write_atomic;
use crate::error::CaError;
use crate::fingerprint::fingerprint_sha256;
use crate::policy::{CertificatePolicy, DefaultPolicy, PolicyContext, PolicyDecision};

const CA_CERT_FILENAME: &str = "ca-cert.pem";
const CA_KEY_FILENAME: &str = "ca-key.pem";

/// Validity of signed worker certificates.
pub const DEFAULT_VALIDITY_DAYS: i64 = 90;

/// Root certificate validity.
const DEFAULT_ROOT_VALIDITY_YEARS: i64 = 10;

/// `not_before` is backdated by this much to absorb clock skew.
const BACKDATE_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct CaConfig {
    pub dir: PathBuf,
    pub common_name: String,
    pub organization: String,
    pub validity_days: i64,
    pub root_validity_years: i64,
}

impl CaConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            common_name: "Tessera Root CA".to_string(),
            organization: "Tessera".to_string(),
            validity_days: DEFAULT_VALIDITY_DAYS,
            root_validity_years: DEFAULT_ROOT_VALIDITY_YEARS,
        }
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CA_CERT_FILENAME)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(CA_KEY_FILENAME)
    }

    /// Lifetimes below one unit would issue already-expired certificates.
    pub fn validate(&self) -> Result<(), CaError> {
        if self.validity_days < 1 {
            return Err(CaError::InvalidConfig(format!(
                "certificate validity must be at least 1 day, got {}",
                self.validity_days
            )));
        }
        if self.root_validity_years < 1 {
            return Err(CaError::InvalidConfig(format!(
                "root validity must be at least 1 year, got {}",
                self.root_validity_years
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootStatus {
    Created,
    AlreadyExists,
}

/// Create the self-signed root for the trust domain.
///
/// Idempotent: an existing root is left untouched. A directory holding
/// only one of the two root files is reported instead of overwritten.
pub fn generate_root(config: &CaConfig) -> Result<RootStatus, CaError> {
    config.validate()?;
    let cert_path = config.cert_path();
    let key_path = config.key_path();

    match (cert_path.exists(), key_path.exists()) {
        (true, true) => {
            tracing::info!(path = %config.dir.display(), "CA root already exists");
            return Ok(RootStatus::AlreadyExists);
        }
        (false, false) => {}
        (has_cert, has_key) => {
            return Err(CaError::RootInconsistent(format!(
                "{} has cert={has_cert} key={has_key}; refusing to overwrite",
                config.dir.display()
            )));
        }
    }

    std::fs::create_dir_all(&config.dir)?;

    let key = KeyPair::generate().map_err(|e| CaError::Signing(e.to_string()))?;
    let params = build_root_params(config)?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| CaError::Signing(e.to_string()))?;

    let key_pem = Zeroizing::new(key.serialize_pem());
    write_atomic(&key_path, key_pem.as_bytes(), true)?;
    write_atomic(&cert_path, cert.pem().as_bytes(), false)?;

    tracing::info!(
        path = %config.dir.display(),
        fingerprint = %fingerprint_sha256(cert.der()),
        "CA root created"
    );
    Ok(RootStatus::Created)
}

fn build_root_params(config: &CaConfig) -> Result<CertificateParams, CaError> {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, config.common_name.as_str());
    params
        .distinguished_name
        .push(DnType::OrganizationName, config.organization.as_str());

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let (not_before, not_after) = validity_window(config.root_validity_years * 365);
    params.not_before = not_before;
    params.not_after = not_after;
    Ok(params)
}

fn validity_window(days: i64) -> (OffsetDateTime, OffsetDateTime) {
    let now = OffsetDateTime::now_utc();
    (
        now - time::Duration::seconds(BACKDATE_SECS),
        now + time::Duration::days(days),
    )
}

/// A key and certificate minted entirely inside the CA process.
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: Zeroizing<String>,
    pub ca_pem: String,
    pub fingerprint: String,
    pub not_after: DateTime<Utc>,
}

impl IssuedCertificate {
    pub fn fullchain_pem(&self) -> String {
        format!("{}{}", self.cert_pem, self.ca_pem)
    }
}

/// Holds the CA key in memory and signs on request.
pub struct CertificateAuthorityManager {
    config: CaConfig,
    key: KeyPair,
    issuer: rcgen::Certificate,
    cert_pem: String,
    fingerprint: String,
    policy: Arc<dyn CertificatePolicy>,
}

impl CertificateAuthorityManager {
    /// Load the root created by [`generate_root`].
    pub fn load(config: CaConfig) -> Result<Self, CaError> {
        config.validate()?;
        let cert_path = config.cert_path();
        let key_path = config.key_path();
        if !cert_path.exists() || !key_path.exists() {
            return Err(CaError::RootMissing);
        }

        let cert_pem = std::fs::read_to_string(&cert_path)?;
        let key_pem = Zeroizing::new(std::fs::read_to_string(&key_path)?);

        let key = KeyPair::from_pem(&key_pem)
            .map_err(|e| CaError::RootInconsistent(format!("unreadable CA key: {e}")))?;
        let der = pem::parse(&cert_pem)
            .map_err(|e| CaError::RootInconsistent(format!("unreadable CA certificate: {e}")))?
            .into_contents();
        let (_, parsed) = X509Certificate::from_der(&der)
            .map_err(|e| CaError::RootInconsistent(format!("unreadable CA certificate: {e}")))?;
        if key.public_key_raw() != &*parsed.public_key().subject_public_key.data {
            return Err(CaError::RootInconsistent(
                "CA key does not match CA certificate".into(),
            ));
        }

        // Rebuild the issuer from the stored certificate so its subject
        // encodes byte-for-byte the same as the one on disk.
        let issuer = CertificateParams::from_ca_cert_pem(&cert_pem)
            .and_then(|params| params.self_signed(&key))
            .map_err(|e| CaError::RootInconsistent(format!("cannot rebuild issuer: {e}")))?;

        tracing::debug!(path = %config.dir.display(), "CA root loaded");

        Ok(Self {
            config,
            key,
            issuer,
            cert_pem,
            fingerprint: fingerprint_sha256(&der),
            policy: Arc::new(DefaultPolicy::default()),
        })
    }

    /// Replace the default accept-all issuance policy.
    pub fn with_policy(mut self, policy: Arc<dyn CertificatePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn ca_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Validate a CSR and sign it for `config.validity_days`.
    ///
    /// The issued subject is `CN=<csr common name>, O=<organization>`. SANs
    /// requested in the CSR are kept; without any, the common name becomes
    /// the single DNS SAN.
    pub fn sign_csr(&self, csr_pem: &str, ctx: &PolicyContext) -> Result<String, CaError> {
        let parsed = pem::parse(csr_pem)
            .map_err(|e| CaError::CsrValidation(format!("not a PEM block: {e}")))?;
        if parsed.tag() != "CERTIFICATE REQUEST" {
            return Err(CaError::CsrValidation(format!(
                "expected CERTIFICATE REQUEST block, found {}",
                parsed.tag()
            )));
        }

        let (_, csr) = X509CertificationRequest::from_der(parsed.contents())
            .map_err(|e| CaError::CsrValidation(e.to_string()))?;
        csr.verify_signature()
            .map_err(|e| CaError::CsrValidation(format!("signature does not verify: {e}")))?;

        let subject = csr
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string)
            .ok_or_else(|| CaError::CsrValidation("subject has no common name".into()))?;

        if ctx.worker_id.is_empty() {
            return Err(CaError::CsrValidation(format!(
                "request for '{subject}' names no worker"
            )));
        }
        if ctx.worker_id != subject {
            return Err(CaError::CsrValidation(format!(
                "subject '{subject}' does not match worker '{}'",
                ctx.worker_id
            )));
        }

        let mut policy_ctx = ctx.clone();
        policy_ctx.subject = subject.clone();
        policy_ctx.subject_alt_names = requested_sans(&csr);
        if let PolicyDecision::Deny(reason) = self.policy.can_issue_certificate(&policy_ctx) {
            tracing::warn!(subject = %subject, reason = %reason, "CSR denied by policy");
            return Err(CaError::PolicyDenied { subject, reason });
        }

        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| CaError::CsrValidation(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject.as_str());
        dn.push(DnType::OrganizationName, self.config.organization.as_str());
        csr_params.params.distinguished_name = dn;

        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        let (not_before, not_after) = validity_window(self.config.validity_days);
        csr_params.params.not_before = not_before;
        csr_params.params.not_after = not_after;

        if csr_params.params.subject_alt_names.is_empty() {
            if let Ok(name) = Ia5String::try_from(subject.clone()) {
                csr_params.params.subject_alt_names = vec![SanType::DnsName(name)];
            }
        }

        let cert = csr_params
            .signed_by(&self.issuer, &self.key)
            .map_err(|e| CaError::Signing(e.to_string()))?;

        tracing::info!(
            subject = %subject,
            fingerprint = %fingerprint_sha256(cert.der()),
            validity_days = self.config.validity_days,
            "Signed worker certificate"
        );
        Ok(cert.pem())
    }

    /// Generate a key and certificate for a TLS server run by the CA host.
    ///
    /// `sans` entries that parse as IP addresses become IP SANs; the rest
    /// become DNS SANs. The first entry is also the common name.
    pub fn issue_server_certificate(&self, sans: &[String]) -> Result<IssuedCertificate, CaError> {
        let key = KeyPair::generate().map_err(|e| CaError::Signing(e.to_string()))?;

        let dns_sans: Vec<String> = sans
            .iter()
            .filter(|s| s.parse::<IpAddr>().is_err())
            .cloned()
            .collect();
        let mut params =
            CertificateParams::new(dns_sans).map_err(|e| CaError::Signing(e.to_string()))?;
        if let Some(first) = sans.first() {
            params.distinguished_name.push(DnType::CommonName, first.as_str());
        }
        for san in sans {
            if let Ok(ip) = san.parse::<IpAddr>() {
                params.subject_alt_names.push(SanType::IpAddress(ip));
            }
        }
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let (not_before, not_after) = validity_window(self.config.validity_days);
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params
            .signed_by(&key, &self.issuer, &self.key)
            .map_err(|e| CaError::Signing(e.to_string()))?;

        let expires = DateTime::<Utc>::from_timestamp(not_after.unix_timestamp(), 0)
            .unwrap_or_else(Utc::now);

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: Zeroizing::new(key.serialize_pem()),
            ca_pem: self.cert_pem.clone(),
            fingerprint: fingerprint_sha256(cert.der()),
            not_after: expires,
        })
    }
}

fn requested_sans(csr: &X509CertificationRequest<'_>) -> Vec<String> {
    let mut sans = Vec::new();
    let Some(extensions) = csr.requested_extensions() else {
        return sans;
    };
    for ext in extensions {
        if let ParsedExtension::SubjectAlternativeName(san) = ext {
            for name in &san.general_names {
                match name {
                    GeneralName::DNSName(dns) => sans.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            sans.push(ip.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    sans
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}
