//! Worker-side certificate signing request.
//!
//! The private key is generated here and stays in this process; only the
//! CSR PEM is ever handed to a signer.

use std::fmt;

use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DnType, KeyPair, SanType};
use zeroize::Zeroizing;

use crate::bundle::CertificateBundle;
use crate::error::CertificateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrStatus {
    Pending,
    Signed,
    Rejected,
}

/// One acquisition attempt's key and CSR.
///
/// Consumed by [`CertificateRequest::into_bundle`] once the CA answers, or
/// dropped (key zeroized) when the attempt is abandoned.
pub struct CertificateRequest {
    worker_id: String,
    requested_at: DateTime<Utc>,
    key_pem: Zeroizing<String>,
    csr_pem: String,
    status: CsrStatus,
}

impl CertificateRequest {
    /// Generate a fresh ECDSA P-256 key and a CSR with `CN=worker_id`.
    ///
    /// Entries of `sans` that parse as IP addresses become IP SANs; the rest
    /// become DNS SANs.
    pub fn generate(
        worker_id: &str,
        sans: &[String],
        requested_at: DateTime<Utc>,
    ) -> Result<Self, rcgen::Error> {
        let key = KeyPair::generate()?;

        let dns_sans: Vec<String> = sans
            .iter()
            .filter(|s| s.parse::<std::net::IpAddr>().is_err())
            .cloned()
            .collect();
        let mut params = CertificateParams::new(dns_sans)?;
        params.distinguished_name.push(DnType::CommonName, worker_id);
        for san in sans {
            if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                params.subject_alt_names.push(SanType::IpAddress(ip));
            }
        }

        let csr_pem = params.serialize_request(&key)?.pem()?;

        Ok(Self {
            worker_id: worker_id.to_string(),
            requested_at,
            key_pem: Zeroizing::new(key.serialize_pem()),
            csr_pem,
            status: CsrStatus::Pending,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }

    /// The public request. Safe to send anywhere.
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    pub fn status(&self) -> CsrStatus {
        self.status
    }

    pub fn mark_signed(&mut self) {
        self.status = CsrStatus::Signed;
    }

    pub fn mark_rejected(&mut self) {
        self.status = CsrStatus::Rejected;
    }

    #[cfg(any(test, feature = "test-util"))]
    pub(crate) fn private_key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Pair the signed certificate with the local key and validate the result.
    pub fn into_bundle(
        self,
        cert_pem: &str,
        ca_pem: &str,
        now: DateTime<Utc>,
    ) -> Result<CertificateBundle, CertificateError> {
        CertificateBundle::from_pem_at(cert_pem, &self.key_pem, ca_pem, now)
    }
}

impl fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRequest")
            .field("worker_id", &self.worker_id)
            .field("requested_at", &self.requested_at)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::certification_request::X509CertificationRequest;
    use x509_parser::prelude::FromDer;

    #[test]
    fn csr_carries_worker_id_and_no_private_key() {
        let req = CertificateRequest::generate("w1", &[], Utc::now()).unwrap();
        assert_eq!(req.status(), CsrStatus::Pending);
        assert!(req.csr_pem().contains("BEGIN CERTIFICATE REQUEST"));
        assert!(!req.csr_pem().contains("PRIVATE KEY"));

        let der = pem::parse(req.csr_pem()).unwrap().into_contents();
        let (_, csr) = X509CertificationRequest::from_der(&der).unwrap();
        csr.verify_signature().unwrap();
        let cn = csr
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok());
        assert_eq!(cn, Some("w1"));
    }

    #[test]
    fn each_request_has_a_fresh_key() {
        let a = CertificateRequest::generate("w1", &[], Utc::now()).unwrap();
        let b = CertificateRequest::generate("w1", &[], Utc::now()).unwrap();
        assert_ne!(a.private_key_pem(), b.private_key_pem());
        assert_ne!(a.csr_pem(), b.csr_pem());
    }

    #[test]
    fn debug_hides_key_material() {
        let req = CertificateRequest::generate("w1", &["10.0.0.5".into()], Utc::now()).unwrap();
        let rendered = format!("{req:?}");
        assert!(rendered.contains("w1"));
        assert!(!rendered.contains("PRIVATE KEY"));
    }
}
