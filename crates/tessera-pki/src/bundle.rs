//! Validated certificate/key/CA triple.
//!
//! A [`CertificateBundle`] only exists if all three PEM blocks parsed, the
//! private key belongs to the certificate, the certificate verifies
//! against the CA and it had not expired at construction time. Renewal
//! builds a new bundle; nothing here mutates after construction.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rcgen::KeyPair;
use x509_parser::prelude::{FromDer, X509Certificate};
use zeroize::Zeroizing;

use crate::error::{CertificateError, PemKind};
use crate::fingerprint::fingerprint_sha256;
use crate::tls::TlsConfig;

/// Tolerated clock skew between the CA and this host for `not_before`.
const NOT_BEFORE_SKEW_MINUTES: i64 = 5;

/// Length of the fingerprint prefix shown in [`CertificateBundle::describe`].
const SHORT_FINGERPRINT_LEN: usize = 16;

#[derive(Clone)]
pub struct CertificateBundle {
    cert_pem: String,
    key_pem: Zeroizing<String>,
    ca_pem: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    subject: String,
    issuer: String,
    fingerprint: String,
}

impl CertificateBundle {
    /// Validate and build a bundle against the current wall-clock time.
    pub fn from_pem(cert_pem: &str, key_pem: &str, ca_pem: &str) -> Result<Self, CertificateError> {
        Self::from_pem_at(cert_pem, key_pem, ca_pem, Utc::now())
    }

    /// Validate and build a bundle as of `now`.
    pub fn from_pem_at(
        cert_pem: &str,
        key_pem: &str,
        ca_pem: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, CertificateError> {
        let cert_der = decode_certificate(cert_pem, PemKind::Certificate)?;
        let ca_der = decode_certificate(ca_pem, PemKind::Ca)?;
        let key = decode_key(key_pem)?;

        let (_, cert) = X509Certificate::from_der(&cert_der)
            .map_err(|e| CertificateError::format(PemKind::Certificate, e))?;
        let (_, ca) = X509Certificate::from_der(&ca_der)
            .map_err(|e| CertificateError::format(PemKind::Ca, e))?;

        if key.public_key_raw() != &*cert.public_key().subject_public_key.data {
            return Err(CertificateError::KeyMismatch);
        }

        if !ca.is_ca() {
            return Err(CertificateError::Chain(
                "trust anchor is not a CA certificate".into(),
            ));
        }
        cert.verify_signature(Some(ca.public_key()))
            .map_err(|e| CertificateError::Chain(e.to_string()))?;

        let not_before = to_utc(cert.validity().not_before.timestamp())?;
        let not_after = to_utc(cert.validity().not_after.timestamp())?;

        if not_after <= now {
            return Err(CertificateError::Expired { not_after });
        }
        if not_before > now + Duration::minutes(NOT_BEFORE_SKEW_MINUTES) {
            return Err(CertificateError::NotYetValid { not_before });
        }

        let subject = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| cert.subject().to_string());
        let issuer = ca
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| ca.subject().to_string());

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: Zeroizing::new(key_pem.to_string()),
            ca_pem: ca_pem.to_string(),
            not_before,
            not_after,
            subject,
            issuer,
            fingerprint: fingerprint_sha256(&cert_der),
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub(crate) fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    /// Leaf followed by the CA, as served in a TLS handshake.
    pub fn fullchain_pem(&self) -> String {
        let mut chain = self.cert_pem.clone();
        if !chain.ends_with('\n') {
            chain.push('\n');
        }
        chain.push_str(&self.ca_pem);
        chain
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Common name of the certificate (the worker ID for worker certs).
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// SHA-256 of the leaf certificate DER, lowercase hex.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Whole days left before `not_after`, rounded toward zero.
    pub fn days_until_expiration(&self) -> i64 {
        self.days_until_expiration_at(Utc::now())
    }

    pub fn days_until_expiration_at(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.not_after <= now
    }

    /// TLS material for clients and listeners built from this bundle.
    pub fn to_tls_config(&self) -> TlsConfig {
        TlsConfig::new(
            self.fullchain_pem(),
            Zeroizing::new(self.key_pem.to_string()),
            self.ca_pem.clone(),
        )
    }

    /// One-line summary for logs. Never includes key material.
    pub fn describe(&self) -> String {
        let short = &self.fingerprint[..SHORT_FINGERPRINT_LEN.min(self.fingerprint.len())];
        format!(
            "subject={} issuer={} not_before={} not_after={} days_left={} fingerprint={short}",
            self.subject,
            self.issuer,
            self.not_before.format("%Y-%m-%dT%H:%M:%SZ"),
            self.not_after.format("%Y-%m-%dT%H:%M:%SZ"),
            self.days_until_expiration(),
        )
    }
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

fn decode_certificate(input: &str, kind: PemKind) -> Result<Vec<u8>, CertificateError> {
    let parsed = pem::parse(input).map_err(|e| CertificateError::format(kind, e))?;
    if parsed.tag() != "CERTIFICATE" {
        return Err(CertificateError::format(
            kind,
            format!("expected CERTIFICATE block, found {}", parsed.tag()),
        ));
    }
    Ok(parsed.into_contents())
}

fn decode_key(input: &str) -> Result<KeyPair, CertificateError> {
    let parsed =
        pem::parse(input).map_err(|e| CertificateError::format(PemKind::PrivateKey, e))?;
    if !parsed.tag().ends_with("PRIVATE KEY") {
        return Err(CertificateError::format(
            PemKind::PrivateKey,
            format!("expected PRIVATE KEY block, found {}", parsed.tag()),
        ));
    }
    KeyPair::from_pem(input).map_err(|e| CertificateError::format(PemKind::PrivateKey, e))
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>, CertificateError> {
    DateTime::<Utc>::from_timestamp(timestamp, 0).ok_or_else(|| {
        CertificateError::format(PemKind::Certificate, "validity timestamp out of range")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{issue_worker_pem, throwaway_ca};

    #[test]
    fn valid_triple_builds_bundle_with_metadata() {
        let ca = throwaway_ca(90);
        let (cert, key) = issue_worker_pem(&ca, "w1");
        let bundle = CertificateBundle::from_pem(&cert, &key, ca.ca_pem()).unwrap();

        assert_eq!(bundle.subject(), "w1");
        assert_eq!(bundle.fingerprint().len(), 64);
        let days = bundle.days_until_expiration();
        assert!((88..=90).contains(&days), "days_left = {days}");
        assert!(bundle.not_before() < bundle.not_after());
    }

    #[test]
    fn certificate_from_another_ca_is_a_chain_error() {
        let ca = throwaway_ca(90);
        let other = throwaway_ca(90);
        let (cert, key) = issue_worker_pem(&ca, "w1");

        let err = CertificateBundle::from_pem(&cert, &key, other.ca_pem()).unwrap_err();
        assert!(matches!(err, CertificateError::Chain(_)), "{err:?}");
    }

    #[test]
    fn leaf_used_as_trust_anchor_is_a_chain_error() {
        let ca = throwaway_ca(90);
        let (cert, key) = issue_worker_pem(&ca, "w1");
        let (other_leaf, _) = issue_worker_pem(&ca, "w2");

        let err = CertificateBundle::from_pem(&cert, &key, &other_leaf).unwrap_err();
        assert!(matches!(err, CertificateError::Chain(_)), "{err:?}");
    }

    #[test]
    fn foreign_key_is_a_key_mismatch() {
        let ca = throwaway_ca(90);
        let (cert, _) = issue_worker_pem(&ca, "w1");
        let (_, other_key) = issue_worker_pem(&ca, "w2");

        let err = CertificateBundle::from_pem(&cert, &other_key, ca.ca_pem()).unwrap_err();
        assert!(matches!(err, CertificateError::KeyMismatch), "{err:?}");
    }

    #[test]
    fn expired_at_construction_time_is_rejected() {
        let ca = throwaway_ca(5);
        let (cert, key) = issue_worker_pem(&ca, "w1");
        let later = Utc::now() + Duration::days(6);

        let err = CertificateBundle::from_pem_at(&cert, &key, ca.ca_pem(), later).unwrap_err();
        assert!(matches!(err, CertificateError::Expired { .. }), "{err:?}");
    }

    #[test]
    fn certificate_from_the_future_is_not_yet_valid() {
        let ca = throwaway_ca(90);
        let (cert, key) = issue_worker_pem(&ca, "w1");
        let earlier = Utc::now() - Duration::days(1);

        let err = CertificateBundle::from_pem_at(&cert, &key, ca.ca_pem(), earlier).unwrap_err();
        assert!(matches!(err, CertificateError::NotYetValid { .. }), "{err:?}");
    }

    #[test]
    fn malformed_inputs_name_the_faulty_part() {
        let ca = throwaway_ca(90);
        let (cert, key) = issue_worker_pem(&ca, "w1");
        let ca_pem = ca.ca_pem().to_string();

        let truncated = &cert[..cert.len() / 2];
        let no_footer = cert.replace("-----END CERTIFICATE-----", "");
        let no_header = cert.replace("-----BEGIN CERTIFICATE-----", "");
        let key_as_cert = key.clone();
        let corrupted_key = {
            let mut lines: Vec<String> = key.lines().map(str::to_string).collect();
            lines[1] = "A".repeat(lines[1].len());
            lines.join("\n")
        };
        let cert_as_key = cert.clone();

        let cases: Vec<(&str, &str, &str, PemKind)> = vec![
            (truncated, &key, &ca_pem, PemKind::Certificate),
            (&no_footer, &key, &ca_pem, PemKind::Certificate),
            (&no_header, &key, &ca_pem, PemKind::Certificate),
            (&key_as_cert, &key, &ca_pem, PemKind::Certificate),
            ("", &key, &ca_pem, PemKind::Certificate),
            (&cert, &corrupted_key, &ca_pem, PemKind::PrivateKey),
            (&cert, &cert_as_key, &ca_pem, PemKind::PrivateKey),
            (&cert, "garbage", &ca_pem, PemKind::PrivateKey),
            (&cert, &key, "-----BEGIN CERTIFICATE-----\n", PemKind::Ca),
        ];

        for (i, (c, k, a, expected)) in cases.into_iter().enumerate() {
            match CertificateBundle::from_pem(c, k, a) {
                Err(CertificateError::Format { kind, .. }) => {
                    assert_eq!(kind, expected, "case {i}")
                }
                other => panic!("case {i}: expected Format({expected:?}), got {other:?}"),
            }
        }
    }

    #[test]
    fn describe_and_debug_never_leak_the_key() {
        let ca = throwaway_ca(90);
        let (cert, key) = issue_worker_pem(&ca, "w1");
        let bundle = CertificateBundle::from_pem(&cert, &key, ca.ca_pem()).unwrap();

        let described = bundle.describe();
        assert!(described.contains("subject=w1"));
        assert!(!described.contains("PRIVATE KEY"));
        assert!(!format!("{bundle:?}").contains("PRIVATE KEY"));
    }

    #[test]
    fn fullchain_starts_with_leaf() {
        let ca = throwaway_ca(90);
        let (cert, key) = issue_worker_pem(&ca, "w1");
        let bundle = CertificateBundle::from_pem(&cert, &key, ca.ca_pem()).unwrap();

        let chain = bundle.fullchain_pem();
        assert!(chain.starts_with(cert.trim_end()));
        assert!(chain.ends_with(ca.ca_pem()));
    }
}
