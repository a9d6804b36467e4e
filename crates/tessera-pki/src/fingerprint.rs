//! Certificate fingerprints and constant-time comparison.

use std::fmt::Write;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// SHA-256 of a DER-encoded certificate, as lowercase hex.
pub fn fingerprint_sha256(cert_der: &[u8]) -> String {
    Sha256::digest(cert_der)
        .iter()
        .fold(String::with_capacity(64), |mut hex, byte| {
            let _ = write!(hex, "{byte:02x}");
            hex
        })
}

/// Fingerprint of the first certificate in a PEM string.
pub fn fingerprint_pem(cert_pem: &str) -> Result<String, pem::PemError> {
    pem::parse(cert_pem).map(|block| fingerprint_sha256(block.contents()))
}

/// Compare bearer tokens or pinned fingerprints. Unequal lengths return
/// early; equal lengths are compared without a data-dependent exit.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}
