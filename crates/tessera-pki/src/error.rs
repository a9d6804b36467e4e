//! PKI error types.

use std::fmt;

use chrono::{DateTime, Utc};
use tessera_common::error::ErrorCode;

/// Which of the three PEM inputs of a bundle was at fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PemKind {
    Certificate,
    PrivateKey,
    Ca,
}

impl fmt::Display for PemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Certificate => "certificate",
            Self::PrivateKey => "private key",
            Self::Ca => "CA certificate",
        })
    }
}

/// Validation failure while building a [`crate::CertificateBundle`].
///
/// Never retried with the same input; re-acquisition is the only recovery.
#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("malformed {kind}: {reason}")]
    Format { kind: PemKind, reason: String },

    #[error("private key does not match the certificate's public key")]
    KeyMismatch,

    #[error("certificate does not chain to the supplied CA: {0}")]
    Chain(String),

    #[error("certificate expired at {not_after}")]
    Expired { not_after: DateTime<Utc> },

    #[error("certificate not valid before {not_before}")]
    NotYetValid { not_before: DateTime<Utc> },
}

impl CertificateError {
    pub(crate) fn format(kind: PemKind, reason: impl fmt::Display) -> Self {
        Self::Format {
            kind,
            reason: reason.to_string(),
        }
    }
}

/// Authority-side failures.
#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("CA not initialized; run `tessera ca init` first")]
    RootMissing,

    #[error("CA directory is inconsistent: {0}")]
    RootInconsistent(String),

    #[error("invalid CA configuration: {0}")]
    InvalidConfig(String),

    /// Malformed CSR or subject mismatch. Answered with a 4xx.
    #[error("invalid CSR: {0}")]
    CsrValidation(String),

    /// Structurally valid CSR refused by the issuance policy. Answered with a 4xx.
    #[error("policy denied certificate for '{subject}': {reason}")]
    PolicyDenied { subject: String, reason: String },

    /// Internal fault while signing. Callers retry at the transport layer.
    #[error("signing failed: {0}")]
    Signing(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaError {
    /// Whether the requester should stop retrying this CSR.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::CsrValidation(_) | Self::PolicyDenied { .. })
    }
}

impl From<&CaError> for ErrorCode {
    fn from(e: &CaError) -> Self {
        match e {
            CaError::RootMissing => ErrorCode::CaNotInitialized,
            CaError::RootInconsistent(_) | CaError::InvalidConfig(_) => ErrorCode::Internal,
            CaError::CsrValidation(_) => ErrorCode::InvalidCsr,
            CaError::PolicyDenied { .. } => ErrorCode::PolicyDenied,
            CaError::Signing(_) => ErrorCode::SigningFailed,
            CaError::Io(_) => ErrorCode::IoError,
        }
    }
}

/// Result of one CSR submission through a [`crate::CertificateSigner`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// CA unreachable or failing internally. Retried with backoff.
    #[error("CA unavailable: {0}")]
    Transient(String),

    /// Definitive refusal. Never retried with the same CSR.
    #[error("CA rejected the request: {0}")]
    Rejected(String),
}

/// Where certificate acquisition gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionStage {
    CsrGeneration,
    Submission,
    CaRejection,
    Validation,
}

impl AcquisitionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CsrGeneration => "csr_generation",
            Self::Submission => "submission",
            Self::CaRejection => "ca_rejection",
            Self::Validation => "validation",
        }
    }
}

impl fmt::Display for AcquisitionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker-side certificate manager failures.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Fatal at startup: a worker never runs without identity.
    #[error("certificate unavailable at stage {stage} after {attempts} attempt(s): {reason}")]
    CertificateUnavailable {
        stage: AcquisitionStage,
        attempts: u32,
        reason: String,
    },

    #[error("certificate acquisition cancelled by shutdown")]
    Cancelled,
}

impl ManagerError {
    pub fn stage(&self) -> Option<AcquisitionStage> {
        match self {
            Self::CertificateUnavailable { stage, .. } => Some(*stage),
            Self::Cancelled => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_error_maps_to_wire_codes() {
        let cases: Vec<(CaError, ErrorCode)> = vec![
            (CaError::RootMissing, ErrorCode::CaNotInitialized),
            (CaError::InvalidConfig("x".into()), ErrorCode::Internal),
            (CaError::CsrValidation("x".into()), ErrorCode::InvalidCsr),
            (
                CaError::PolicyDenied {
                    subject: "w1".into(),
                    reason: "no".into(),
                },
                ErrorCode::PolicyDenied,
            ),
            (CaError::Signing("x".into()), ErrorCode::SigningFailed),
            (
                CaError::Io(std::io::Error::other("disk")),
                ErrorCode::IoError,
            ),
        ];
        for (err, code) in &cases {
            assert_eq!(ErrorCode::from(err), *code, "{err:?}");
        }
    }

    #[test]
    fn only_csr_problems_are_rejections() {
        assert!(CaError::CsrValidation("bad".into()).is_rejection());
        assert!(!CaError::Signing("boom".into()).is_rejection());
        assert!(!CaError::RootMissing.is_rejection());
    }

    #[test]
    fn unavailable_error_names_the_stage() {
        let err = ManagerError::CertificateUnavailable {
            stage: AcquisitionStage::CaRejection,
            attempts: 1,
            reason: "denied".into(),
        };
        assert_eq!(err.stage(), Some(AcquisitionStage::CaRejection));
        assert!(err.to_string().contains("ca_rejection"));
    }
}
