//! Wire types for the CA HTTP endpoints.
//!
//! These define the JSON shapes of `POST /certificates/sign` and
//! `GET /certificates/ca`. They are the public API contract between
//! workers and the authority.

use serde::{Deserialize, Serialize};

/// Worker request to sign a CSR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRequest {
    pub worker_id: String,
    pub csr_pem: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignStatus {
    Issued,
    Rejected,
}

/// CA answer to a [`SignRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignResponse {
    pub status: SignStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_pem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_pem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SignResponse {
    pub fn issued(certificate_pem: String, ca_pem: String) -> Self {
        Self {
            status: SignStatus::Issued,
            certificate_pem: Some(certificate_pem),
            ca_pem: Some(ca_pem),
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: SignStatus::Rejected,
            certificate_pem: None,
            ca_pem: None,
            reason: Some(reason.into()),
        }
    }
}

/// Root certificate of the trust domain (returned by GET /certificates/ca).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaRootResponse {
    pub ca_pem: String,
    pub fingerprint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_response_omits_certificate_fields() {
        let json = serde_json::to_value(SignResponse::rejected("bad subject")).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["reason"], "bad subject");
        assert!(json.get("certificate_pem").is_none());
    }

    #[test]
    fn issued_response_parses() {
        let resp: SignResponse = serde_json::from_str(
            r#"{"status":"issued","certificate_pem":"C","ca_pem":"A"}"#,
        )
        .unwrap();
        assert_eq!(resp.status, SignStatus::Issued);
        assert_eq!(resp.certificate_pem.as_deref(), Some("C"));
        assert_eq!(resp.reason, None);
    }
}
