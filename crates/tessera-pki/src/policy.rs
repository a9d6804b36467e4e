//! Issuance and renewal policy hook.
//!
//! Only a default strategy ships; deployments inject their own.

use chrono::{DateTime, Utc};

use crate::bundle::CertificateBundle;

/// Renew when fewer than this many days remain.
pub const DEFAULT_RENEW_WITHIN_DAYS: i64 = 7;

/// What the CA knows about an incoming CSR when consulting the policy.
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    /// Worker ID claimed in the request body.
    pub worker_id: String,
    /// Common name found in the CSR subject.
    pub subject: String,
    /// SANs requested in the CSR.
    pub subject_alt_names: Vec<String>,
    /// Whether the request carried a valid bootstrap token.
    pub bootstrap_authenticated: bool,
}

impl PolicyContext {
    pub fn for_worker(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

pub trait CertificatePolicy: Send + Sync {
    /// Decide whether the CA may sign this request.
    fn can_issue_certificate(&self, _ctx: &PolicyContext) -> PolicyDecision {
        PolicyDecision::Allow
    }

    /// Decide whether the worker should renew `bundle` now.
    fn should_renew_certificate(&self, bundle: &CertificateBundle, now: DateTime<Utc>) -> bool {
        bundle.days_until_expiration_at(now) < DEFAULT_RENEW_WITHIN_DAYS
    }
}

/// Accept every structurally valid request; renew inside a fixed window.
#[derive(Debug, Clone, Copy)]
pub struct DefaultPolicy {
    pub renew_within_days: i64,
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        Self {
            renew_within_days: DEFAULT_RENEW_WITHIN_DAYS,
        }
    }
}

impl CertificatePolicy for DefaultPolicy {
    fn should_renew_certificate(&self, bundle: &CertificateBundle, now: DateTime<Utc>) -> bool {
        bundle.days_until_expiration_at(now) < self.renew_within_days
    }
}
