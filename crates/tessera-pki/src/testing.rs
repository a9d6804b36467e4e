//! In-process helpers for tests in this crate and downstream crates.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use tessera_common::test::temp_dir;

use crate::ca::{generate_root, CaConfig, CertificateAuthorityManager};
use crate::csr::CertificateRequest;
use crate::error::SubmitError;
use crate::events::{CertificateEvent, CertificateEventKind, CertificateEventObserver};
use crate::policy::PolicyContext;
use crate::signer::{CertificateSigner, IssuedChain};

/// Fresh CA in a temp directory, issuing leaves valid for `validity_days`.
pub fn throwaway_ca(validity_days: i64) -> CertificateAuthorityManager {
    let mut config = CaConfig::new(temp_dir("tessera-ca"));
    config.validity_days = validity_days;
    generate_root(&config).expect("generate root");
    CertificateAuthorityManager::load(config).expect("load root")
}

/// Sign a fresh key for `worker_id`. Returns `(cert_pem, key_pem)`.
pub fn issue_worker_pem(ca: &CertificateAuthorityManager, worker_id: &str) -> (String, String) {
    let request = CertificateRequest::generate(worker_id, &[], Utc::now()).expect("generate csr");
    let cert = ca
        .sign_csr(request.csr_pem(), &PolicyContext::for_worker(worker_id))
        .expect("sign csr");
    (cert, request.private_key_pem().to_string())
}

/// Signs with an in-process CA, with scriptable failures.
pub struct LocalSigner {
    ca: CertificateAuthorityManager,
    attempts: AtomicU32,
    fail_next: AtomicU32,
    unavailable: AtomicBool,
    rejection: Mutex<Option<String>>,
}

impl LocalSigner {
    pub fn new(ca: CertificateAuthorityManager) -> Self {
        Self {
            ca,
            attempts: AtomicU32::new(0),
            fail_next: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            rejection: Mutex::new(None),
        }
    }

    /// Fail the next `n` submissions transiently.
    pub fn failing_first(self, n: u32) -> Self {
        self.fail_next.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every submission transiently until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Reject every submission with `reason` until cleared.
    pub fn set_rejection(&self, reason: Option<&str>) {
        *self.rejection.lock().unwrap_or_else(PoisonError::into_inner) =
            reason.map(str::to_string);
    }

    /// Submissions seen so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn authority(&self) -> &CertificateAuthorityManager {
        &self.ca
    }
}

#[async_trait]
impl CertificateSigner for LocalSigner {
    async fn submit(&self, worker_id: &str, csr_pem: &str) -> Result<IssuedChain, SubmitError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SubmitError::Transient("CA unavailable".into()));
        }
        let scripted = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if scripted.is_ok() {
            return Err(SubmitError::Transient("connection refused".into()));
        }
        if let Some(reason) = self
            .rejection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(SubmitError::Rejected(reason));
        }

        let mut ctx = PolicyContext::for_worker(worker_id);
        ctx.bootstrap_authenticated = true;
        match self.ca.sign_csr(csr_pem, &ctx) {
            Ok(certificate_pem) => Ok(IssuedChain {
                certificate_pem,
                ca_pem: self.ca.ca_pem().to_string(),
            }),
            Err(e) if e.is_rejection() => Err(SubmitError::Rejected(e.to_string())),
            Err(e) => Err(SubmitError::Transient(e.to_string())),
        }
    }
}

/// Keeps every event it sees.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<CertificateEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<CertificateEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kinds(&self) -> Vec<CertificateEventKind> {
        self.events().iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, kind: CertificateEventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

impl CertificateEventObserver for RecordingObserver {
    fn on_event(&self, event: &CertificateEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
