//! Worker-side certificate lifecycle.
//!
//! [`CertificateManager`] owns the worker's identity: it acquires a
//! certificate through the CSR flow, publishes the active bundle on a
//! watch channel and renews it from a background loop. Readers only ever
//! hold an `Arc<CertificateBundle>`, so a renewal swaps the whole value
//! and nobody observes a cert/key mismatch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use tessera_common::backoff::RetryPolicy;
use tessera_common::clock::{Clock, SystemClock};
use tessera_common::id::correlation_id;

use crate::bundle::CertificateBundle;
use crate::certfiles;
use crate::csr::CertificateRequest;
use crate::error::{AcquisitionStage, ManagerError, SubmitError};
use crate::events::{CertificateEvent, CertificateEventKind, CertificateEventObserver, TracingObserver};
use crate::policy::{CertificatePolicy, DefaultPolicy};
use crate::signer::{CertificateSigner, IssuedChain};

/// How often the renewal loop re-checks the active certificate.
pub const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Emit `CERT_EXPIRING_SOON` when fewer than this many days remain.
pub const DEFAULT_WARN_WITHIN_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct CertificateManagerConfig {
    pub worker_id: String,
    /// Where `cert.pem`, `key.pem`, `ca.pem` and `fullchain.pem` live.
    pub cert_dir: PathBuf,
    /// Extra SANs for the CSR. IP literals become IP SANs.
    pub subject_alt_names: Vec<String>,
    pub renewal_check_interval: Duration,
    pub warn_within_days: i64,
    pub retry: RetryPolicy,
}

impl CertificateManagerConfig {
    pub fn new(worker_id: impl Into<String>, cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            worker_id: worker_id.into(),
            cert_dir: cert_dir.into(),
            subject_alt_names: Vec::new(),
            renewal_check_interval: RENEWAL_CHECK_INTERVAL,
            warn_within_days: DEFAULT_WARN_WITHIN_DAYS,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    AcquiringCertificate,
    Valid,
    RenewalDue,
    Expired,
}

/// Result of one renewal check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// Nothing to do.
    Healthy,
    /// Inside the warning window, renewal not yet due.
    ExpiringSoon,
    Renewed,
    /// Renewal was due and failed; the previous bundle stays active.
    RenewalFailed,
    /// Expired and re-acquisition failed.
    Expired,
}

pub struct CertificateManager {
    config: CertificateManagerConfig,
    signer: Arc<dyn CertificateSigner>,
    policy: Arc<dyn CertificatePolicy>,
    observer: Arc<dyn CertificateEventObserver>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    bundle_tx: watch::Sender<Option<Arc<CertificateBundle>>>,
    state_tx: watch::Sender<ManagerState>,
    acquire_lock: Mutex<()>,
}

impl CertificateManager {
    pub fn new(config: CertificateManagerConfig, signer: Arc<dyn CertificateSigner>) -> Self {
        let (bundle_tx, _) = watch::channel(None);
        let (state_tx, _) = watch::channel(ManagerState::Uninitialized);
        Self {
            config,
            signer,
            policy: Arc::new(DefaultPolicy::default()),
            observer: Arc::new(TracingObserver),
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
            bundle_tx,
            state_tx,
            acquire_lock: Mutex::new(()),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn CertificatePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CertificateEventObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Token that interrupts CSR submission and backoff sleeps.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// The active bundle, if any.
    pub fn current(&self) -> Option<Arc<CertificateBundle>> {
        self.bundle_tx.borrow().clone()
    }

    /// Receiver that sees every bundle swap.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<CertificateBundle>>> {
        self.bundle_tx.subscribe()
    }

    pub fn state(&self) -> ManagerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ManagerState> {
        self.state_tx.subscribe()
    }

    /// Return a valid bundle, acquiring one if needed.
    ///
    /// With a valid bundle in memory this does no I/O and returns the same
    /// `Arc`. Otherwise a persisted bundle is reused when it is still valid
    /// and not due for renewal, and only then is a new CSR submitted.
    pub async fn ensure_certificate(&self) -> Result<Arc<CertificateBundle>, ManagerError> {
        self.ensure_within(&self.cancel).await
    }

    async fn ensure_within(
        &self,
        scope: &CancellationToken,
    ) -> Result<Arc<CertificateBundle>, ManagerError> {
        if let Some(bundle) = self.current_valid() {
            return Ok(bundle);
        }

        let _guard = self.acquire_lock.lock().await;
        if let Some(bundle) = self.current_valid() {
            return Ok(bundle);
        }

        if let Some(bundle) = self.load_persisted() {
            let bundle = Arc::new(bundle);
            self.bundle_tx.send_replace(Some(bundle.clone()));
            self.set_state(ManagerState::Valid);
            tracing::info!(
                worker_id = %self.config.worker_id,
                certificate = %bundle.describe(),
                "Reusing persisted certificate"
            );
            return Ok(bundle);
        }

        self.acquire(false, scope).await
    }

    /// One pass of the renewal check.
    pub async fn check_renewal(&self) -> RenewalOutcome {
        self.check_renewal_within(&self.cancel).await
    }

    /// A renewal check whose CSR submission and backoff also stop when
    /// `scope` fires.
    async fn check_renewal_within(&self, scope: &CancellationToken) -> RenewalOutcome {
        let Some(bundle) = self.current() else {
            return match self.ensure_within(scope).await {
                Ok(_) => RenewalOutcome::Renewed,
                Err(e) => {
                    tracing::error!(worker_id = %self.config.worker_id, error = %e, "No certificate and acquisition failed");
                    RenewalOutcome::RenewalFailed
                }
            };
        };

        let now = self.clock.now();
        if bundle.is_expired_at(now) {
            self.emit(
                self.event(CertificateEventKind::CertExpired, &correlation_id())
                    .with("not_after", bundle.not_after().to_rfc3339())
                    .with("fingerprint", bundle.fingerprint()),
            );
            self.set_state(ManagerState::Expired);
            return match self.renew(scope).await {
                Ok(_) => RenewalOutcome::Renewed,
                Err(e) => {
                    tracing::error!(
                        worker_id = %self.config.worker_id,
                        error = %e,
                        "Certificate expired and could not be re-acquired"
                    );
                    RenewalOutcome::Expired
                }
            };
        }

        let days_left = bundle.days_until_expiration_at(now);
        let warn = days_left < self.config.warn_within_days;
        if warn {
            self.emit(
                self.event(CertificateEventKind::CertExpiringSoon, &correlation_id())
                    .with("days_left", days_left)
                    .with("not_after", bundle.not_after().to_rfc3339()),
            );
        }

        if !self.policy.should_renew_certificate(&bundle, now) {
            return if warn {
                RenewalOutcome::ExpiringSoon
            } else {
                RenewalOutcome::Healthy
            };
        }

        self.set_state(ManagerState::RenewalDue);
        tracing::info!(worker_id = %self.config.worker_id, days_left, "Certificate renewal due");
        match self.renew(scope).await {
            Ok(_) => RenewalOutcome::Renewed,
            Err(e) => {
                self.emit(
                    self.event(CertificateEventKind::CertValidationFailed, &correlation_id())
                        .with("stage", "renewal")
                        .with("reason", &e)
                        .with("days_left", days_left),
                );
                tracing::error!(
                    worker_id = %self.config.worker_id,
                    error = %e,
                    days_left,
                    "Certificate renewal failed, keeping current certificate"
                );
                RenewalOutcome::RenewalFailed
            }
        }
    }

    /// Check hourly (or per config) until `cancel` fires. Never returns early
    /// on a failed renewal.
    pub async fn run_renewal_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.renewal_check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; ensure_certificate just ran.
        interval.tick().await;

        tracing::debug!(
            worker_id = %self.config.worker_id,
            interval_secs = self.config.renewal_check_interval.as_secs(),
            "Certificate renewal loop started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let outcome = self.check_renewal_within(&cancel).await;
                    tracing::debug!(worker_id = %self.config.worker_id, ?outcome, "Renewal check complete");
                }
            }
        }
        tracing::debug!(worker_id = %self.config.worker_id, "Certificate renewal loop stopped");
    }

    async fn renew(&self, scope: &CancellationToken) -> Result<Arc<CertificateBundle>, ManagerError> {
        let _guard = self.acquire_lock.lock().await;
        self.acquire(true, scope).await
    }

    /// Resolves once the manager's own token or `scope` is cancelled.
    async fn stopped(&self, scope: &CancellationToken) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = scope.cancelled() => {}
        }
    }

    fn current_valid(&self) -> Option<Arc<CertificateBundle>> {
        let now = self.clock.now();
        self.current().filter(|b| !b.is_expired_at(now))
    }

    fn load_persisted(&self) -> Option<CertificateBundle> {
        let dir = &self.config.cert_dir;
        let files = match certfiles::read_pem_files(dir) {
            Ok(Some(files)) => files,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "Cannot read persisted certificate");
                return None;
            }
        };

        let now = self.clock.now();
        let bundle = match CertificateBundle::from_pem_at(
            &files.cert_pem,
            &files.key_pem,
            &files.ca_pem,
            now,
        ) {
            Ok(bundle) => bundle,
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "Persisted certificate unusable");
                return None;
            }
        };

        if bundle.subject() != self.config.worker_id {
            tracing::warn!(
                path = %dir.display(),
                subject = %bundle.subject(),
                "Persisted certificate belongs to another worker"
            );
            return None;
        }
        if self.policy.should_renew_certificate(&bundle, now) {
            tracing::info!(path = %dir.display(), "Persisted certificate is due for renewal");
            return None;
        }
        Some(bundle)
    }

    /// Generate a key and CSR, submit with backoff and install the result.
    /// Callers hold `acquire_lock`.
    async fn acquire(
        &self,
        renewal: bool,
        scope: &CancellationToken,
    ) -> Result<Arc<CertificateBundle>, ManagerError> {
        let corr = correlation_id();
        let worker_id = self.config.worker_id.as_str();
        let had_bundle = self.current().is_some();
        if !had_bundle {
            self.set_state(ManagerState::AcquiringCertificate);
        }

        let mut request = match CertificateRequest::generate(
            worker_id,
            &self.config.subject_alt_names,
            self.clock.now(),
        ) {
            Ok(request) => request,
            Err(e) => {
                self.emit(
                    self.event(CertificateEventKind::CsrFailed, &corr)
                        .with("stage", AcquisitionStage::CsrGeneration)
                        .with("reason", &e),
                );
                self.after_failure(had_bundle);
                return Err(ManagerError::CertificateUnavailable {
                    stage: AcquisitionStage::CsrGeneration,
                    attempts: 0,
                    reason: e.to_string(),
                });
            }
        };
        self.emit(
            self.event(CertificateEventKind::CsrGenerated, &corr)
                .with("renewal", renewal),
        );

        let retry = self.config.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.emit(
                self.event(CertificateEventKind::CsrSubmitted, &corr)
                    .with("attempt", attempt),
            );

            let result = tokio::select! {
                _ = self.stopped(scope) => {
                    self.after_failure(had_bundle);
                    return Err(ManagerError::Cancelled);
                }
                result = self.signer.submit(worker_id, request.csr_pem()) => result,
            };

            match result {
                Ok(chain) => {
                    request.mark_signed();
                    let installed = self.install(request, chain, attempt, renewal, &corr);
                    if installed.is_err() {
                        self.after_failure(had_bundle);
                    }
                    return installed;
                }
                Err(SubmitError::Rejected(reason)) => {
                    request.mark_rejected();
                    self.emit(
                        self.event(CertificateEventKind::CsrFailed, &corr)
                            .with("attempt", attempt)
                            .with("reason", &reason)
                            .with("retrying", false),
                    );
                    self.after_failure(had_bundle);
                    return Err(ManagerError::CertificateUnavailable {
                        stage: AcquisitionStage::CaRejection,
                        attempts: attempt,
                        reason,
                    });
                }
                Err(SubmitError::Transient(reason)) => {
                    let retrying = retry.allows_retry(attempt);
                    self.emit(
                        self.event(CertificateEventKind::CsrFailed, &corr)
                            .with("attempt", attempt)
                            .with("reason", &reason)
                            .with("retrying", retrying),
                    );
                    if !retrying {
                        self.after_failure(had_bundle);
                        return Err(ManagerError::CertificateUnavailable {
                            stage: AcquisitionStage::Submission,
                            attempts: attempt,
                            reason,
                        });
                    }

                    let delay = retry.delay_for(attempt);
                    tracing::warn!(
                        worker_id,
                        attempt,
                        max_attempts = retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "CSR submission failed, retrying"
                    );
                    let interrupted = tokio::select! {
                        _ = self.stopped(scope) => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if interrupted {
                        self.after_failure(had_bundle);
                        return Err(ManagerError::Cancelled);
                    }
                }
            }
        }
    }

    fn install(
        &self,
        request: CertificateRequest,
        chain: IssuedChain,
        attempts: u32,
        renewal: bool,
        corr: &str,
    ) -> Result<Arc<CertificateBundle>, ManagerError> {
        let worker_id = self.config.worker_id.clone();
        let bundle = request
            .into_bundle(&chain.certificate_pem, &chain.ca_pem, self.clock.now())
            .map_err(|e| e.to_string())
            .and_then(|bundle| {
                if bundle.subject() == worker_id {
                    Ok(bundle)
                } else {
                    Err(format!(
                        "issued subject '{}' does not match worker '{worker_id}'",
                        bundle.subject()
                    ))
                }
            });

        let bundle = match bundle {
            Ok(bundle) => Arc::new(bundle),
            Err(reason) => {
                self.emit(
                    self.event(CertificateEventKind::CertValidationFailed, corr)
                        .with("stage", AcquisitionStage::Validation)
                        .with("reason", &reason),
                );
                return Err(ManagerError::CertificateUnavailable {
                    stage: AcquisitionStage::Validation,
                    attempts,
                    reason,
                });
            }
        };

        if let Err(e) = certfiles::write_bundle_to(&self.config.cert_dir, &bundle) {
            tracing::error!(
                worker_id = %worker_id,
                path = %self.config.cert_dir.display(),
                error = %e,
                "Failed to persist certificate, continuing with in-memory copy"
            );
        }

        self.bundle_tx.send_replace(Some(bundle.clone()));
        self.set_state(ManagerState::Valid);

        let kind = if renewal {
            CertificateEventKind::CertRenewed
        } else {
            CertificateEventKind::CertIssued
        };
        self.emit(
            self.event(kind, corr)
                .with("attempts", attempts)
                .with("fingerprint", bundle.fingerprint())
                .with("not_after", bundle.not_after().to_rfc3339()),
        );
        Ok(bundle)
    }

    fn after_failure(&self, had_bundle: bool) {
        if !had_bundle {
            self.set_state(ManagerState::Uninitialized);
        }
    }

    fn set_state(&self, state: ManagerState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(worker_id = %self.config.worker_id, from = ?current, to = ?state, "Certificate state changed");
            *current = state;
            true
        });
    }

    fn event(&self, kind: CertificateEventKind, corr: &str) -> CertificateEvent {
        CertificateEvent::new(kind, &self.config.worker_id, corr, self.clock.now())
    }

    fn emit(&self, event: CertificateEvent) {
        self.observer.on_event(&event);
    }
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("worker_id", &self.config.worker_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{throwaway_ca, LocalSigner, RecordingObserver};
    use tessera_common::clock::ManualClock;
    use tessera_common::test::temp_dir;

    struct Fixture {
        manager: Arc<CertificateManager>,
        signer: Arc<LocalSigner>,
        observer: Arc<RecordingObserver>,
    }

    fn fixture_with(signer: LocalSigner, retry: RetryPolicy) -> Fixture {
        let signer = Arc::new(signer);
        let observer = Arc::new(RecordingObserver::default());
        let mut config = CertificateManagerConfig::new("w1", temp_dir("tessera-certs"));
        config.retry = retry;
        let manager = CertificateManager::new(config, signer.clone())
            .with_observer(observer.clone());
        Fixture {
            manager: Arc::new(manager),
            signer,
            observer,
        }
    }

    fn fixture(validity_days: i64) -> Fixture {
        fixture_with(LocalSigner::new(throwaway_ca(validity_days)), RetryPolicy::default())
    }

    fn single_attempt() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 1)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_follow_backoff_schedule() {
        let f = fixture_with(
            LocalSigner::new(throwaway_ca(90)).failing_first(2),
            RetryPolicy::default(),
        );

        let started = tokio::time::Instant::now();
        let bundle = f.manager.ensure_certificate().await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(bundle.subject(), "w1");
        assert_eq!(f.signer.attempts(), 3);
        // 1s after the first failure, 2s after the second.
        assert!(elapsed >= Duration::from_secs(3), "elapsed = {elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "elapsed = {elapsed:?}");
        assert_eq!(f.manager.state(), ManagerState::Valid);

        assert_eq!(f.observer.count(CertificateEventKind::CsrGenerated), 1);
        assert_eq!(f.observer.count(CertificateEventKind::CsrSubmitted), 3);
        assert_eq!(f.observer.count(CertificateEventKind::CsrFailed), 2);
        assert_eq!(f.observer.kinds().last(), Some(&CertificateEventKind::CertIssued));

        let events = f.observer.events();
        let corr = &events[0].correlation_id;
        assert!(events.iter().all(|e| &e.correlation_id == corr));
    }

    #[tokio::test]
    async fn ensure_is_idempotent_for_valid_bundle() {
        let f = fixture(90);

        let first = f.manager.ensure_certificate().await.unwrap();
        let second = f.manager.ensure_certificate().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.signer.attempts(), 1);
    }

    #[tokio::test]
    async fn issued_bundle_is_persisted_with_private_key() {
        let f = fixture(90);
        let bundle = f.manager.ensure_certificate().await.unwrap();

        let dir = &f.manager.config.cert_dir;
        let files = certfiles::read_pem_files(dir).unwrap().unwrap();
        assert_eq!(files.cert_pem, bundle.cert_pem());
        assert!(dir.join(certfiles::FULLCHAIN_FILENAME).exists());
    }

    #[tokio::test]
    async fn rejection_fails_without_retry() {
        let f = fixture(90);
        f.signer.set_rejection(Some("worker not allowed"));

        let err = f.manager.ensure_certificate().await.unwrap_err();

        assert_eq!(err.stage(), Some(AcquisitionStage::CaRejection));
        assert_eq!(f.signer.attempts(), 1);
        assert_eq!(f.manager.state(), ManagerState::Uninitialized);
        assert!(f.manager.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_unavailable() {
        let f = fixture_with(
            LocalSigner::new(throwaway_ca(90)),
            RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 3),
        );
        f.signer.set_unavailable(true);

        let err = f.manager.ensure_certificate().await.unwrap_err();

        match err {
            ManagerError::CertificateUnavailable { stage, attempts, .. } => {
                assert_eq!(stage, AcquisitionStage::Submission);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(f.signer.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_backoff_sleep() {
        let cancel = CancellationToken::new();
        let signer = Arc::new(LocalSigner::new(throwaway_ca(90)));
        signer.set_unavailable(true);
        let manager = Arc::new(
            CertificateManager::new(
                CertificateManagerConfig::new("w1", temp_dir("tessera-certs")),
                signer.clone(),
            )
            .with_cancel(cancel.clone()),
        );

        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.ensure_certificate().await }
        });
        // Inside the 1s backoff after the first failure.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let started = tokio::time::Instant::now();
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ManagerError::Cancelled)), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(signer.attempts(), 1);
    }

    #[tokio::test]
    async fn healthy_bundle_needs_nothing() {
        let f = fixture(90);
        f.manager.ensure_certificate().await.unwrap();
        let before = f.observer.events().len();

        assert_eq!(f.manager.check_renewal().await, RenewalOutcome::Healthy);
        assert_eq!(f.observer.events().len(), before);
        assert_eq!(f.signer.attempts(), 1);
    }

    #[tokio::test]
    async fn warning_window_emits_expiring_soon_without_renewing() {
        let f = fixture(20);
        f.manager.ensure_certificate().await.unwrap();

        assert_eq!(f.manager.check_renewal().await, RenewalOutcome::ExpiringSoon);
        assert_eq!(f.observer.count(CertificateEventKind::CertExpiringSoon), 1);
        assert_eq!(f.signer.attempts(), 1);
    }

    #[tokio::test]
    async fn five_days_left_triggers_renewal_and_swap() {
        let f = fixture(5);
        let original = f.manager.ensure_certificate().await.unwrap();
        assert!(original.days_until_expiration() < 7);
        let mut rx = f.manager.subscribe();
        rx.mark_unchanged();

        assert_eq!(f.manager.check_renewal().await, RenewalOutcome::Renewed);

        let renewed = f.manager.current().unwrap();
        assert!(!Arc::ptr_eq(&original, &renewed));
        assert_ne!(original.fingerprint(), renewed.fingerprint());
        assert!(rx.has_changed().unwrap());
        assert_eq!(f.observer.count(CertificateEventKind::CertExpiringSoon), 1);
        assert_eq!(f.observer.count(CertificateEventKind::CertRenewed), 1);
        assert_eq!(f.manager.state(), ManagerState::Valid);
    }

    #[tokio::test]
    async fn failed_renewal_keeps_current_bundle() {
        let f = fixture_with(LocalSigner::new(throwaway_ca(5)), single_attempt());
        let original = f.manager.ensure_certificate().await.unwrap();
        f.signer.set_unavailable(true);

        assert_eq!(f.manager.check_renewal().await, RenewalOutcome::RenewalFailed);

        let current = f.manager.current().unwrap();
        assert!(Arc::ptr_eq(&original, &current));
        assert_eq!(f.observer.count(CertificateEventKind::CertValidationFailed), 1);
        assert_eq!(f.manager.state(), ManagerState::RenewalDue);
    }

    #[tokio::test]
    async fn expiry_without_renewal_is_reported_not_fatal() {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let signer = Arc::new(LocalSigner::new(throwaway_ca(90)));
        let observer = Arc::new(RecordingObserver::default());
        let mut config = CertificateManagerConfig::new("w1", temp_dir("tessera-certs"));
        config.retry = single_attempt();
        let manager = CertificateManager::new(config, signer.clone())
            .with_observer(observer.clone())
            .with_clock(clock.clone());

        manager.ensure_certificate().await.unwrap();
        clock.advance(chrono::Duration::days(91));
        signer.set_unavailable(true);

        assert_eq!(manager.check_renewal().await, RenewalOutcome::Expired);
        assert_eq!(observer.count(CertificateEventKind::CertExpired), 1);
        assert_eq!(manager.state(), ManagerState::Expired);
        assert!(manager.current().is_some());
    }

    #[tokio::test]
    async fn persisted_bundle_is_reused_without_csr() {
        let ca = throwaway_ca(90);
        let dir = temp_dir("tessera-certs");

        let first_signer = Arc::new(LocalSigner::new(ca));
        let first = CertificateManager::new(
            CertificateManagerConfig::new("w1", &dir),
            first_signer.clone(),
        );
        let issued = first.ensure_certificate().await.unwrap();

        let second_signer = Arc::new(LocalSigner::new(throwaway_ca(90)));
        let second = CertificateManager::new(
            CertificateManagerConfig::new("w1", &dir),
            second_signer.clone(),
        );
        let reused = second.ensure_certificate().await.unwrap();

        assert_eq!(reused.fingerprint(), issued.fingerprint());
        assert_eq!(second_signer.attempts(), 0);
        assert_eq!(second.state(), ManagerState::Valid);
    }

    #[tokio::test]
    async fn persisted_bundle_of_other_worker_is_ignored() {
        let dir = temp_dir("tessera-certs");
        let other = CertificateManager::new(
            CertificateManagerConfig::new("w2", &dir),
            Arc::new(LocalSigner::new(throwaway_ca(90))),
        );
        other.ensure_certificate().await.unwrap();

        let signer = Arc::new(LocalSigner::new(throwaway_ca(90)));
        let manager =
            CertificateManager::new(CertificateManagerConfig::new("w1", &dir), signer.clone());
        let bundle = manager.ensure_certificate().await.unwrap();

        assert_eq!(bundle.subject(), "w1");
        assert_eq!(signer.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_loop_renews_on_next_tick_and_stops_on_cancel() {
        let f = fixture(5);
        f.manager.ensure_certificate().await.unwrap();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(f.manager.clone().run_renewal_loop(cancel.clone()));
        tokio::time::sleep(RENEWAL_CHECK_INTERVAL + Duration::from_secs(1)).await;

        assert_eq!(f.observer.count(CertificateEventKind::CertRenewed), 1);
        assert_eq!(f.signer.attempts(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_the_loop_interrupts_renewal_backoff() {
        let f = fixture_with(
            LocalSigner::new(throwaway_ca(5)),
            RetryPolicy::new(Duration::from_secs(600), Duration::from_secs(600), 5),
        );
        let original = f.manager.ensure_certificate().await.unwrap();
        f.signer.set_unavailable(true);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(f.manager.clone().run_renewal_loop(cancel.clone()));
        tokio::time::sleep(RENEWAL_CHECK_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(f.signer.attempts(), 2, "renewal attempt is now backing off");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop stops without waiting out the backoff")
            .unwrap();

        assert_eq!(f.signer.attempts(), 2);
        assert!(Arc::ptr_eq(&f.manager.current().unwrap(), &original));
    }
}
