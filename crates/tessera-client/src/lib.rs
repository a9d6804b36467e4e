//! mTLS client for the worker's controller session.
//!
//! Holds no connection until first use. The pooled `reqwest` client is
//! built from the current certificate bundle and rebuilt whenever the
//! bundle's fingerprint changes, so no request ever goes out with a
//! certificate that has since been renewed. Server verification is always
//! on; there is no insecure mode.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use tessera_common::backoff::{sleep_or_cancel, RetryPolicy};
use tessera_common::types::{
    HeartbeatDirective, HeartbeatRecord, HeartbeatResponse, RegisterResponse, RegistrationStatus,
    WorkerRegistration, WorkerStatus, DEFAULT_HEARTBEAT_INTERVAL_SECS,
};
use tessera_pki::{CertificateBundle, TlsError};

/// TCP connection timeout for controller requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Overall timeout for one controller request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive heartbeat failures before reporting `Degraded`.
pub const DEFAULT_DEGRADED_AFTER: u32 = 3;

// ── Error types ───────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Controller not reachable: {0}")]
    Transient(String),

    #[error("Controller rejected the request ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("No certificate available for mTLS")]
    NoCertificate,

    #[error("Controller client is closed")]
    Closed,

    #[error("Operation cancelled")]
    Cancelled,
}

impl ClientError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

// ── Configuration ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ControllerClientConfig {
    /// Base URL, e.g. `https://controller.internal:9443`. Must be https.
    pub controller_url: String,
    /// Takes precedence over the interval the controller supplies.
    pub heartbeat_interval: Option<Duration>,
    pub degraded_after: u32,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ControllerClientConfig {
    pub fn new(controller_url: impl Into<String>) -> Self {
        Self {
            controller_url: controller_url.into(),
            heartbeat_interval: None,
            degraded_after: DEFAULT_DEGRADED_AFTER,
            connect_timeout: CONNECT_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// Interval the heartbeat loop will use from now on.
    pub heartbeat_interval: Duration,
}

/// Current load in `[0, 1]`, sampled once per heartbeat.
pub type LoadProbe = Arc<dyn Fn() -> f64 + Send + Sync>;

// ── Client ────────────────────────────────────────────────────────

struct Pooled {
    client: reqwest::Client,
    fingerprint: String,
}

pub struct ControllerClient {
    config: ControllerClientConfig,
    endpoint: String,
    bundle_rx: watch::Receiver<Option<Arc<CertificateBundle>>>,
    cancel: CancellationToken,
    pool: Mutex<Option<Pooled>>,
    connections_created: AtomicU64,
    closed: AtomicBool,
    registration: Mutex<Option<WorkerRegistration>>,
    registered: AtomicBool,
    heartbeat_interval_ms: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl ControllerClient {
    pub fn new(
        config: ControllerClientConfig,
        bundle_rx: watch::Receiver<Option<Arc<CertificateBundle>>>,
    ) -> Self {
        let interval = config
            .heartbeat_interval
            .unwrap_or(Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS));
        Self {
            endpoint: config.controller_url.trim_end_matches('/').to_string(),
            config,
            bundle_rx,
            cancel: CancellationToken::new(),
            pool: Mutex::new(None),
            connections_created: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            registration: Mutex::new(None),
            registered: AtomicBool::new(false),
            heartbeat_interval_ms: AtomicU64::new(interval.as_millis() as u64),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Token that interrupts registration backoff.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.load(Ordering::SeqCst))
    }

    /// Status the next heartbeat will report.
    pub fn status(&self) -> WorkerStatus {
        if self.consecutive_failures.load(Ordering::SeqCst) >= self.config.degraded_after {
            WorkerStatus::Degraded
        } else {
            WorkerStatus::Healthy
        }
    }

    /// How many times the pooled HTTP client has been built.
    pub fn connections_created(&self) -> u64 {
        self.connections_created.load(Ordering::SeqCst)
    }

    pub fn has_pooled_connection(&self) -> bool {
        self.lock_pool().is_some()
    }

    /// Drop the pooled client; the next call rebuilds it.
    pub fn invalidate(&self) {
        if self.lock_pool().take().is_some() {
            tracing::debug!("Controller connection pool invalidated");
        }
    }

    /// Release the pooled connection. Terminal and idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Controller client already closed");
            return;
        }
        self.lock_pool().take();
        self.registered.store(false, Ordering::SeqCst);
        tracing::info!(endpoint = %self.endpoint, "Controller connection closed");
    }

    // ── Session operations ────────────────────────────────────────

    /// Register with the controller, retrying transport failures.
    ///
    /// A definitive refusal is returned as [`ClientError::Rejected`] after a
    /// single attempt. The registration is kept and re-sent by the heartbeat
    /// loop whenever the session has to be re-established.
    pub async fn register(&self, registration: &WorkerRegistration) -> Result<Accepted> {
        *self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(registration.clone());

        let retry = self.config.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_register(registration).await {
                Ok(accepted) => {
                    tracing::info!(
                        worker_id = %registration.worker_id,
                        attempt,
                        heartbeat_secs = accepted.heartbeat_interval.as_secs(),
                        "Registered with controller"
                    );
                    return Ok(accepted);
                }
                Err(e) if e.is_transient() && retry.allows_retry(attempt) => {
                    let delay = retry.delay_for(attempt);
                    tracing::warn!(
                        worker_id = %registration.worker_id,
                        attempt,
                        max_attempts = retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Registration failed, retrying"
                    );
                    sleep_or_cancel(delay, &self.cancel)
                        .await
                        .map_err(|_| ClientError::Cancelled)?;
                }
                Err(e) => {
                    tracing::error!(worker_id = %registration.worker_id, attempt, error = %e, "Registration failed");
                    return Err(e);
                }
            }
        }
    }

    /// One heartbeat. Does not retry.
    pub async fn send_heartbeat(&self, record: &HeartbeatRecord) -> Result<HeartbeatDirective> {
        let client = self.http()?;
        let url = format!("{}/api/workers/heartbeat", self.endpoint);
        let resp = client
            .post(&url)
            .json(record)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;
        let body: HeartbeatResponse = resp
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        Ok(body.status)
    }

    /// `DELETE /api/workers/{worker_id}`. A 404 counts as success.
    pub async fn deregister(&self, worker_id: &str) -> Result<()> {
        let client = self.http()?;
        let url = format!("{}/api/workers/{worker_id}", self.endpoint);
        let resp = client.delete(&url).send().await.map_err(transport_error)?;
        self.registered.store(false, Ordering::SeqCst);
        if resp.status() == StatusCode::NOT_FOUND {
            tracing::debug!(worker_id, "Controller had no registration to remove");
            return Ok(());
        }
        check_status(resp).await?;
        tracing::info!(worker_id, "Deregistered from controller");
        Ok(())
    }

    /// Send heartbeats until `cancel` fires or the client is closed.
    ///
    /// Failures are logged and retried on the next tick. After
    /// `degraded_after` consecutive failures the worker reports itself
    /// `Degraded`. The stored registration is re-sent when the controller
    /// evicts the worker, when contact resumes after a degraded spell, and
    /// when the worker was never registered.
    pub async fn run_heartbeat_loop(
        self: Arc<Self>,
        worker_id: String,
        load: LoadProbe,
        cancel: CancellationToken,
    ) {
        let mut bundle_rx = self.bundle_rx.clone();
        let mut watching = true;
        let mut next_beat = tokio::time::Instant::now() + self.heartbeat_interval();

        tracing::debug!(worker_id = %worker_id, interval_secs = self.heartbeat_interval().as_secs(), "Heartbeat loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = bundle_rx.changed(), if watching => {
                    match changed {
                        Ok(()) => {
                            tracing::info!(worker_id = %worker_id, "Certificate changed, invalidating controller connections");
                            self.invalidate();
                        }
                        Err(_) => watching = false,
                    }
                    continue;
                }
                _ = tokio::time::sleep_until(next_beat) => {}
            }

            if self.is_closed() {
                break;
            }
            self.beat(&worker_id, &load).await;
            next_beat = tokio::time::Instant::now() + self.heartbeat_interval();
        }
        tracing::debug!(worker_id = %worker_id, "Heartbeat loop stopped");
    }

    async fn beat(&self, worker_id: &str, load: &LoadProbe) {
        let status = self.status();
        let record = HeartbeatRecord {
            worker_id: worker_id.to_string(),
            timestamp: Utc::now(),
            load_score: load().clamp(0.0, 1.0),
            status,
        };

        let result = match self.ensure_registered().await {
            Ok(()) => self.send_heartbeat(&record).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(directive) => {
                let failures = self.consecutive_failures.swap(0, Ordering::SeqCst);
                if failures > 0 {
                    tracing::info!(worker_id, failures, "Controller contact restored");
                }
                let recovered = status == WorkerStatus::Degraded;
                if directive == HeartbeatDirective::Evict || recovered {
                    if directive == HeartbeatDirective::Evict {
                        tracing::warn!(worker_id, "Controller evicted this worker, re-registering");
                    }
                    self.registered.store(false, Ordering::SeqCst);
                    if let Err(e) = self.ensure_registered().await {
                        tracing::warn!(worker_id, error = %e, "Re-registration failed, will retry next heartbeat");
                    }
                }
            }
            Err(ClientError::Closed) => {}
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures == self.config.degraded_after {
                    tracing::warn!(worker_id, failures, error = %e, "Controller unreachable, reporting degraded");
                } else {
                    tracing::warn!(worker_id, failures, error = %e, "Heartbeat failed");
                }
            }
        }
    }

    /// Re-send the stored registration once if the session is not live.
    async fn ensure_registered(&self) -> Result<()> {
        if self.is_registered() {
            return Ok(());
        }
        let stored = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(registration) = stored else {
            return Ok(());
        };
        self.try_register(&registration).await?;
        tracing::info!(worker_id = %registration.worker_id, "Re-registered with controller");
        Ok(())
    }

    async fn try_register(&self, registration: &WorkerRegistration) -> Result<Accepted> {
        let client = self.http()?;
        let url = format!("{}/api/workers/register", self.endpoint);
        let resp = client
            .post(&url)
            .json(registration)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        let resp = check_status(resp).await?;
        let body: RegisterResponse = resp
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;

        if body.status == RegistrationStatus::Rejected {
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                reason: body.reason.unwrap_or_else(|| "registration rejected".into()),
            });
        }

        if self.config.heartbeat_interval.is_none() {
            if let Some(secs) = body.heartbeat_interval_seconds.filter(|s| *s > 0) {
                self.heartbeat_interval_ms
                    .store(secs.saturating_mul(1000), Ordering::SeqCst);
            }
        }
        self.registered.store(true, Ordering::SeqCst);
        Ok(Accepted {
            heartbeat_interval: self.heartbeat_interval(),
        })
    }

    // ── Connection pool ───────────────────────────────────────────

    /// The pooled client for the current bundle, built on first use.
    fn http(&self) -> Result<reqwest::Client> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let bundle = self
            .bundle_rx
            .borrow()
            .clone()
            .ok_or(ClientError::NoCertificate)?;

        let mut pool = self.lock_pool();
        if let Some(pooled) = pool.as_ref() {
            if pooled.fingerprint == bundle.fingerprint() {
                return Ok(pooled.client.clone());
            }
            tracing::info!(
                old = %short(&pooled.fingerprint),
                new = %short(bundle.fingerprint()),
                "Certificate renewed, rebuilding controller connection pool"
            );
        }

        let client = self.build_client(&bundle)?;
        self.connections_created.fetch_add(1, Ordering::SeqCst);
        *pool = Some(Pooled {
            client: client.clone(),
            fingerprint: bundle.fingerprint().to_string(),
        });
        Ok(client)
    }

    fn build_client(&self, bundle: &CertificateBundle) -> Result<reqwest::Client> {
        let tls = bundle.to_tls_config();
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .https_only(true)
            .tls_built_in_root_certs(false)
            .add_root_certificate(tls.reqwest_root()?)
            .identity(tls.reqwest_identity()?)
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .build()
            .map_err(|e| ClientError::Tls(TlsError::Client(e.to_string())))?;
        tracing::debug!(endpoint = %self.endpoint, certificate = %bundle.describe(), "Controller connection pool created");
        Ok(client)
    }

    fn lock_pool(&self) -> std::sync::MutexGuard<'_, Option<Pooled>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ControllerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerClient")
            .field("endpoint", &self.endpoint)
            .field("registered", &self.is_registered())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ── Helpers ───────────────────────────────────────────────────────

fn transport_error(e: reqwest::Error) -> ClientError {
    ClientError::Transient(e.to_string())
}

/// 5xx and 429 are transient; any other non-success status is a refusal.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ClientError::Transient(format!("controller returned {status}")));
    }
    let body = resp.text().await.unwrap_or_default();
    let reason = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("reason")
                .or_else(|| v.get("message"))
                .and_then(|r| r.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| status.to_string());
    Err(ClientError::Rejected {
        status: status.as_u16(),
        reason,
    })
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..16).unwrap_or(fingerprint)
}
