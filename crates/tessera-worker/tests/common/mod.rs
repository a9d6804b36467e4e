//! Controller stub and worker wiring shared by the lifecycle tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;

use tessera_client::ControllerClient;
use tessera_common::backoff::RetryPolicy;
use tessera_common::test::temp_dir;
use tessera_common::types::{
    HeartbeatDirective, HeartbeatRecord, HeartbeatResponse, RegisterResponse, RegistrationStatus,
    WorkerRegistration,
};
use tessera_pki::testing::LocalSigner;
use tessera_pki::{CertificateAuthorityManager, CertificateManager, TlsConfig};
use tessera_worker::{WorkerConfig, WorkerLifecycleCoordinator, WorkerLogic};

#[derive(Default)]
pub struct Controller {
    pub registrations: Mutex<Vec<WorkerRegistration>>,
    pub heartbeats: Mutex<Vec<HeartbeatRecord>>,
    pub deletions: Mutex<Vec<String>>,
    pub reject_registration: AtomicBool,
    /// Accept DELETE but never answer it.
    pub hang_deregistration: AtomicBool,
    pub registered_at: Mutex<Vec<Instant>>,
    pub heartbeat_at: Mutex<Vec<Instant>>,
}

impl Controller {
    pub fn registrations(&self) -> Vec<WorkerRegistration> {
        self.registrations.lock().unwrap().clone()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.lock().unwrap().len()
    }

    pub fn deletions(&self) -> Vec<String> {
        self.deletions.lock().unwrap().clone()
    }

    /// Time from the first registration to the first heartbeat.
    pub fn first_heartbeat_gap(&self) -> Option<Duration> {
        let registered = *self.registered_at.lock().unwrap().first()?;
        let beat = *self.heartbeat_at.lock().unwrap().first()?;
        Some(beat.saturating_duration_since(registered))
    }
}

async fn register(
    State(state): State<Arc<Controller>>,
    Json(reg): Json<WorkerRegistration>,
) -> (StatusCode, Json<RegisterResponse>) {
    if state.reject_registration.load(Ordering::SeqCst) {
        return (
            StatusCode::FORBIDDEN,
            Json(RegisterResponse {
                status: RegistrationStatus::Rejected,
                heartbeat_interval_seconds: None,
                reason: Some("unknown service type".into()),
            }),
        );
    }
    state.registrations.lock().unwrap().push(reg);
    state.registered_at.lock().unwrap().push(Instant::now());
    (
        StatusCode::OK,
        Json(RegisterResponse {
            status: RegistrationStatus::Registered,
            heartbeat_interval_seconds: Some(30),
            reason: None,
        }),
    )
}

async fn heartbeat(
    State(state): State<Arc<Controller>>,
    Json(record): Json<HeartbeatRecord>,
) -> Json<HeartbeatResponse> {
    state.heartbeats.lock().unwrap().push(record);
    state.heartbeat_at.lock().unwrap().push(Instant::now());
    Json(HeartbeatResponse {
        status: HeartbeatDirective::Ok,
    })
}

async fn deregister(State(state): State<Arc<Controller>>, Path(id): Path<String>) -> StatusCode {
    state.deletions.lock().unwrap().push(id);
    if state.hang_deregistration.load(Ordering::SeqCst) {
        std::future::pending::<()>().await;
    }
    StatusCode::NO_CONTENT
}

pub struct Stub {
    pub url: String,
    pub state: Arc<Controller>,
    handle: axum_server::Handle,
}

impl Drop for Stub {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

pub async fn spawn_controller(ca: &CertificateAuthorityManager, state: Controller) -> Stub {
    let issued = ca
        .issue_server_certificate(&["127.0.0.1".to_string()])
        .unwrap();
    let tls = TlsConfig::new(issued.fullchain_pem(), issued.key_pem.clone(), issued.ca_pem.clone());
    let config = RustlsConfig::from_config(Arc::new(tls.server_config().unwrap()));

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let state = Arc::new(state);
    let app = Router::new()
        .route("/api/workers/register", post(register))
        .route("/api/workers/heartbeat", post(heartbeat))
        .route("/api/workers/{id}", delete(deregister))
        .with_state(state.clone());
    let handle = axum_server::Handle::new();
    let server = axum_server::from_tcp_rustls(listener, config)
        .handle(handle.clone())
        .serve(app.into_make_service());
    tokio::spawn(async move {
        let _ = server.await;
    });

    Stub {
        url: format!("https://{addr}"),
        state,
        handle,
    }
}

/// Config with short retries and a fast heartbeat.
pub fn worker_config(worker_id: &str, controller_url: &str) -> WorkerConfig {
    let mut config = WorkerConfig::new(
        worker_id,
        "streaming",
        temp_dir("tessera-worker-certs"),
        "https://127.0.0.1:1",
        controller_url,
    )
    .with_endpoint("https://127.0.0.1:8443");
    let quick = RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(20), 2);
    config.certificates.retry = quick;
    config.controller.retry = quick;
    config.controller.heartbeat_interval = Some(Duration::from_millis(100));
    config.shutdown_ceiling = Duration::from_secs(5);
    config
}

/// Coordinator whose certificates come from `signer`.
pub fn coordinator(
    config: WorkerConfig,
    signer: Arc<LocalSigner>,
    logic: Arc<dyn WorkerLogic>,
) -> WorkerLifecycleCoordinator {
    let certificates = Arc::new(CertificateManager::new(config.certificates.clone(), signer));
    let controller = Arc::new(ControllerClient::new(
        config.controller.clone(),
        certificates.subscribe(),
    ));
    WorkerLifecycleCoordinator::new(config, certificates, controller, logic)
}

pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}
