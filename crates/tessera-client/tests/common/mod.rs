//! In-process controller served over mTLS.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;

use tessera_common::types::{
    HeartbeatDirective, HeartbeatRecord, HeartbeatResponse, RegisterResponse, RegistrationStatus,
    WorkerRegistration,
};
use tessera_pki::{CertificateAuthorityManager, CertificateBundle, TlsConfig};

#[derive(Default)]
pub struct Controller {
    pub registrations: Mutex<Vec<WorkerRegistration>>,
    pub register_attempts: AtomicU32,
    pub heartbeats: Mutex<Vec<HeartbeatRecord>>,
    pub deletions: Mutex<Vec<String>>,
    pub reject_registration: AtomicBool,
    pub fail_heartbeats: AtomicU32,
    pub evict_next: AtomicBool,
    pub heartbeat_interval_seconds: Option<u64>,
    /// Arrival time of each accepted registration and heartbeat.
    pub registered_at: Mutex<Vec<Instant>>,
    pub heartbeat_at: Mutex<Vec<Instant>>,
}

impl Controller {
    pub fn registrations(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }

    pub fn heartbeats(&self) -> Vec<HeartbeatRecord> {
        self.heartbeats.lock().unwrap().clone()
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

fn router(state: Arc<Controller>) -> Router {
    Router::new()
        .route("/api/workers/register", post(register))
        .route("/api/workers/heartbeat", post(heartbeat))
        .route("/api/workers/{id}", delete(deregister))
        .with_state(state)
}

async fn register(
    State(state): State<Arc<Controller>>,
    Json(reg): Json<WorkerRegistration>,
) -> impl IntoResponse {
    state.register_attempts.fetch_add(1, Ordering::SeqCst);
    if state.reject_registration.load(Ordering::SeqCst) {
        return (
            StatusCode::FORBIDDEN,
            Json(RegisterResponse {
                status: RegistrationStatus::Rejected,
                heartbeat_interval_seconds: None,
                reason: Some("service type not allowed".into()),
            }),
        );
    }
    state.registrations.lock().unwrap().push(reg);
    state.registered_at.lock().unwrap().push(Instant::now());
    (
        StatusCode::OK,
        Json(RegisterResponse {
            status: RegistrationStatus::Registered,
            heartbeat_interval_seconds: state.heartbeat_interval_seconds,
            reason: None,
        }),
    )
}

async fn heartbeat(
    State(state): State<Arc<Controller>>,
    Json(record): Json<HeartbeatRecord>,
) -> axum::response::Response {
    let failing = state
        .fail_heartbeats
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    state.heartbeats.lock().unwrap().push(record);
    state.heartbeat_at.lock().unwrap().push(Instant::now());
    let status = if state.evict_next.swap(false, Ordering::SeqCst) {
        HeartbeatDirective::Evict
    } else {
        HeartbeatDirective::Ok
    };
    Json(HeartbeatResponse { status }).into_response()
}

async fn deregister(State(state): State<Arc<Controller>>, Path(id): Path<String>) -> StatusCode {
    state.deletions.lock().unwrap().push(id);
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

/// Serve the stub on 127.0.0.1 with a server certificate from `ca`,
/// requiring client certificates from the same root.
pub async fn spawn(ca: &CertificateAuthorityManager, state: Controller) -> Stub {
    let issued = ca
        .issue_server_certificate(&["127.0.0.1".to_string()])
        .unwrap();
    let tls = TlsConfig::new(issued.fullchain_pem(), issued.key_pem.clone(), issued.ca_pem.clone());
    let config = RustlsConfig::from_config(Arc::new(tls.server_config().unwrap()));

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let state = Arc::new(state);
    let handle = axum_server::Handle::new();
    let server = axum_server::from_tcp_rustls(listener, config)
        .handle(handle.clone())
        .serve(router(state.clone()).into_make_service());
    tokio::spawn(async move {
        let _ = server.await;
    });

    Stub {
        url: format!("https://{addr}"),
        state,
        handle,
    }
}

pub fn worker_bundle(ca: &CertificateAuthorityManager, worker_id: &str) -> Arc<CertificateBundle> {
    let (cert, key) = tessera_pki::testing::issue_worker_pem(ca, worker_id);
    Arc::new(CertificateBundle::from_pem(&cert, &key, ca.ca_pem()).unwrap())
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
