//! Wire types for the worker/controller session.
//!
//! The controller's view of a worker is external state: these shapes are
//! written to it and its replies are read, nothing more.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Heartbeat interval used when the controller does not supply one.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// A worker's registration with its controller.
///
/// Built once at startup, after a valid certificate exists, and re-sent
/// verbatim whenever the session has to be re-established.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub service_type: String,
    pub endpoint_url: String,
    pub health_url: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerRegistration {
    pub fn new(
        worker_id: impl Into<String>,
        service_type: impl Into<String>,
        endpoint_url: impl Into<String>,
        health_url: impl Into<String>,
        capabilities: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            service_type: service_type.into(),
            endpoint_url: endpoint_url.into(),
            health_url: health_url.into(),
            capabilities: capabilities.into_iter().collect(),
            registered_at: Utc::now(),
        }
    }
}

/// Self-reported worker health carried in each heartbeat.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    #[default]
    Healthy,
    Degraded,
}

/// One periodic liveness signal. Never persisted by the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatRecord {
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub load_score: f64,
    pub status: WorkerStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Registered,
    Rejected,
}

/// Controller reply to `POST /api/workers/register`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterResponse {
    pub status: RegistrationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// What the controller wants the worker to do after a heartbeat.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatDirective {
    Ok,
    Evict,
}

/// Controller reply to `POST /api/workers/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatResponse {
    pub status: HeartbeatDirective,
}
