//! Certificate lifecycle events.
//!
//! The manager emits these to an injected [`CertificateEventObserver`].
//! Sinks shipped here: structured tracing and an append-only audit file.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertificateEventKind {
    CsrGenerated,
    CsrSubmitted,
    CsrFailed,
    CertIssued,
    CertRenewed,
    CertExpiringSoon,
    CertExpired,
    CertValidationFailed,
}

impl CertificateEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CsrGenerated => "CSR_GENERATED",
            Self::CsrSubmitted => "CSR_SUBMITTED",
            Self::CsrFailed => "CSR_FAILED",
            Self::CertIssued => "CERT_ISSUED",
            Self::CertRenewed => "CERT_RENEWED",
            Self::CertExpiringSoon => "CERT_EXPIRING_SOON",
            Self::CertExpired => "CERT_EXPIRED",
            Self::CertValidationFailed => "CERT_VALIDATION_FAILED",
        }
    }
}

impl fmt::Display for CertificateEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CertificateEvent {
    pub kind: CertificateEventKind,
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub metadata: BTreeMap<String, String>,
}

impl CertificateEvent {
    pub fn new(
        kind: CertificateEventKind,
        worker_id: impl Into<String>,
        correlation_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            worker_id: worker_id.into(),
            timestamp,
            correlation_id: correlation_id.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

pub trait CertificateEventObserver: Send + Sync {
    fn on_event(&self, event: &CertificateEvent);
}

/// Logs every event through `tracing`, at a level matching its severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl CertificateEventObserver for TracingObserver {
    fn on_event(&self, event: &CertificateEvent) {
        let metadata = format_metadata(&event.metadata);
        match event.kind {
            CertificateEventKind::CertValidationFailed | CertificateEventKind::CertExpired => {
                tracing::error!(
                    event = %event.kind,
                    worker_id = %event.worker_id,
                    correlation_id = %event.correlation_id,
                    %metadata,
                    "Certificate lifecycle event"
                );
            }
            CertificateEventKind::CsrFailed | CertificateEventKind::CertExpiringSoon => {
                tracing::warn!(
                    event = %event.kind,
                    worker_id = %event.worker_id,
                    correlation_id = %event.correlation_id,
                    %metadata,
                    "Certificate lifecycle event"
                );
            }
            _ => {
                tracing::info!(
                    event = %event.kind,
                    worker_id = %event.worker_id,
                    correlation_id = %event.correlation_id,
                    %metadata,
                    "Certificate lifecycle event"
                );
            }
        }
    }
}

/// Appends one line per event to a human-readable audit file.
///
/// Format: `2026-02-11T10:30:00Z | CERT_ISSUED | worker_id=w1 | correlation_id=... | not_after=...`
#[derive(Debug, Clone)]
pub struct AuditLogObserver {
    path: PathBuf,
}

impl AuditLogObserver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CertificateEventObserver for AuditLogObserver {
    fn on_event(&self, event: &CertificateEvent) {
        if let Err(e) = append_entry_to(&self.path, event) {
            tracing::warn!(error = %e, path = %self.path.display(), "Audit log write failed");
        }
    }
}

fn append_entry_to(path: &Path, event: &CertificateEvent) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let timestamp = event.timestamp.format("%Y-%m-%dT%H:%M:%SZ");
    let mut line = format!(
        "{timestamp} | {} | worker_id={} | correlation_id={}",
        event.kind, event.worker_id, event.correlation_id
    );
    for (key, value) in &event.metadata {
        line.push_str(&format!(" | {key}={value}"));
    }
    line.push('\n');

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Forwards each event to every inner observer, in order.
#[derive(Default, Clone)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn CertificateEventObserver>>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn CertificateEventObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl CertificateEventObserver for CompositeObserver {
    fn on_event(&self, event: &CertificateEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}

fn format_metadata(metadata: &BTreeMap<String, String>) -> String {
    metadata
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}
