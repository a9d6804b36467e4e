//! Business-logic seam.
//!
//! The lifecycle core knows nothing about what a worker does. It asks the
//! logic for its capabilities and load, starts it once the controller
//! session is up and collects its cleanup tasks.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use tessera_pki::CertificateBundle;

use crate::shutdown::{ShutdownTask, TaskError};

/// What the logic gets to see at startup.
#[derive(Clone)]
pub struct WorkerContext {
    pub worker_id: String,
    /// Current certificate; updated on every renewal.
    pub certificates: watch::Receiver<Option<Arc<CertificateBundle>>>,
    /// Fires when the worker begins shutting down.
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait WorkerLogic: Send + Sync {
    /// Advertised in the registration.
    fn capabilities(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Reported in each heartbeat, `0.0` idle to `1.0` saturated.
    fn load_score(&self) -> f64 {
        0.0
    }

    /// Called after registration. Long-running work should be spawned and
    /// watch `ctx.cancel`.
    async fn on_start(&self, _ctx: &WorkerContext) -> Result<(), TaskError> {
        Ok(())
    }

    /// Extra cleanup, run alongside the session teardown.
    fn shutdown_tasks(&self) -> Vec<ShutdownTask> {
        Vec::new()
    }
}

/// Logic for a worker that only maintains its identity and session.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogic;

impl WorkerLogic for NoopLogic {}
