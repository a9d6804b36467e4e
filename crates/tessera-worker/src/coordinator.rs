//! Startup ordering and shutdown for one worker process.
//!
//! Startup is strictly: certificate, renewal loop, registration, heartbeat
//! loop, business logic. A worker never registers without identity. On the
//! shutdown signal every background loop is cancelled and the registered
//! shutdown tasks run within the configured ceiling.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tessera_client::{ClientError, ControllerClient, LoadProbe};
use tessera_pki::events::{CertificateEventObserver, TracingObserver};
use tessera_pki::{CertificateManager, CertificateSigner, HttpCaClient};

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::logic::{WorkerContext, WorkerLogic};
use crate::shutdown::{ShutdownHandler, ShutdownReport, ShutdownTask, TaskError};

pub const STOP_HEARTBEAT_TASK: &str = "stop_heartbeat";
pub const DEREGISTER_TASK: &str = "deregister";
pub const CLOSE_CONTROLLER_TASK: &str = "close_controller";
pub const STOP_RENEWAL_TASK: &str = "stop_renewal";

/// Slack between the deregistration limit and its task timeout.
const DEREGISTER_TASK_MARGIN: Duration = Duration::from_secs(1);

pub struct WorkerLifecycleCoordinator {
    config: WorkerConfig,
    certificates: Arc<CertificateManager>,
    controller: Arc<ControllerClient>,
    logic: Arc<dyn WorkerLogic>,
    shutdown: ShutdownHandler,
    cancel: CancellationToken,
}

impl WorkerLifecycleCoordinator {
    pub fn new(
        config: WorkerConfig,
        certificates: Arc<CertificateManager>,
        controller: Arc<ControllerClient>,
        logic: Arc<dyn WorkerLogic>,
    ) -> Self {
        Self {
            config,
            certificates,
            controller,
            logic,
            shutdown: ShutdownHandler::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Wire the certificate manager, CA client and controller client from
    /// `config`, all sharing one cancellation token.
    pub fn from_config(
        config: WorkerConfig,
        logic: Arc<dyn WorkerLogic>,
        observer: Option<Arc<dyn CertificateEventObserver>>,
    ) -> Result<Self, WorkerError> {
        let cancel = CancellationToken::new();
        let signer: Arc<dyn CertificateSigner> = Arc::new(HttpCaClient::new(&config.ca)?);
        let certificates = Arc::new(
            CertificateManager::new(config.certificates.clone(), signer)
                .with_observer(observer.unwrap_or_else(|| Arc::new(TracingObserver)))
                .with_cancel(cancel.clone()),
        );
        let controller = Arc::new(
            ControllerClient::new(config.controller.clone(), certificates.subscribe())
                .with_cancel(cancel.clone()),
        );
        Ok(Self::new(config, certificates, controller, logic).with_cancel(cancel))
    }

    /// Root token; cancelling it begins shutdown.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn certificates(&self) -> &Arc<CertificateManager> {
        &self.certificates
    }

    pub fn controller(&self) -> &Arc<ControllerClient> {
        &self.controller
    }

    /// Register extra cleanup (listeners, business tasks) before `run`.
    pub fn shutdown_handler(&self) -> &ShutdownHandler {
        &self.shutdown
    }

    /// Start the worker, wait for `signal`, then shut down.
    ///
    /// Startup failures are returned as errors after background work has
    /// been cancelled. Once running, the result is always the shutdown
    /// report.
    pub async fn run<F>(&self, signal: F) -> Result<ShutdownReport, WorkerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(signal);

        let started = tokio::select! {
            result = self.start() => result,
            _ = &mut signal => {
                tracing::info!(worker_id = %self.config.worker_id, "Shutdown requested during startup");
                Err(WorkerError::Interrupted)
            }
        };
        if let Err(e) = started {
            self.abort_startup().await;
            return Err(e);
        }

        tracing::info!(worker_id = %self.config.worker_id, "Worker running");
        tokio::select! {
            _ = &mut signal => tracing::info!(worker_id = %self.config.worker_id, "Shutdown signal received"),
            _ = self.cancel.cancelled() => tracing::info!(worker_id = %self.config.worker_id, "Shutdown requested"),
        }

        Ok(self.shutdown().await)
    }

    /// Run the startup sequence.
    pub async fn start(&self) -> Result<(), WorkerError> {
        let worker_id = self.config.worker_id.clone();

        let bundle = match self.certificates.ensure_certificate().await {
            Ok(bundle) => bundle,
            Err(e) => {
                tracing::error!(worker_id = %worker_id, stage = ?e.stage(), error = %e, "Cannot obtain certificate, refusing to start");
                return Err(e.into());
            }
        };
        tracing::info!(worker_id = %worker_id, certificate = %bundle.describe(), "Certificate ready");

        let renewal_cancel = self.cancel.child_token();
        let renewal = tokio::spawn(
            self.certificates
                .clone()
                .run_renewal_loop(renewal_cancel.clone()),
        );
        self.shutdown.register(
            ShutdownTask::new(STOP_RENEWAL_TASK, move || async move {
                renewal_cancel.cancel();
                renewal.await.map_err(|e| Box::new(e) as TaskError)
            })
            .description("Stop the certificate renewal loop")
            .tags(["certificates"]),
        )?;

        let registration = self.config.registration(self.logic.capabilities());
        match self.controller.register(&registration).await {
            Ok(accepted) => {
                tracing::info!(
                    worker_id = %worker_id,
                    heartbeat_secs = accepted.heartbeat_interval.as_secs(),
                    "Controller session established"
                );
            }
            Err(ClientError::Transient(reason)) => {
                tracing::warn!(
                    worker_id = %worker_id,
                    reason = %reason,
                    "Controller unreachable, continuing; the heartbeat loop will register"
                );
            }
            Err(e) => return Err(e.into()),
        }

        let heartbeat_cancel = self.cancel.child_token();
        let load: LoadProbe = {
            let logic = self.logic.clone();
            Arc::new(move || logic.load_score())
        };
        let heartbeat = tokio::spawn(self.controller.clone().run_heartbeat_loop(
            worker_id.clone(),
            load,
            heartbeat_cancel.clone(),
        ));
        self.register_session_teardown(heartbeat_cancel, heartbeat)?;

        let ctx = WorkerContext {
            worker_id: worker_id.clone(),
            certificates: self.certificates.subscribe(),
            cancel: self.cancel.child_token(),
        };
        self.logic
            .on_start(&ctx)
            .await
            .map_err(|e| WorkerError::Logic(e.to_string()))?;
        for task in self.logic.shutdown_tasks() {
            self.shutdown.register(task)?;
        }
        Ok(())
    }

    /// Cancel the background loops and run every shutdown task within the
    /// configured ceiling.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.cancel.cancel();
        let report = self
            .shutdown
            .execute_shutdown(self.config.shutdown_ceiling)
            .await;
        if report.is_clean() {
            tracing::info!(worker_id = %self.config.worker_id, "Worker stopped cleanly");
        } else {
            tracing::warn!(worker_id = %self.config.worker_id, budget_exhausted = report.budget_exhausted, "Worker stopped with shutdown task failures");
        }
        report
    }

    /// stop heartbeat → deregister → close connection.
    fn register_session_teardown(
        &self,
        heartbeat_cancel: CancellationToken,
        heartbeat: JoinHandle<()>,
    ) -> Result<(), WorkerError> {
        self.shutdown.register(
            ShutdownTask::new(STOP_HEARTBEAT_TASK, move || async move {
                heartbeat_cancel.cancel();
                heartbeat.await.map_err(|e| Box::new(e) as TaskError)
            })
            .description("Stop the heartbeat loop")
            .tags(["controller"]),
        )?;

        let controller = self.controller.clone();
        let worker_id = self.config.worker_id.clone();
        let limit = self.config.deregister_timeout;
        self.shutdown.register(
            ShutdownTask::new(DEREGISTER_TASK, move || async move {
                // Best effort: the controller evicts silent workers anyway.
                match tokio::time::timeout(limit, controller.deregister(&worker_id)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(worker_id = %worker_id, error = %e, "Deregistration failed");
                    }
                    Err(_) => {
                        tracing::warn!(worker_id = %worker_id, timeout_ms = limit.as_millis() as u64, "Controller did not answer deregistration, giving up");
                    }
                }
                Ok(())
            })
            .timeout(limit + DEREGISTER_TASK_MARGIN)
            .after(STOP_HEARTBEAT_TASK)
            .description("Remove this worker from the controller")
            .tags(["controller", "network"]),
        )?;

        let controller = self.controller.clone();
        self.shutdown.register(
            ShutdownTask::new(CLOSE_CONTROLLER_TASK, move || async move {
                controller.close();
                Ok(())
            })
            .after(DEREGISTER_TASK)
            .description("Release the controller connection pool")
            .tags(["controller"]),
        )?;
        Ok(())
    }

    /// Startup failed: stop whatever was spawned and release the client.
    async fn abort_startup(&self) {
        self.cancel.cancel();
        let report = self
            .shutdown
            .execute_shutdown(self.config.shutdown_ceiling)
            .await;
        tracing::debug!(tasks = report.tasks.len(), "Startup aborted");
        self.controller.close();
    }
}
