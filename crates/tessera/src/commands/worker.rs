//! `tessera worker`: identity, controller session and health listener.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use axum::Router;

use tessera_common::paths;
use tessera_pki::events::{AuditLogObserver, CompositeObserver, TracingObserver};
use tessera_pki::CertificateEventObserver;
use tessera_worker::listener::serve_tls;
use tessera_worker::{
    NoopLogic, ShutdownTask, TaskError, TaskOutcome, WorkerConfig, WorkerError,
    WorkerLifecycleCoordinator,
};

use crate::cli::WorkerArgs;

const STOP_LISTENER_TASK: &str = "stop_listener";

/// Exit status when the worker never obtained a certificate.
const EXIT_NO_CERTIFICATE: u8 = 2;
/// Exit status when the controller refused the registration.
const EXIT_REGISTRATION_REJECTED: u8 = 3;
/// Exit status when shutdown tasks failed or timed out.
const EXIT_UNCLEAN_SHUTDOWN: u8 = 4;

pub(crate) fn worker_config(args: &WorkerArgs) -> anyhow::Result<WorkerConfig> {
    let cert_dir = args.cert_dir.clone().unwrap_or_else(paths::certs_dir);
    let endpoint = args
        .endpoint
        .clone()
        .unwrap_or_else(|| format!("https://{}:{}", args.worker_id, args.listen.port()));

    let mut config = WorkerConfig::new(
        &args.worker_id,
        &args.service_type,
        cert_dir,
        &args.ca_url,
        &args.controller_url,
    )
    .with_endpoint(endpoint);

    config.capabilities = args.capabilities.clone();
    config.listen_addr = Some(args.listen);
    config.shutdown_ceiling = Duration::from_secs(args.shutdown_timeout);
    config.certificates.subject_alt_names = args.sans.clone();
    config.controller.heartbeat_interval = args.heartbeat_interval.map(Duration::from_secs);

    config.ca.tls_verify = args.ca_tls_verify;
    config.ca.bootstrap_token = args.bootstrap_token.clone();
    if let Some(path) = &args.ca_root {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("reading CA root from {}", path.display()))?;
        config.ca.ca_root_pem = Some(pem);
    }
    Ok(config)
}

fn observer(args: &WorkerArgs) -> Arc<dyn CertificateEventObserver> {
    match &args.audit_log {
        Some(path) => Arc::new(
            CompositeObserver::new()
                .with(Arc::new(TracingObserver))
                .with(Arc::new(AuditLogObserver::new(path))),
        ),
        None => Arc::new(TracingObserver),
    }
}

pub async fn run(args: WorkerArgs) -> anyhow::Result<ExitCode> {
    let config = worker_config(&args)?;
    startup_diagnostics(&config);

    let listen = config.listen_addr;
    let coordinator =
        WorkerLifecycleCoordinator::from_config(config, Arc::new(NoopLogic), Some(observer(&args)))?;

    if let Some(addr) = listen {
        let listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("binding health listener on {addr}"))?;
        start_listener(&coordinator, listener)?;
    }

    match coordinator.run(crate::shutdown_signal()).await {
        Ok(report) if report.is_clean() => Ok(ExitCode::SUCCESS),
        Ok(report) => {
            for task in report
                .tasks
                .iter()
                .filter(|t| t.outcome != TaskOutcome::Succeeded)
            {
                tracing::warn!(task = %task.name, outcome = ?task.outcome, "Shutdown task did not succeed");
            }
            Ok(ExitCode::from(EXIT_UNCLEAN_SHUTDOWN))
        }
        Err(e) => {
            tracing::error!(stage = e.stage(), error = %e, "Worker failed to start");
            let code = match e {
                WorkerError::Certificate(_) => EXIT_NO_CERTIFICATE,
                WorkerError::RegistrationRejected { .. } => EXIT_REGISTRATION_REJECTED,
                WorkerError::Interrupted => return Ok(ExitCode::SUCCESS),
                _ => 1,
            };
            Ok(ExitCode::from(code))
        }
    }
}

/// Serve `/healthz` over mTLS once the first certificate is installed.
/// A listener failure shuts the worker down.
fn start_listener(
    coordinator: &WorkerLifecycleCoordinator,
    listener: std::net::TcpListener,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let app = Router::new().route("/healthz", get(super::health));
    let cancel = coordinator.cancel_token().child_token();
    let root = coordinator.cancel_token();
    let bundles = coordinator.certificates().subscribe();

    let server = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = serve_tls(listener, app, bundles, cancel).await {
                tracing::error!(%addr, error = %e, "Worker listener failed");
                root.cancel();
            }
        }
    });

    coordinator.shutdown_handler().register(
        ShutdownTask::new(STOP_LISTENER_TASK, move || async move {
            cancel.cancel();
            server.await.map_err(|e| Box::new(e) as TaskError)
        })
        .description("Stop the mTLS health listener")
        .tags(["listener"]),
    )?;
    Ok(())
}

fn startup_diagnostics(config: &WorkerConfig) {
    tracing::info!("Tessera worker v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!("Platform: {}", std::env::consts::OS);
    tracing::info!(worker_id = %config.worker_id, service_type = %config.service_type, "Identity");
    tracing::info!("Certificates: {}", config.certificates.cert_dir.display());
    tracing::info!("CA: {}", config.ca.ca_url);
    tracing::info!("Controller: {}", config.controller.controller_url);
    match config.listen_addr {
        Some(addr) => tracing::info!("TCP {}: health listener (mTLS)", addr),
        None => tracing::info!("Health listener: disabled"),
    }
}
