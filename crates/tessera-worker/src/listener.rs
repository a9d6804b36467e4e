//! The worker's own mTLS listener.
//!
//! Terminates TLS with the current bundle and requires peers to present a
//! certificate from the same root. When the bundle is renewed the rustls
//! config is swapped in place; established connections keep the old one
//! until they close.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use tessera_pki::CertificateBundle;

use crate::error::WorkerError;

/// In-flight requests get this long after cancellation.
const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);

type BundleRx = watch::Receiver<Option<Arc<CertificateBundle>>>;

/// Serve `app` on an already bound listener until `cancel` fires.
///
/// Nothing is accepted until the first bundle is published.
pub async fn serve_tls(
    listener: std::net::TcpListener,
    app: Router,
    mut bundle_rx: BundleRx,
    cancel: CancellationToken,
) -> Result<(), WorkerError> {
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;

    let bundle = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        bundle = wait_for_bundle(&mut bundle_rx) => bundle?,
    };
    let tls = RustlsConfig::from_config(Arc::new(bundle.to_tls_config().server_config()?));

    let reload = tokio::spawn(reload_on_renewal(tls.clone(), bundle_rx, cancel.clone()));

    let handle = axum_server::Handle::new();
    let shutdown = {
        let handle = handle.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN));
        })
    };

    tracing::info!(%addr, certificate = %bundle.describe(), "Worker listener started");
    let served = axum_server::from_tcp_rustls(listener, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await;

    reload.abort();
    shutdown.abort();
    tracing::debug!(%addr, "Worker listener stopped");
    served.map_err(WorkerError::from)
}

async fn wait_for_bundle(rx: &mut BundleRx) -> Result<Arc<CertificateBundle>, WorkerError> {
    let current = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| WorkerError::Interrupted)?
        .clone();
    current.ok_or(WorkerError::Interrupted)
}

async fn reload_on_renewal(tls: RustlsConfig, mut bundle_rx: BundleRx, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = bundle_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let bundle = bundle_rx.borrow_and_update().clone();
                let Some(bundle) = bundle else { continue };
                match bundle.to_tls_config().server_config() {
                    Ok(config) => {
                        tls.reload_from_config(Arc::new(config));
                        tracing::info!(certificate = %bundle.describe(), "Worker listener certificate reloaded");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Cannot build TLS config from renewed certificate, keeping previous");
                    }
                }
            }
        }
    }
}
