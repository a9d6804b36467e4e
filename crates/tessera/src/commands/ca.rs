//! Certificate authority commands.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use axum_server::tls_rustls::RustlsConfig;

use tessera_common::paths;
use tessera_pki::ca::generate_root;
use tessera_pki::http::{routes, CaService};
use tessera_pki::tls::server_config_without_client_auth;
use tessera_pki::{CaConfig, CaError, CertificateAuthorityManager, RootStatus};

/// In-flight signing requests get this long after the shutdown signal.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

fn ca_config(dir: Option<PathBuf>) -> CaConfig {
    CaConfig::new(dir.unwrap_or_else(paths::ca_dir))
}

// ── Init ────────────────────────────────────────────────────────────

pub fn init(
    dir: Option<PathBuf>,
    common_name: Option<&str>,
    organization: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let mut config = ca_config(dir);
    if let Some(cn) = common_name {
        config.common_name = cn.to_string();
    }
    if let Some(org) = organization {
        config.organization = org.to_string();
    }

    let status = generate_root(&config)?;
    let authority = CertificateAuthorityManager::load(config)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "created": status == RootStatus::Created,
                "dir": authority.dir().display().to_string(),
                "ca_fingerprint": authority.fingerprint(),
            })
        );
    } else {
        match status {
            RootStatus::Created => println!("Root certificate created."),
            RootStatus::AlreadyExists => println!("Root certificate already exists."),
        }
        println!("  Directory:    {}", authority.dir().display());
        println!("  Fingerprint:  {}", authority.fingerprint());
    }
    Ok(())
}

// ── Serve ───────────────────────────────────────────────────────────

pub async fn serve(
    dir: Option<PathBuf>,
    listen: SocketAddr,
    sans: &[String],
    validity_days: i64,
    bootstrap_token: Option<String>,
) -> anyhow::Result<()> {
    let mut config = ca_config(dir);
    config.validity_days = validity_days;

    let authority = match CertificateAuthorityManager::load(config) {
        Ok(authority) => authority,
        Err(CaError::RootMissing) => {
            anyhow::bail!("No root certificate found.\nCreate one first: tessera ca init")
        }
        Err(e) => return Err(e.into()),
    };

    let server_cert = authority
        .issue_server_certificate(sans)
        .context("issuing the CA server certificate")?;
    let tls = server_config_without_client_auth(&server_cert.fullchain_pem(), &server_cert.key_pem)?;
    let tls = RustlsConfig::from_config(Arc::new(tls));

    tracing::info!("Tessera CA v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        fingerprint = %authority.fingerprint(),
        validity_days,
        sans = ?sans,
        "Serving from {}",
        authority.dir().display()
    );
    if bootstrap_token.is_none() {
        tracing::warn!("No bootstrap token configured, CSR submissions are not authenticated");
    }

    let app = routes(Arc::new(CaService::new(authority, bootstrap_token)))
        .route("/healthz", get(super::health));

    let handle = axum_server::Handle::new();
    let signal = {
        let handle = handle.clone();
        tokio::spawn(async move {
            crate::shutdown_signal().await;
            tracing::info!("Shutting down...");
            handle.graceful_shutdown(Some(SHUTDOWN_DRAIN));
        })
    };

    tracing::info!(%listen, "CA listening");
    let served = axum_server::bind_rustls(listen, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await;
    signal.abort();
    served.with_context(|| format!("CA listener on {listen}"))
}
