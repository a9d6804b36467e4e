//! CLI command handlers.
//!
//! - `worker` runs the full worker lifecycle until a shutdown signal.
//! - `ca` creates and serves the certificate authority.
//! - `cert` inspects certificate material on disk.

pub mod ca;
pub mod cert;
pub mod worker;

/// `GET /healthz` on every listener the binary runs.
pub(crate) async fn health() -> &'static str {
    "OK"
}
