//! Tessera PKI: worker identity and certificate lifecycle.
//!
//! Worker side: [`CertificateManager`] generates a key locally, drives the
//! CSR exchange through a [`CertificateSigner`], keeps the active
//! [`CertificateBundle`] valid and swaps it atomically on renewal.
//!
//! Authority side: [`CertificateAuthorityManager`] owns the root key,
//! bootstraps the root once and signs CSRs under a [`CertificatePolicy`].
//! It is served over HTTP by [`http::routes`] and never runs in a worker.

pub mod bundle;
pub mod ca;
pub mod certfiles;
pub mod csr;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod http;
pub mod manager;
pub mod policy;
pub mod protocol;
pub mod signer;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod tls;

pub use bundle::CertificateBundle;
pub use ca::{CaConfig, CertificateAuthorityManager, IssuedCertificate, RootStatus};
pub use csr::{CertificateRequest, CsrStatus};
pub use error::{AcquisitionStage, CaError, CertificateError, ManagerError, SubmitError};
pub use events::{CertificateEvent, CertificateEventKind, CertificateEventObserver};
pub use manager::{CertificateManager, CertificateManagerConfig, ManagerState, RenewalOutcome};
pub use policy::{CertificatePolicy, DefaultPolicy, PolicyContext, PolicyDecision};
pub use signer::{CaClientConfig, CertificateSigner, HttpCaClient, IssuedChain};
pub use tls::{TlsConfig, TlsError};
