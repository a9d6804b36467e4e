use tessera_client::ClientError;
use tessera_pki::{ManagerError, TlsError};

use crate::shutdown::ShutdownError;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Certificate unavailable: {0}")]
    Certificate(#[from] ManagerError),

    #[error("Registration rejected by controller ({status}): {reason}")]
    RegistrationRejected { status: u16, reason: String },

    #[error("Controller session failed: {0}")]
    Controller(ClientError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("Worker logic failed to start: {0}")]
    Logic(String),

    #[error("Listener error: {0}")]
    Listener(#[from] std::io::Error),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error("Interrupted during startup")]
    Interrupted,
}

impl From<ClientError> for WorkerError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Rejected { status, reason } => Self::RegistrationRejected { status, reason },
            other => Self::Controller(other),
        }
    }
}

impl WorkerError {
    /// The log/exit label for the stage that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Certificate(ManagerError::CertificateUnavailable { stage, .. }) => stage.as_str(),
            Self::Certificate(_) => "certificate",
            Self::RegistrationRejected { .. } => "registration",
            Self::Controller(_) => "controller",
            Self::Tls(_) | Self::Listener(_) => "listener",
            Self::Logic(_) => "worker_logic",
            Self::Shutdown(_) => "shutdown",
            Self::Interrupted => "startup",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_pki::AcquisitionStage;

    #[test]
    fn client_rejection_becomes_registration_rejected() {
        let err = WorkerError::from(ClientError::Rejected {
            status: 403,
            reason: "denied".into(),
        });
        assert!(matches!(err, WorkerError::RegistrationRejected { status: 403, .. }));
        assert_eq!(err.stage(), "registration");

        let err = WorkerError::from(ClientError::Transient("down".into()));
        assert!(matches!(err, WorkerError::Controller(_)));
    }

    #[test]
    fn certificate_failures_name_their_stage() {
        let err = WorkerError::from(ManagerError::CertificateUnavailable {
            stage: AcquisitionStage::CaRejection,
            attempts: 1,
            reason: "denied".into(),
        });
        assert_eq!(err.stage(), "ca_rejection");
    }
}
