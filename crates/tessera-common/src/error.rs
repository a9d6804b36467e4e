use serde::{Deserialize, Serialize};

/// Codes carried in the `error` field of CA error bodies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidCsr,
    PolicyDenied,
    CaNotInitialized,
    SigningFailed,
    IoError,
    Internal,
}

impl ErrorCode {
    /// HTTP status the CA answers with. Kept as a bare `u16` so clients
    /// can match on it without pulling in a server crate.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidCsr => 400,
            Self::PolicyDenied => 403,
            Self::CaNotInitialized => 503,
            Self::SigningFailed | Self::IoError | Self::Internal => 500,
        }
    }
}
