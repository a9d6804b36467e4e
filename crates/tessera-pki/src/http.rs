//! CA HTTP route handlers.
//!
//! Mounted by the binary at the root of the CA listener. Workers reach
//! these through [`crate::signer::HttpCaClient`].

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use tessera_common::error::ErrorCode;

use crate::ca::CertificateAuthorityManager;
use crate::error::CaError;
use crate::fingerprint::constant_time_eq;
use crate::policy::PolicyContext;
use crate::protocol::{CaRootResponse, SignRequest, SignResponse};

/// Shared state for the CA routes.
pub struct CaService {
    authority: CertificateAuthorityManager,
    bootstrap_token: Option<String>,
}

impl CaService {
    /// Without a bootstrap token every request is accepted and the policy
    /// sees `bootstrap_authenticated = false`.
    pub fn new(authority: CertificateAuthorityManager, bootstrap_token: Option<String>) -> Self {
        Self {
            authority,
            bootstrap_token,
        }
    }

    pub fn authority(&self) -> &CertificateAuthorityManager {
        &self.authority
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<bool, ()> {
        let Some(expected) = &self.bootstrap_token else {
            return Ok(false);
        };
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or_default();
        if constant_time_eq(presented, expected) {
            Ok(true)
        } else {
            Err(())
        }
    }
}

pub fn routes(state: Arc<CaService>) -> Router {
    Router::new()
        .route("/certificates/sign", post(sign_handler))
        .route("/certificates/ca", get(ca_handler))
        .with_state(state)
}

/// `POST /certificates/sign`: sign a worker CSR.
async fn sign_handler(
    State(state): State<Arc<CaService>>,
    headers: HeaderMap,
    Json(request): Json<SignRequest>,
) -> impl IntoResponse {
    let Ok(bootstrap_authenticated) = state.authenticate(&headers) else {
        tracing::warn!(worker_id = %request.worker_id, "CSR rejected: bad bootstrap token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(SignResponse::rejected("invalid bootstrap token")),
        )
            .into_response();
    };

    let mut ctx = PolicyContext::for_worker(&request.worker_id);
    ctx.bootstrap_authenticated = bootstrap_authenticated;

    match state.authority.sign_csr(&request.csr_pem, &ctx) {
        Ok(certificate_pem) => (
            StatusCode::OK,
            Json(SignResponse::issued(
                certificate_pem,
                state.authority.ca_pem().to_string(),
            )),
        )
            .into_response(),
        Err(e) if e.is_rejection() => {
            tracing::warn!(worker_id = %request.worker_id, error = %e, "CSR rejected");
            (StatusCode::BAD_REQUEST, Json(SignResponse::rejected(e.to_string()))).into_response()
        }
        Err(e) => {
            tracing::error!(worker_id = %request.worker_id, error = %e, "CSR signing failed");
            error_response(&e)
        }
    }
}

/// `GET /certificates/ca`: the current root certificate.
async fn ca_handler(State(state): State<Arc<CaService>>) -> impl IntoResponse {
    Json(CaRootResponse {
        ca_pem: state.authority.ca_pem().to_string(),
        fingerprint: state.authority.fingerprint().to_string(),
    })
}

fn error_response(error: &CaError) -> axum::response::Response {
    let code = ErrorCode::from(error);
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({
        "error": code,
        "message": error.to_string(),
    });
    (status, Json(body)).into_response()
}
