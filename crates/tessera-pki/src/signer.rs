//! CSR submission seam and its HTTP implementation.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::error::SubmitError;
use crate::fingerprint::{constant_time_eq, fingerprint_pem};
use crate::protocol::{SignRequest, SignResponse, SignStatus};
use crate::tls::TlsError;

/// TCP connection timeout for CA requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Overall timeout for one CA request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Signed certificate plus the root it chains to.
#[derive(Debug, Clone)]
pub struct IssuedChain {
    pub certificate_pem: String,
    pub ca_pem: String,
}

/// Anything that can turn a CSR into a signed certificate.
///
/// Implementations report definitive refusals as [`SubmitError::Rejected`]
/// and everything worth retrying as [`SubmitError::Transient`].
#[async_trait]
pub trait CertificateSigner: Send + Sync {
    async fn submit(&self, worker_id: &str, csr_pem: &str) -> Result<IssuedChain, SubmitError>;
}

#[derive(Clone)]
pub struct CaClientConfig {
    /// Base URL of the CA service, e.g. `https://ca.internal:8600`.
    pub ca_url: String,
    /// Out-of-band trust anchor. When set, it is the only root trusted for
    /// the CA connection and the returned CA must match it.
    pub ca_root_pem: Option<String>,
    /// Verify the CA's server certificate. Only affects this connection.
    pub tls_verify: bool,
    /// Bootstrap secret sent as a bearer token.
    pub bootstrap_token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl CaClientConfig {
    pub fn new(ca_url: impl Into<String>) -> Self {
        Self {
            ca_url: ca_url.into(),
            ca_root_pem: None,
            tls_verify: true,
            bootstrap_token: None,
            connect_timeout: CONNECT_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

impl fmt::Debug for CaClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaClientConfig")
            .field("ca_url", &self.ca_url)
            .field("pinned_root", &self.ca_root_pem.is_some())
            .field("tls_verify", &self.tls_verify)
            .field("bootstrap_token", &self.bootstrap_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Submits CSRs to `POST {ca_url}/certificates/sign`.
pub struct HttpCaClient {
    endpoint: String,
    pinned_fingerprint: Option<String>,
    bootstrap_token: Option<String>,
    client: reqwest::Client,
}

impl HttpCaClient {
    pub fn new(config: &CaClientConfig) -> Result<Self, TlsError> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout);

        let mut pinned_fingerprint = None;
        if let Some(root) = &config.ca_root_pem {
            let cert = reqwest::Certificate::from_pem(root.as_bytes())
                .map_err(|e| TlsError::Client(e.to_string()))?;
            builder = builder
                .add_root_certificate(cert)
                .tls_built_in_root_certs(false);
            pinned_fingerprint =
                Some(fingerprint_pem(root).map_err(|e| TlsError::Pem(e.to_string()))?);
        }

        if !config.tls_verify {
            tracing::warn!(ca_url = %config.ca_url, "TLS verification disabled for the CA endpoint");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| TlsError::Client(e.to_string()))?;

        Ok(Self {
            endpoint: config.ca_url.trim_end_matches('/').to_string(),
            pinned_fingerprint,
            bootstrap_token: config.bootstrap_token.clone(),
            client,
        })
    }
}

#[async_trait]
impl CertificateSigner for HttpCaClient {
    async fn submit(&self, worker_id: &str, csr_pem: &str) -> Result<IssuedChain, SubmitError> {
        let url = format!("{}/certificates/sign", self.endpoint);
        let mut request = self.client.post(&url).json(&SignRequest {
            worker_id: worker_id.to_string(),
            csr_pem: csr_pem.to_string(),
        });
        if let Some(token) = &self.bootstrap_token {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| SubmitError::Transient(e.to_string()))?;
        let status = resp.status();

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SubmitError::Transient(format!("CA returned {status}")));
        }

        let body: SignResponse = match resp.json().await {
            Ok(body) => body,
            Err(_) if status.is_client_error() => {
                return Err(SubmitError::Rejected(format!("CA returned {status}")));
            }
            Err(e) => return Err(SubmitError::Transient(format!("invalid CA response: {e}"))),
        };

        if status.is_client_error() || body.status == SignStatus::Rejected {
            return Err(SubmitError::Rejected(
                body.reason
                    .unwrap_or_else(|| format!("CA returned {status}")),
            ));
        }

        let (Some(certificate_pem), Some(ca_pem)) = (body.certificate_pem, body.ca_pem) else {
            return Err(SubmitError::Transient(
                "issued response is missing certificate material".into(),
            ));
        };

        if let Some(pinned) = &self.pinned_fingerprint {
            let got = fingerprint_pem(&ca_pem)
                .map_err(|e| SubmitError::Rejected(format!("unreadable CA certificate: {e}")))?;
            if !constant_time_eq(pinned, &got) {
                return Err(SubmitError::Rejected(
                    "CA root does not match the pinned root".into(),
                ));
            }
        }

        Ok(IssuedChain {
            certificate_pem,
            ca_pem,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_debug_redacts_token() {
        let mut config = CaClientConfig::new("https://ca.internal:8600");
        config.bootstrap_token = Some("s3cret".into());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn invalid_pinned_root_fails_construction() {
        let mut config = CaClientConfig::new("https://ca.internal:8600");
        config.ca_root_pem = Some("not a certificate".into());
        assert!(HttpCaClient::new(&config).is_err());
    }

    #[tokio::test]
    async fn unreachable_ca_is_transient() {
        let mut config = CaClientConfig::new("http://127.0.0.1:9");
        config.connect_timeout = Duration::from_millis(200);
        config.request_timeout = Duration::from_millis(500);
        let client = HttpCaClient::new(&config).unwrap();

        let err = client.submit("w1", "csr").await.unwrap_err();
        assert!(matches!(err, SubmitError::Transient(_)), "{err:?}");
    }

    async fn serve_ca(token: Option<&str>) -> (String, std::sync::Arc<crate::http::CaService>) {
        let service = std::sync::Arc::new(crate::http::CaService::new(
            crate::testing::throwaway_ca(90),
            token.map(str::to_string),
        ));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = crate::http::routes(service.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), service)
    }

    fn csr(worker_id: &str) -> crate::csr::CertificateRequest {
        crate::csr::CertificateRequest::generate(worker_id, &[], chrono::Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn http_client_round_trip_with_pinned_root() {
        let (url, service) = serve_ca(Some("join-me")).await;
        let mut config = CaClientConfig::new(url);
        config.bootstrap_token = Some("join-me".into());
        config.ca_root_pem = Some(service.authority().ca_pem().to_string());
        let client = HttpCaClient::new(&config).unwrap();

        let request = csr("w1");
        let chain = client.submit("w1", request.csr_pem()).await.unwrap();
        assert_eq!(chain.ca_pem, service.authority().ca_pem());

        let bundle = request
            .into_bundle(&chain.certificate_pem, &chain.ca_pem, chrono::Utc::now())
            .unwrap();
        assert_eq!(bundle.subject(), "w1");
    }

    #[tokio::test]
    async fn http_client_maps_4xx_to_rejected() {
        let (url, _service) = serve_ca(Some("join-me")).await;
        let mut config = CaClientConfig::new(url);
        config.bootstrap_token = Some("wrong".into());
        let client = HttpCaClient::new(&config).unwrap();

        let err = client.submit("w1", csr("w1").csr_pem()).await.unwrap_err();
        assert_eq!(err, SubmitError::Rejected("invalid bootstrap token".into()));
    }

    #[tokio::test]
    async fn http_client_refuses_unpinned_ca() {
        let (url, _service) = serve_ca(None).await;
        let other = crate::testing::throwaway_ca(90);
        let mut config = CaClientConfig::new(url);
        config.ca_root_pem = Some(other.ca_pem().to_string());
        let client = HttpCaClient::new(&config).unwrap();

        let err = client.submit("w1", csr("w1").csr_pem()).await.unwrap_err();
        assert!(matches!(err, SubmitError::Rejected(ref r) if r.contains("pinned")), "{err:?}");
    }
}
