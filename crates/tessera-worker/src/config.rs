use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tessera_client::ControllerClientConfig;
use tessera_common::types::WorkerRegistration;
use tessera_pki::{CaClientConfig, CertificateManagerConfig};

/// Hard ceiling on the whole shutdown sequence.
pub const DEFAULT_SHUTDOWN_CEILING: Duration = Duration::from_secs(30);

/// How long shutdown waits on the controller's DELETE before giving up.
/// Kept below the shutdown task timeout so a silent controller never
/// makes the shutdown unclean.
pub const DEFAULT_DEREGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a worker process needs, built once at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub service_type: String,
    pub endpoint_url: String,
    pub health_url: String,
    pub capabilities: Vec<String>,
    /// Where the worker's own mTLS listener binds, if it runs one.
    pub listen_addr: Option<SocketAddr>,
    pub shutdown_ceiling: Duration,
    pub deregister_timeout: Duration,
    pub certificates: CertificateManagerConfig,
    pub ca: CaClientConfig,
    pub controller: ControllerClientConfig,
}

impl WorkerConfig {
    pub fn new(
        worker_id: impl Into<String>,
        service_type: impl Into<String>,
        cert_dir: impl Into<PathBuf>,
        ca_url: impl Into<String>,
        controller_url: impl Into<String>,
    ) -> Self {
        let worker_id = worker_id.into();
        Self {
            service_type: service_type.into(),
            endpoint_url: String::new(),
            health_url: String::new(),
            capabilities: Vec::new(),
            listen_addr: None,
            shutdown_ceiling: DEFAULT_SHUTDOWN_CEILING,
            deregister_timeout: DEFAULT_DEREGISTER_TIMEOUT,
            certificates: CertificateManagerConfig::new(worker_id.clone(), cert_dir),
            ca: CaClientConfig::new(ca_url),
            controller: ControllerClientConfig::new(controller_url),
            worker_id,
        }
    }

    /// Set the public endpoint; the health URL follows it unless already set.
    pub fn with_endpoint(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = endpoint_url.into().trim_end_matches('/').to_string();
        if self.health_url.is_empty() {
            self.health_url = format!("{}/healthz", self.endpoint_url);
        }
        self
    }

    /// The registration sent to the controller. `extra` comes from the
    /// worker logic and is merged with the configured capabilities.
    pub fn registration(&self, extra: impl IntoIterator<Item = String>) -> WorkerRegistration {
        WorkerRegistration::new(
            &self.worker_id,
            &self.service_type,
            &self.endpoint_url,
            &self.health_url,
            self.capabilities.iter().cloned().chain(extra),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_configs_share_worker_id() {
        let config = WorkerConfig::new("w1", "streaming", "/tmp/certs", "https://ca:8600", "https://ctl:9443");
        assert_eq!(config.certificates.worker_id, "w1");
        assert_eq!(config.shutdown_ceiling, Duration::from_secs(30));
        assert!(config.deregister_timeout < crate::shutdown::DEFAULT_TASK_TIMEOUT);
        assert!(config.ca.tls_verify);
    }

    #[test]
    fn registration_merges_capabilities_and_derives_health_url() {
        let mut config = WorkerConfig::new("w1", "streaming", "/tmp/certs", "https://ca:8600", "https://ctl:9443")
            .with_endpoint("https://10.0.0.5:8443/");
        config.capabilities = vec!["video".into()];

        let reg = config.registration(["audio".to_string(), "video".to_string()]);
        assert_eq!(reg.endpoint_url, "https://10.0.0.5:8443");
        assert_eq!(reg.health_url, "https://10.0.0.5:8443/healthz");
        assert_eq!(reg.capabilities.len(), 2);
        assert_eq!(reg.service_type, "streaming");
    }
}
