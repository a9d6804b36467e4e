use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

/// Default CA listener, "CA" on a phone keypad followed by two zeros.
pub const DEFAULT_CA_LISTEN: &str = "0.0.0.0:2200";

#[derive(Parser, Debug)]
#[command(
    name = "tessera",
    version,
    about = "Worker identity, certificate authority and controller sessions"
)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "TESSERA_LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write logs to file (in addition to stderr)
    #[arg(long, env = "TESSERA_LOG_FILE", value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a worker: certificate, controller session, health listener
    Worker(WorkerArgs),
    /// Certificate authority operations
    Ca(CaCommand),
    /// Inspect the worker's persisted certificate
    Cert(CertCommand),
    /// Show version information
    Version,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Worker identity, used as the certificate common name
    #[arg(long, env = "TESSERA_WORKER_ID")]
    pub worker_id: String,

    /// Service type advertised to the controller
    #[arg(long, env = "TESSERA_SERVICE_TYPE")]
    pub service_type: String,

    /// CA service base URL
    #[arg(long, env = "TESSERA_CA_URL")]
    pub ca_url: String,

    /// Controller base URL (https)
    #[arg(long, env = "TESSERA_CONTROLLER_URL")]
    pub controller_url: String,

    /// Certificate directory (default: <data dir>/certs)
    #[arg(long, env = "TESSERA_CERT_DIR", value_name = "DIR")]
    pub cert_dir: Option<PathBuf>,

    /// Heartbeat interval in seconds, overriding the controller's
    #[arg(long, env = "TESSERA_HEARTBEAT_INTERVAL", value_name = "SECONDS")]
    pub heartbeat_interval: Option<u64>,

    /// Verify the CA endpoint's TLS certificate
    #[arg(long, env = "TESSERA_CA_TLS_VERIFY", default_value_t = true, action = ArgAction::Set)]
    pub ca_tls_verify: bool,

    /// Pin the CA endpoint to this root certificate (PEM)
    #[arg(long, env = "TESSERA_CA_ROOT", value_name = "PATH")]
    pub ca_root: Option<PathBuf>,

    /// Bearer token presented with CSR submissions
    #[arg(long, env = "TESSERA_BOOTSTRAP_TOKEN", hide_env_values = true)]
    pub bootstrap_token: Option<String>,

    /// Address of the worker's mTLS health listener
    #[arg(long, env = "TESSERA_LISTEN", default_value = "0.0.0.0:8443")]
    pub listen: SocketAddr,

    /// Public URL of this worker (default: https://<worker-id>:<listen port>)
    #[arg(long, env = "TESSERA_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Extra subject alternative names for the worker certificate
    #[arg(long = "san", value_name = "NAME")]
    pub sans: Vec<String>,

    /// Capability advertised in the registration (repeatable)
    #[arg(long = "capability", value_name = "NAME")]
    pub capabilities: Vec<String>,

    /// Hard ceiling on the shutdown sequence, in seconds
    #[arg(long, default_value = "30", value_name = "SECONDS")]
    pub shutdown_timeout: u64,

    /// Append certificate lifecycle events to this file
    #[arg(long, env = "TESSERA_AUDIT_LOG", value_name = "PATH")]
    pub audit_log: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct CaCommand {
    #[command(subcommand)]
    pub command: CaSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum CaSubcommand {
    /// Create the root certificate (no-op when it exists)
    Init {
        /// CA directory (default: <data dir>/ca)
        #[arg(long, env = "TESSERA_CA_DIR", value_name = "DIR")]
        dir: Option<PathBuf>,
        /// Root certificate common name
        #[arg(long)]
        common_name: Option<String>,
        /// Organization placed in issued subjects
        #[arg(long)]
        organization: Option<String>,
    },
    /// Serve the CSR signing endpoint over HTTPS
    Serve {
        /// CA directory (default: <data dir>/ca)
        #[arg(long, env = "TESSERA_CA_DIR", value_name = "DIR")]
        dir: Option<PathBuf>,
        /// Listen address
        #[arg(long, env = "TESSERA_CA_LISTEN", default_value = DEFAULT_CA_LISTEN)]
        listen: SocketAddr,
        /// Names for the CA's own server certificate (repeatable)
        #[arg(long = "san", value_name = "NAME", default_value = "localhost")]
        sans: Vec<String>,
        /// Validity of signed worker certificates, in days
        #[arg(
            long,
            default_value = "90",
            value_name = "DAYS",
            value_parser = clap::value_parser!(i64).range(1..)
        )]
        validity_days: i64,
        /// Require this bearer token on CSR submissions
        #[arg(long, env = "TESSERA_BOOTSTRAP_TOKEN", hide_env_values = true)]
        bootstrap_token: Option<String>,
    },
}

#[derive(Args, Debug)]
pub struct CertCommand {
    #[command(subcommand)]
    pub command: CertSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum CertSubcommand {
    /// Describe the persisted certificate bundle
    Status {
        /// Certificate directory (default: <data dir>/certs)
        #[arg(long, env = "TESSERA_CERT_DIR", value_name = "DIR")]
        cert_dir: Option<PathBuf>,
    },
}
