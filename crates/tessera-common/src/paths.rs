use std::path::PathBuf;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "TESSERA_DATA_DIR";

/// Root data directory for tessera.
///
/// Holds worker certificate material, the CA root (on the authority host)
/// and logs. Only used to derive defaults; every component takes its
/// directories through explicit configuration.
///
/// - `$TESSERA_DATA_DIR` when set
/// - Linux: `~/.tessera/`
/// - macOS: `~/Library/Application Support/tessera/`
/// - Windows: `%LOCALAPPDATA%\tessera\`
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("tessera");
        }
    }

    #[cfg(windows)]
    {
        if let Some(local) = std::env::var_os("LOCALAPPDATA") {
            return PathBuf::from(local).join("tessera");
        }
    }

    #[cfg(not(any(target_os = "macos", windows)))]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(".tessera");
        }
    }

    PathBuf::from(".tessera")
}

/// Worker certificate directory (`cert.pem`, `key.pem`, `ca.pem`).
pub fn certs_dir() -> PathBuf {
    data_dir().join("certs")
}

/// Certificate authority directory (root cert and key).
pub fn ca_dir() -> PathBuf {
    data_dir().join("ca")
}

/// Log directory.
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Default location of the certificate lifecycle audit log.
pub fn audit_log_path() -> PathBuf {
    log_dir().join("certificates.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_dirs_live_under_data_dir() {
        let root = data_dir();
        assert_eq!(certs_dir(), root.join("certs"));
        assert_eq!(ca_dir(), root.join("ca"));
        assert!(audit_log_path().starts_with(log_dir()));
    }
}
