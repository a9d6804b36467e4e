//! Certificate material on disk.
//!
//! Layout of a certificate directory:
//! - `cert.pem`: leaf certificate
//! - `key.pem`: private key (0600 on Unix)
//! - `ca.pem`: trust anchor
//! - `fullchain.pem`: cert.pem + ca.pem
//!
//! Every file is written to a temp path and renamed into place, so a
//! reader never sees a half-written file.

use std::io::Write;
use std::path::{Path, PathBuf};

use zeroize::Zeroizing;

use crate::bundle::CertificateBundle;

pub const CERT_FILENAME: &str = "cert.pem";
pub const KEY_FILENAME: &str = "key.pem";
pub const CA_FILENAME: &str = "ca.pem";
pub const FULLCHAIN_FILENAME: &str = "fullchain.pem";

/// Raw PEM contents read back from a certificate directory.
pub struct PemFiles {
    pub cert_pem: String,
    pub key_pem: Zeroizing<String>,
    pub ca_pem: String,
}

/// Write all certificate files for a bundle into `dir`.
pub fn write_bundle_to(dir: &Path, bundle: &CertificateBundle) -> Result<PathBuf, std::io::Error> {
    std::fs::create_dir_all(dir)?;

    write_atomic(&dir.join(CERT_FILENAME), bundle.cert_pem().as_bytes(), false)?;
    write_atomic(&dir.join(KEY_FILENAME), bundle.key_pem().as_bytes(), true)?;
    write_atomic(&dir.join(CA_FILENAME), bundle.ca_pem().as_bytes(), false)?;
    write_atomic(
        &dir.join(FULLCHAIN_FILENAME),
        bundle.fullchain_pem().as_bytes(),
        false,
    )?;

    tracing::info!(
        path = %dir.display(),
        subject = %bundle.subject(),
        "Certificate files written"
    );

    Ok(dir.to_path_buf())
}

/// Read `cert.pem`, `key.pem` and `ca.pem` from `dir`.
///
/// Returns `Ok(None)` when any of the three is missing.
pub fn read_pem_files(dir: &Path) -> Result<Option<PemFiles>, std::io::Error> {
    let cert_path = dir.join(CERT_FILENAME);
    let key_path = dir.join(KEY_FILENAME);
    let ca_path = dir.join(CA_FILENAME);

    if !cert_path.exists() || !key_path.exists() || !ca_path.exists() {
        return Ok(None);
    }

    Ok(Some(PemFiles {
        cert_pem: std::fs::read_to_string(cert_path)?,
        key_pem: Zeroizing::new(std::fs::read_to_string(key_path)?),
        ca_pem: std::fs::read_to_string(ca_path)?,
    }))
}

/// Write `contents` to `path` via a sibling temp file and rename.
///
/// `private` files are created owner read/write only on Unix.
pub(crate) fn write_atomic(path: &Path, contents: &[u8], private: bool) -> Result<(), std::io::Error> {
    let tmp = path.with_extension("pem.tmp");
    let _ = std::fs::remove_file(&tmp);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if private {
            options.mode(0o600);
        }
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options.open(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)?;
    Ok(())
}
