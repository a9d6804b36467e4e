//! Inspect the worker's persisted certificate bundle.

use std::path::PathBuf;
use std::process::ExitCode;

use tessera_common::paths;
use tessera_pki::certfiles::read_pem_files;
use tessera_pki::CertificateBundle;

pub fn status(cert_dir: Option<PathBuf>, json: bool) -> anyhow::Result<ExitCode> {
    let dir = cert_dir.unwrap_or_else(paths::certs_dir);

    let Some(files) = read_pem_files(&dir)? else {
        if json {
            println!(
                "{}",
                serde_json::json!({ "dir": dir.display().to_string(), "present": false })
            );
        } else {
            println!("No certificate in {}", dir.display());
        }
        return Ok(ExitCode::FAILURE);
    };

    match CertificateBundle::from_pem(&files.cert_pem, &files.key_pem, &files.ca_pem) {
        Ok(bundle) => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "dir": dir.display().to_string(),
                        "present": true,
                        "valid": true,
                        "subject": bundle.subject(),
                        "issuer": bundle.issuer(),
                        "not_before": bundle.not_before().to_rfc3339(),
                        "not_after": bundle.not_after().to_rfc3339(),
                        "days_until_expiration": bundle.days_until_expiration(),
                        "fingerprint": bundle.fingerprint(),
                    }))?
                );
            } else {
                println!("Certificate in {}", dir.display());
                println!("  Subject:      {}", bundle.subject());
                println!("  Issuer:       {}", bundle.issuer());
                println!("  Not before:   {}", bundle.not_before());
                println!("  Not after:    {}", bundle.not_after());
                println!("  Days left:    {}", bundle.days_until_expiration());
                println!("  Fingerprint:  {}", bundle.fingerprint());
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "dir": dir.display().to_string(),
                        "present": true,
                        "valid": false,
                        "error": e.to_string(),
                    })
                );
            } else {
                println!("Certificate in {} is not usable: {e}", dir.display());
            }
            Ok(ExitCode::FAILURE)
        }
    }
}
