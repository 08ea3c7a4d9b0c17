use anyhow::{Context, Result};
use std::path::Path;

use super::config::expand_path;
use crate::tls;

/// Generate the root CA clients must trust
pub fn generate_root_ca(
    cert_out: &str,
    key_out: &str,
    common_name: &str,
    days: u32,
) -> Result<()> {
    let cert_path = expand_path(cert_out)?;
    let key_path = expand_path(key_out)?;

    tls::write_root_ca(
        common_name,
        i64::from(days),
        Path::new(&cert_path),
        Path::new(&key_path),
    )
    .context("Failed to generate root CA")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict permissions on {}", key_path))?;
    }

    println!("Generated root CA certificate: {}", cert_path);
    println!("Generated root CA private key: {}", key_path);
    println!("Install the certificate in the trust store of clients to intercept.");

    Ok(())
}
