//! The per-installation secret keying installation report seals.

use hangar_core::{Error, Result};
use rand::RngCore;
use std::fs;
use std::path::Path;
use tracing::debug;

/// File name of the secret inside the installed-packages directory.
const SECRET_FILE: &str = ".installation-secret";

/// Load the per-installation secret for `installed_dir`, generating and
/// persisting a fresh one (0600) on first use.
///
/// Both the package database (verification) and the installer (sealing) must
/// be configured with the same secret.
///
/// # Errors
/// Fails if the secret file cannot be read or written.
pub fn ensure_installation_secret(installed_dir: &Path) -> Result<Vec<u8>> {
    fs::create_dir_all(installed_dir).map_err(|e| Error::io(installed_dir, e))?;
    let path = installed_dir.join(SECRET_FILE);

    if let Ok(contents) = fs::read_to_string(&path) {
        let trimmed = contents.trim();
        if let Ok(secret) = hex::decode(trimmed) {
            if !secret.is_empty() {
                return Ok(secret);
            }
        }
        return Err(Error::Cryptography(format!(
            "the installation secret at {} is malformed",
            path.display()
        )));
    }

    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    fs::write(&path, hex::encode(&secret)).map_err(|e| Error::io(&path, e))?;
    restrict_permissions(&path);
    debug!(path = %path.display(), "generated a new installation secret");
    Ok(secret)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_is_stable_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let first = ensure_installation_secret(dir.path()).unwrap();
        let second = ensure_installation_secret(dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn malformed_secret_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SECRET_FILE), "not-hex!").unwrap();
        assert!(ensure_installation_secret(dir.path()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn secret_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        ensure_installation_secret(dir.path()).unwrap();
        let mode = fs::metadata(dir.path().join(SECRET_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
