//! Host key handling

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;

/// Load or generate a host key.
///
/// A generated key is written as PKCS#8 PEM, readable by the owner only.
pub fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    let key = if path.exists() {
        tracing::info!("Loading host key from {:?}", path);
        russh_keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {:?}", path))?
    } else {
        tracing::info!("Generating new host key at {:?}", path);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let key = KeyPair::generate_ed25519()
            .ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"))?;

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("Failed to create host key file {:?}", path))?;
        russh_keys::encode_pkcs8_pem(&key, file)
            .with_context(|| format!("Failed to write host key to {:?}", path))?;

        key
    };

    let public = key
        .clone_public_key()
        .context("Failed to derive public host key")?;
    tracing::info!("Host key fingerprint: {}", public.fingerprint());

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("host_ed25519");

        let first = load_or_generate_host_key(&path).unwrap();
        assert!(path.exists());

        let second = load_or_generate_host_key(&path).unwrap();
        assert_eq!(
            first.clone_public_key().unwrap().fingerprint(),
            second.clone_public_key().unwrap().fingerprint()
        );
    }

    #[test]
    fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_key");
        load_or_generate_host_key(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_garbage_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_key");
        std::fs::write(&path, "not a key").unwrap();

        assert!(load_or_generate_host_key(&path).is_err());
    }
}
