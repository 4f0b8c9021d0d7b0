use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use russh_keys::key::KeyPair;

use crate::error::{Error, Result};

/// Loads the server's host key, creating and persisting a fresh ed25519 key
/// on first start.
pub fn load_or_generate(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        return Ok(russh_keys::load_secret_key(path, None)?);
    }

    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| Error::Config("failed to generate host key".to_string()))?;

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)?.write_all(&pem)?;

    tracing::info!(path = %path.display(), "Generated SSH host key");
    Ok(key)
}
