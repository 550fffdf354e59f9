use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

const SECRET_FILENAME: &str = ".token-secret";

/// Read the token signing secret under `base_dir`, creating it on first start.
pub(super) fn load_or_create_secret_key(base_dir: &Path) -> String {
    let path = secret_file_path(base_dir);

    if let Some(value) = read_secret(&path) {
        return value;
    }

    let new_key = generate_secret_key();

    if let Err(err) = fs::create_dir_all(base_dir) {
        tracing::warn!(error = %err, path = %base_dir.display(), "Failed to create base dir for token secret");
        return new_key;
    }

    match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut file) => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;

                if let Err(err) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
                    tracing::warn!(error = %err, path = %path.display(), "Failed to restrict token secret permissions");
                }
            }

            if let Err(err) = std::io::Write::write_all(&mut file, new_key.as_bytes()) {
                tracing::warn!(error = %err, path = %path.display(), "Failed to write token secret");
            }
            new_key
        }
        // Another process won the race, use its key.
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            read_secret(&path).unwrap_or(new_key)
        }
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "Failed to create token secret");
            new_key
        }
    }
}

fn read_secret(path: &Path) -> Option<String> {
    let value = fs::read_to_string(path).ok()?;
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn generate_secret_key() -> String {
    let mut bytes = [0u8; 64];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn secret_file_path(base_dir: &Path) -> PathBuf {
    base_dir.join(SECRET_FILENAME)
}
