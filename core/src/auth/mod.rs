use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::errors::GinError;

pub mod ssh;

lazy_static! {
    // Per-alias token cache for the lifetime of the process.
    static ref TOKEN_CACHE: RwLock<HashMap<String, UserToken>> = RwLock::new(HashMap::new());
}

/// Bearer material for one server alias. Its presence on disk is the sole
/// "logged in" signal; no validity probe happens on load.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UserToken {
    pub username: String,
    pub token: String,
}

fn token_path(dir: &Path, alias: &str) -> PathBuf {
    dir.join(alias)
}

/// Loads the token for `alias`, hitting the in-process cache first.
/// Returns None when no token file exists (not logged in).
pub fn load_token(dir: &Path, alias: &str) -> Result<Option<UserToken>, GinError> {
    if let Some(token) = TOKEN_CACHE.read().get(alias) {
        return Ok(Some(token.clone()));
    }

    let path = token_path(dir, alias);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut lines = text.lines();
    let token = match (lines.next(), lines.next()) {
        (Some(username), Some(token)) if !username.is_empty() && !token.is_empty() => UserToken {
            username: username.to_string(),
            token: token.to_string(),
        },
        _ => {
            return Err(GinError::usage(
                "load-token",
                format!("token file for '{}' is malformed; log in again", alias),
            ))
        }
    };

    TOKEN_CACHE
        .write()
        .insert(alias.to_string(), token.clone());
    Ok(Some(token))
}

/// Persists a token for `alias`: one line username, one line token.
/// An existing token for the alias is overwritten (login is destructive).
pub fn save_token(dir: &Path, alias: &str, token: &UserToken) -> Result<(), GinError> {
    fs::create_dir_all(dir)?;
    let path = token_path(dir, alias);
    fs::write(&path, format!("{}\n{}\n", token.username, token.token))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    }
    TOKEN_CACHE
        .write()
        .insert(alias.to_string(), token.clone());
    debug!("Stored token for {}@{}", token.username, alias);
    Ok(())
}

/// Removes the token for `alias` from disk and cache. Missing files are
/// not an error; logout is idempotent.
pub fn delete_token(dir: &Path, alias: &str) -> Result<(), GinError> {
    TOKEN_CACHE.write().remove(alias);
    match fs::remove_file(token_path(dir, alias)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let token = UserToken {
            username: "alice".into(),
            token: "deadbeef".into(),
        };
        save_token(dir.path(), "testalias-rt", &token).unwrap();

        let loaded = load_token(dir.path(), "testalias-rt").unwrap().unwrap();
        assert_eq!(loaded, token);

        // file format: one line username, one line token
        let raw = fs::read_to_string(dir.path().join("testalias-rt")).unwrap();
        assert_eq!(raw, "alice\ndeadbeef\n");

        delete_token(dir.path(), "testalias-rt").unwrap();
        TOKEN_CACHE.write().remove("testalias-rt");
        assert!(load_token(dir.path(), "testalias-rt").unwrap().is_none());
    }

    #[test]
    fn missing_token_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_token(dir.path(), "testalias-none").unwrap().is_none());
    }

    #[test]
    fn malformed_token_file_is_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("testalias-bad"), "onlyoneline\n").unwrap();
        let err = load_token(dir.path(), "testalias-bad").unwrap_err();
        assert!(matches!(err, GinError::Usage { .. }));
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        delete_token(dir.path(), "testalias-gone").unwrap();
        delete_token(dir.path(), "testalias-gone").unwrap();
    }
}
