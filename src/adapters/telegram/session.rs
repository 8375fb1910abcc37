//! Session credential files. One opaque SQLite file per named session under
//! the sessions directory; created externally, read-only here.

use std::path::{Path, PathBuf};

use grammers_session::storages::SqliteSession;
use tracing::{debug, warn};

use crate::domain::DomainError;

pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn credential_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.session"))
    }

    /// A usable credential file exists and is non-empty. Absence means the
    /// session name is simply not available.
    pub fn verify(&self, name: &str) -> Result<PathBuf, DomainError> {
        let path = self.credential_path(name);
        let metadata = std::fs::metadata(&path).map_err(|_| {
            DomainError::Config(format!("no session file for '{name}' at {}", path.display()))
        })?;
        if metadata.len() == 0 {
            return Err(DomainError::Config(format!(
                "session file for '{name}' is empty: {}",
                path.display()
            )));
        }
        debug!(session = %name, path = %path.display(), "session file found");
        Ok(path)
    }

    /// Names from `requested` that have usable credential files.
    pub fn available(&self, requested: &[String]) -> Vec<String> {
        let available: Vec<String> = requested
            .iter()
            .filter(|name| match self.verify(name) {
                Ok(_) => true,
                Err(e) => {
                    warn!(session = %name, error = %e, "session unavailable");
                    false
                }
            })
            .cloned()
            .collect();
        debug!(available = available.len(), requested = requested.len(), "session files checked");
        available
    }

    /// Open the persistent session storage. The caller must have verified
    /// the file first; opening never creates a new one.
    pub async fn open(&self, name: &str) -> Result<SqliteSession, DomainError> {
        let path = self.verify(name)?;
        open_session_file(&path).await
    }
}

async fn open_session_file(path: &Path) -> Result<SqliteSession, DomainError> {
    SqliteSession::open(path)
        .await
        .map_err(|e| DomainError::Auth(format!("open session file {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(files: &[(&str, &[u8])]) -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            std::fs::write(dir.path().join(format!("{name}.session")), contents).unwrap();
        }
        let store = SessionStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_verify_existing_file() {
        let (_dir, store) = store_with(&[("alpha", b"data")]);
        assert!(store.verify("alpha").is_ok());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let (_dir, store) = store_with(&[]);
        assert!(matches!(store.verify("ghost"), Err(DomainError::Config(_))));
    }

    #[test]
    fn test_empty_file_rejected() {
        let (_dir, store) = store_with(&[("hollow", b"")]);
        assert!(matches!(store.verify("hollow"), Err(DomainError::Config(_))));
    }

    #[test]
    fn test_available_filters_and_keeps_order() {
        let (_dir, store) = store_with(&[("a", b"x"), ("c", b"y")]);
        let requested = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(store.available(&requested), vec!["a", "c"]);
    }
}
