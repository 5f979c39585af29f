//! Atomic persistence of session metadata.
//!
//! The whole session list lives in one JSON file under the per-user config
//! directory. Writes go through a temp file and rename so a crash can never
//! leave a half-written list behind.

use chrono::{Duration, Utc};
use kojo_core::{PersistedSession, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Sessions older than this are dropped at load time.
pub const RETENTION_DAYS: i64 = 7;

pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store at the default per-user location.
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(kojo_core::settings::sessions_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted session list, dropping entries past the retention
    /// cutoff.
    ///
    /// An absent file is an empty list; a file that exists but fails to
    /// parse is an error. Callers must not run orphan cleanup after an
    /// error, or a corrupt file would mass-kill live mux sessions.
    pub fn load(&self) -> Result<Vec<PersistedSession>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let all: Vec<PersistedSession> = serde_json::from_str(&raw)?;
        let cutoff = Utc::now() - Duration::days(RETENTION_DAYS);
        let (kept, dropped): (Vec<_>, Vec<_>) =
            all.into_iter().partition(|s| s.created_at >= cutoff);
        if !dropped.is_empty() {
            debug!("dropped {} sessions past the retention cutoff", dropped.len());
        }
        Ok(kept)
    }

    /// Atomically replace the session list on disk.
    pub fn save(&self, sessions: &[PersistedSession]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = fs::Permissions::from_mode(0o755);
                fs::set_permissions(parent, perms)?;
            }
        }

        let payload = serde_json::to_string_pretty(sessions)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644))?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kojo_core::{SessionInfo, SessionStatus, ToolKind};

    fn record(id: &str, created_at: chrono::DateTime<Utc>) -> PersistedSession {
        let info = SessionInfo {
            id: id.to_string(),
            tool: ToolKind::Claude,
            work_dir: PathBuf::from("/tmp"),
            args: vec!["--model".to_string(), "opus".to_string()],
            status: SessionStatus::Exited,
            exit_code: Some(0),
            yolo_mode: false,
            internal: false,
            created_at,
            tool_session_id: None,
            parent_id: None,
            mux_name: Some(format!("kojo_{id}")),
            last_cols: 80,
            last_rows: 24,
        };
        PersistedSession::from_info(&info, Some(&b"last bytes"[..]))
    }

    #[test]
    fn absent_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(&path, "{").unwrap();
        let store = SessionStore::new(path);
        assert!(store.load().is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("nested").join("sessions.json"));
        let records = vec![record("s1", Utc::now()), record("s2", Utc::now())];
        store.save(&records).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "s1");
        assert_eq!(loaded[0].args, vec!["--model", "opus"]);
        assert_eq!(loaded[0].decode_last_output().unwrap(), b"last bytes");

        // No temp file left behind.
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn load_filters_by_retention_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions.json"));
        let stale = Utc::now() - Duration::days(RETENTION_DAYS + 1);
        store
            .save(&[record("old", stale), record("new", Utc::now())])
            .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "new");
    }

    #[test]
    fn save_overwrites_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions.json"));
        store.save(&[record("a", Utc::now())]).unwrap();
        store.save(&[record("b", Utc::now())]).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "b");
    }
}
