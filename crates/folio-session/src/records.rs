use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use folio_core::transport::{SessionState, TransportError};
use folio_keys::fs::{
    ensure_directory, remove_if_exists, write_atomic, PRIVATE_DIR_MODE, PRIVATE_FILE_MODE,
};
use tracing::{debug, info, instrument, warn};

/// Length of a session id: 32 random bytes in unpadded base64.
pub const SESSION_ID_LEN: usize = 43;

/// Server-side session state, one JSON file per session id.
#[derive(Debug, Clone)]
pub struct SessionRecords {
    root: PathBuf,
}

impl SessionRecords {
    /// Open (and harden) the record directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, TransportError> {
        let root = root.into();
        ensure_directory(&root, PRIVATE_DIR_MODE).map_err(backend_err)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stored state for `id`. Unknown ids, malformed ids and corrupt records
    /// all read as absent.
    #[instrument(skip_all)]
    pub fn load(&self, id: &str) -> Result<Option<SessionState>, TransportError> {
        let Some(path) = self.path_for(id) else {
            return Ok(None);
        };
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(backend_err(err)),
        };
        match serde_json::from_slice(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(err) => {
                debug!(error = %err, "discarding corrupt session record");
                Ok(None)
            }
        }
    }

    #[instrument(skip_all)]
    pub fn save(&self, id: &str, state: &SessionState) -> Result<(), TransportError> {
        let path = self.path_for(id).ok_or_else(|| TransportError::Backend {
            reason: "invalid session id".to_string(),
        })?;
        let json = serde_json::to_vec(state).map_err(backend_err)?;
        write_atomic(&path, &json, PRIVATE_FILE_MODE).map_err(backend_err)
    }

    #[instrument(skip_all)]
    pub fn remove(&self, id: &str) -> Result<(), TransportError> {
        match self.path_for(id) {
            Some(path) => remove_if_exists(&path).map_err(backend_err),
            None => Ok(()),
        }
    }

    /// Remove records not written for longer than `max_idle`. Every commit
    /// rewrites its record, so the file's mtime is the session's last use.
    /// Returns how many were removed.
    #[instrument(skip(self))]
    pub fn purge_idle(&self, max_idle: Duration) -> Result<usize, TransportError> {
        let entries = fs::read_dir(&self.root).map_err(backend_err)?;
        let now = SystemTime::now();
        let mut purged = 0;
        for path in entries.filter_map(Result::ok).map(|entry| entry.path()) {
            if !is_record_file(&path) {
                continue;
            }
            let idle = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if !idle.is_some_and(|idle| idle > max_idle) {
                continue;
            }
            match remove_if_exists(&path) {
                Ok(()) => purged += 1,
                Err(err) => warn!(path = %path.display(), error = %err, "cannot purge session record"),
            }
        }
        if purged > 0 {
            info!(purged, "purged idle session records");
        }
        Ok(purged)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.path_for(id).is_some_and(|path| path.is_file())
    }

    fn path_for(&self, id: &str) -> Option<PathBuf> {
        is_valid_id(id).then(|| self.root.join(format!("{id}.json")))
    }
}

/// Ids are exactly what we issue: 43 URL-safe base64 characters.
pub fn is_valid_id(id: &str) -> bool {
    id.len() == SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn is_record_file(path: &Path) -> bool {
    let json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "json");
    let named = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(is_valid_id);
    json && named && path.is_file()
}

fn backend_err<E: ToString>(err: E) -> TransportError {
    TransportError::Backend {
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const ID: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

    #[test]
    fn save_load_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let records = SessionRecords::open(dir.path().join("sessions")).expect("open");

        let mut state = SessionState::new();
        state.insert("hello".into(), json!(1));
        records.save(ID, &state).expect("save");
        assert!(records.contains(ID));
        assert_eq!(records.load(ID).expect("load"), Some(state));

        records.remove(ID).expect("remove");
        records.remove(ID).expect("remove again");
        assert_eq!(records.load(ID).expect("load"), None);
    }

    #[test]
    fn rejects_path_like_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let records = SessionRecords::open(dir.path()).expect("open");
        assert!(!is_valid_id("../../etc/passwd"));
        assert_eq!(records.load("../../etc/passwd").expect("load"), None);
        assert!(records.save("short", &SessionState::new()).is_err());
    }

    fn age(path: &Path, by: Duration) {
        fs::File::options()
            .write(true)
            .open(path)
            .expect("open record")
            .set_modified(SystemTime::now() - by)
            .expect("set mtime");
    }

    #[test]
    fn purge_idle_removes_only_stale_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let records = SessionRecords::open(dir.path()).expect("open");
        let fresh = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";
        records.save(ID, &SessionState::new()).expect("save");
        records.save(fresh, &SessionState::new()).expect("save");
        fs::write(dir.path().join("notes.json"), b"{}").expect("write");
        age(&dir.path().join(format!("{ID}.json")), Duration::from_secs(7_200));
        age(&dir.path().join("notes.json"), Duration::from_secs(7_200));

        let purged = records
            .purge_idle(Duration::from_secs(3_600))
            .expect("purge");
        assert_eq!(purged, 1);
        assert!(!records.contains(ID));
        assert!(records.contains(fresh));
        assert!(dir.path().join("notes.json").exists());
    }

    #[test]
    fn corrupt_records_read_as_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let records = SessionRecords::open(dir.path()).expect("open");
        fs::write(dir.path().join(format!("{ID}.json")), b"[1,2").expect("write");
        assert_eq!(records.load(ID).expect("load"), None);
    }
}
