use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// File name of the record the debug backend maintains inside its workspace.
pub const SNAPSHOT_FILE: &str = "target_info.json";

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Error, Debug)]
pub enum SnapshotError {
    /// The record is missing, half-written, or carries no crash section yet.
    #[error("Snapshot record {path:?} unavailable: {reason}")]
    Unavailable { path: PathBuf, reason: String },
}

/// Register dump and backtrace captured at the moment the target faulted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub register_info: String,
    pub backtrace: String,
}

/// The side-channel record written by the debug backend.
///
/// `target_pid` appears once the backend has resolved the inferior; `crash`
/// only after a fatal signal was intercepted.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetRecord {
    #[serde(default)]
    pub target_pid: Option<i32>,
    #[serde(default)]
    pub crash: Option<Snapshot>,
}

/// Best-effort reader for the on-disk record shared with the backend.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_workspace(workspace: &Path) -> Self {
        Self::new(workspace.join(SNAPSHOT_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes a record left by a previous session. A missing file is fine.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    pub fn read(&self) -> Result<TargetRecord, SnapshotError> {
        let content = fs::read_to_string(&self.path).map_err(|e| self.unavailable(e))?;
        serde_json::from_str(&content).map_err(|e| self.unavailable(e))
    }

    /// Used by the backend shim and tests; the orchestrator never writes.
    pub fn write(&self, record: &TargetRecord) -> io::Result<()> {
        let json = serde_json::to_string(record).map_err(io::Error::other)?;
        fs::write(&self.path, json)
    }

    /// The recorded target pid, if the backend has published a usable one.
    pub fn target_pid(&self) -> Option<i32> {
        self.read().ok()?.target_pid.filter(|pid| *pid > 0)
    }

    /// Polls until the record carries a crash section or `wait` elapses.
    pub fn wait_for_crash(&self, wait: Duration) -> Result<Snapshot, SnapshotError> {
        let started = Instant::now();
        loop {
            let last_error = match self.read() {
                Ok(TargetRecord {
                    crash: Some(snapshot),
                    ..
                }) => return Ok(snapshot),
                Ok(_) => self.unavailable("record has no crash section"),
                Err(e) => e,
            };
            if started.elapsed() >= wait {
                return Err(last_error);
            }
            debug!("[snapshot] not yet available: {last_error}");
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn unavailable(&self, reason: impl ToString) -> SnapshotError {
        SnapshotError::Unavailable {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn crash_snapshot() -> Snapshot {
        Snapshot {
            register_info: "rax 0x0 0\nrip 0x401136 0x401136 <main+16>\n".to_string(),
            backtrace: "#0  0x0000000000401136 in main () at test.c:30\n".to_string(),
        }
    }

    #[test]
    fn missing_record_is_unavailable() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::in_workspace(dir.path());
        assert!(matches!(
            store.read(),
            Err(SnapshotError::Unavailable { .. })
        ));
        assert_eq!(store.target_pid(), None);
    }

    #[test]
    fn partial_record_is_unavailable() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::in_workspace(dir.path());
        fs::write(store.path(), r#"{"target_pid": 12"#).unwrap();
        assert!(store.read().is_err());
        assert_eq!(store.target_pid(), None);
    }

    #[test]
    fn reads_record_written_by_backend() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::in_workspace(dir.path());
        fs::write(
            store.path(),
            r#"{"target_pid": 4242, "crash": {"register_info": "r", "backtrace": "b"}}"#,
        )
        .unwrap();
        let record = store.read().unwrap();
        assert_eq!(record.target_pid, Some(4242));
        assert_eq!(record.crash.unwrap().backtrace, "b");
        assert_eq!(store.target_pid(), Some(4242));
    }

    #[test]
    fn non_positive_pid_is_ignored() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::in_workspace(dir.path());
        store
            .write(&TargetRecord {
                target_pid: Some(0),
                crash: None,
            })
            .unwrap();
        assert_eq!(store.target_pid(), None);
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::in_workspace(dir.path());
        store.write(&TargetRecord::default()).unwrap();
        store.clear().unwrap();
        assert!(!store.path().exists());
        store.clear().unwrap();
    }

    #[test]
    fn wait_for_crash_times_out_without_crash_section() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::in_workspace(dir.path());
        store
            .write(&TargetRecord {
                target_pid: Some(7),
                crash: None,
            })
            .unwrap();
        let started = Instant::now();
        let result = store.wait_for_crash(Duration::from_millis(100));
        assert!(result.is_err());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn wait_for_crash_picks_up_late_write() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::in_workspace(dir.path());
        let writer = store.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer
                .write(&TargetRecord {
                    target_pid: Some(7),
                    crash: Some(crash_snapshot()),
                })
                .unwrap();
        });
        let snapshot = store.wait_for_crash(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(snapshot, crash_snapshot());
    }
}
