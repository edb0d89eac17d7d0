//! Single-writer file lock for DuckDB databases.
//!
//! DuckDB allows one writing process per file. Writers take an exclusive
//! `fs2` lock on `<db>.lock` and leave a JSON sidecar naming the holder, so a
//! second `ebbflow run` can say who it is waiting on.

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Database is locked by another process: {}{}", .path.display(), holder_suffix(.holder))]
    Locked {
        path: PathBuf,
        holder: Option<LockHolder>,
    },

    #[error("Failed to create lock file: {0}")]
    CreateFailed(#[source] io::Error),

    #[error("Failed to acquire lock: {0}")]
    AcquireFailed(#[source] io::Error),
}

fn holder_suffix(holder: &Option<LockHolder>) -> String {
    match holder {
        Some(h) => format!(" (pid {} since {})", h.pid, h.timestamp),
        None => String::new(),
    }
}

/// Process that wrote the lock sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub exe: Option<String>,
    pub timestamp: String,
}

/// Holds the exclusive lock until dropped.
pub struct DbLockGuard {
    _file: File,
    lock_path: PathBuf,
    sidecar_path: Option<PathBuf>,
}

impl DbLockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for DbLockGuard {
    fn drop(&mut self) {
        debug!("Releasing database lock: {}", self.lock_path.display());
        if let Some(path) = &self.sidecar_path {
            if let Err(e) = fs::remove_file(path) {
                debug!("Failed to remove lock sidecar {}: {}", path.display(), e);
            }
        }
    }
}

impl std::fmt::Debug for DbLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbLockGuard")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

/// `/data/w.duckdb` → `/data/w.duckdb.lock`; `/data/w` → `/data/w.lock`.
pub fn lock_path_for(db_path: &Path) -> PathBuf {
    let mut lock_path = db_path.to_path_buf();
    match lock_path.extension() {
        Some(ext) => {
            let new_ext = format!("{}.lock", ext.to_string_lossy());
            lock_path.set_extension(new_ext);
        }
        None => {
            lock_path.set_extension("lock");
        }
    }
    lock_path
}

fn sidecar_path_for(lock_path: &Path) -> PathBuf {
    let mut name = lock_path.as_os_str().to_os_string();
    name.push(".json");
    PathBuf::from(name)
}

fn write_sidecar(lock_path: &Path) -> Option<PathBuf> {
    let holder = LockHolder {
        pid: std::process::id(),
        exe: std::env::current_exe().ok().map(|p| p.display().to_string()),
        timestamp: Utc::now().to_rfc3339(),
    };
    let path = sidecar_path_for(lock_path);
    let written = serde_json::to_vec_pretty(&holder)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        .and_then(|payload| fs::write(&path, payload));
    match written {
        Ok(()) => Some(path),
        Err(e) => {
            warn!("Failed to write lock sidecar {}: {}", path.display(), e);
            None
        }
    }
}

/// Best-effort read of the current holder.
pub fn read_holder(db_path: &Path) -> Option<LockHolder> {
    let payload = fs::read(sidecar_path_for(&lock_path_for(db_path))).ok()?;
    serde_json::from_slice(&payload).ok()
}

/// Take the exclusive writer lock without waiting.
pub fn try_lock_exclusive(db_path: &Path) -> Result<DbLockGuard, LockError> {
    let lock_path = lock_path_for(db_path);
    debug!("Attempting to acquire exclusive lock: {}", lock_path.display());

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(LockError::CreateFailed)?;

    // Fully qualified: std's File::try_lock_exclusive (1.89+) has a different error type.
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            info!("Acquired exclusive database lock: {}", lock_path.display());
            let sidecar_path = write_sidecar(&lock_path);
            Ok(DbLockGuard {
                _file: file,
                lock_path,
                sidecar_path,
            })
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(LockError::Locked {
            path: db_path.to_path_buf(),
            holder: read_holder(db_path),
        }),
        Err(e) => Err(LockError::AcquireFailed(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_path_for() {
        assert_eq!(
            lock_path_for(Path::new("/data/warehouse.duckdb")),
            PathBuf::from("/data/warehouse.duckdb.lock")
        );
        assert_eq!(
            lock_path_for(Path::new("/data/warehouse")),
            PathBuf::from("/data/warehouse.lock")
        );
    }

    #[test]
    fn test_sidecar_written_and_removed() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("warehouse.duckdb");

        let guard = try_lock_exclusive(&db_path).unwrap();
        let holder = read_holder(&db_path).unwrap();
        assert_eq!(holder.pid, std::process::id());
        assert!(guard.lock_path().exists());

        drop(guard);
        assert!(read_holder(&db_path).is_none());
    }

    #[test]
    fn test_second_writer_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("warehouse.duckdb");

        let _guard = try_lock_exclusive(&db_path).unwrap();
        match try_lock_exclusive(&db_path) {
            Err(LockError::Locked { path, holder }) => {
                assert_eq!(path, db_path);
                assert_eq!(holder.map(|h| h.pid), Some(std::process::id()));
            }
            other => panic!("expected Locked, got {:?}", other),
        }
    }

    #[test]
    fn test_relock_after_drop() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("warehouse.duckdb");

        let guard = try_lock_exclusive(&db_path).unwrap();
        drop(guard);
        let _again = try_lock_exclusive(&db_path).unwrap();
    }
}
