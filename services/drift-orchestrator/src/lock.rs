//! Process-level run lock over the shared filesystem state.
//!
//! The lock is a lease file created with `create_new`; its JSON body names the holder. A lease
//! older than the configured duration is treated as abandoned and taken over under a sidecar
//! takeover guard.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LockError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub run_id: Uuid,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn age(&self) -> Option<Duration> { (Utc::now() - self.acquired_at).to_std().ok() }
}

/// Held until dropped.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    run_id: Uuid,
}

impl RunLock {
    pub fn acquire(path: &Path, lease: Duration, run_id: Uuid) -> Result<Self, LockError> {
        if let Some(lock) = Self::try_create(path, run_id)? {
            return Ok(lock);
        }
        let holder = Self::inspect(path)?;
        if !is_stale(path, holder.as_ref(), lease) {
            return Err(held(path, holder));
        }
        warn!(path = %path.display(), ?holder, ?lease, "taking over stale run lock");

        // Removing a lease is only allowed under the takeover guard, and the guard is kept until
        // our own lease exists, so two takers can never both clear and claim.
        let _guard = TakeoverGuard::acquire(path, lease)?;
        if fs::symlink_metadata(path).is_ok() {
            let holder = Self::inspect(path)?;
            if !is_stale(path, holder.as_ref(), lease) {
                return Err(held(path, holder));
            }
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(LockError::Io { path: path.to_path_buf(), source }),
            }
        }
        match Self::try_create(path, run_id)? {
            Some(lock) => Ok(lock),
            None => Err(held(path, Self::inspect(path)?)),
        }
    }

    /// `None` when the lock file already exists.
    fn try_create(path: &Path, run_id: Uuid) -> Result<Option<Self>, LockError> {
        let io_err = |source: std::io::Error| LockError::Io { path: path.to_path_buf(), source };
        let mut f = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(io_err(e)),
        };
        let record = LeaseRecord { run_id, pid: std::process::id(), acquired_at: Utc::now() };
        let body = serde_json::to_vec(&record).map_err(|e| io_err(e.into()))?;
        if let Err(e) = f.write_all(&body).and_then(|_| f.sync_all()) {
            let _ = fs::remove_file(path);
            return Err(io_err(e));
        }
        debug!(path = %path.display(), %run_id, "run lock acquired");
        Ok(Some(Self { path: path.to_path_buf(), run_id }))
    }

    /// Current holder, if the lock file exists and parses.
    pub fn inspect(path: &Path) -> Result<Option<LeaseRecord>, LockError> {
        match fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(LockError::Io { path: path.to_path_buf(), source }),
        }
    }

    pub fn run_id(&self) -> Uuid { self.run_id }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // only remove a lease that is still ours
        if let Ok(Some(rec)) = Self::inspect(&self.path) {
            if rec.run_id == self.run_id {
                if let Err(e) = fs::remove_file(&self.path) { warn!(path = %self.path.display(), error = %e, "could not release run lock"); }
                else { debug!(run_id = %self.run_id, "run lock released"); }
            }
        }
    }
}

fn held(path: &Path, holder: Option<LeaseRecord>) -> LockError {
    let holder = holder
        .map(|h| format!("run {} (pid {}) since {}", h.run_id, h.pid, h.acquired_at.to_rfc3339()))
        .unwrap_or_else(|| "an unidentified process".to_string());
    LockError::Held { path: path.to_path_buf(), holder }
}

/// Sidecar `<lock>.takeover` file, present while one process replaces a stale lease.
struct TakeoverGuard(PathBuf);

impl TakeoverGuard {
    fn acquire(lock_path: &Path, lease: Duration) -> Result<Self, LockError> {
        let mut name = lock_path.as_os_str().to_owned();
        name.push(".takeover");
        let path = PathBuf::from(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self(path)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // a taker that died mid-takeover; clear it for the next attempt
                if is_stale(&path, None, lease) {
                    warn!(path = %path.display(), "removing abandoned takeover guard");
                    let _ = fs::remove_file(&path);
                }
                Err(LockError::Held { path: lock_path.to_path_buf(), holder: "a concurrent takeover".to_string() })
            }
            Err(source) => Err(LockError::Io { path, source }),
        }
    }
}

impl Drop for TakeoverGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.0) { warn!(path = %self.0.display(), error = %e, "could not remove takeover guard"); }
    }
}

fn is_stale(path: &Path, holder: Option<&LeaseRecord>, lease: Duration) -> bool {
    match holder {
        Some(rec) => rec.age().map(|age| age > lease).unwrap_or(false),
        // unparsable: could be mid-write, fall back to mtime
        None => fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .map(|age| age > lease)
            .unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(3600);

    #[test]
    fn second_acquire_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".churnguard.lock");
        let first = RunLock::acquire(&path, LEASE, Uuid::new_v4()).unwrap();
        let err = RunLock::acquire(&path, LEASE, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, LockError::Held { ref holder, .. } if holder.contains(&first.run_id().to_string())));
        drop(first);
        assert!(!path.exists());
        RunLock::acquire(&path, LEASE, Uuid::new_v4()).unwrap();
    }

    #[test]
    fn stale_lease_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".churnguard.lock");
        let old = LeaseRecord { run_id: Uuid::new_v4(), pid: 1, acquired_at: Utc::now() - chrono::Duration::hours(2) };
        fs::write(&path, serde_json::to_vec(&old).unwrap()).unwrap();
        let lock = RunLock::acquire(&path, LEASE, Uuid::new_v4()).unwrap();
        assert_eq!(RunLock::inspect(&path).unwrap().unwrap().run_id, lock.run_id());
    }

    #[test]
    fn racing_takers_of_a_stale_lease_get_one_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".churnguard.lock");
        let old = LeaseRecord { run_id: Uuid::new_v4(), pid: 1, acquired_at: Utc::now() - chrono::Duration::hours(2) };
        fs::write(&path, serde_json::to_vec(&old).unwrap()).unwrap();

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8).map(|_| {
            let (path, barrier) = (path.clone(), barrier.clone());
            std::thread::spawn(move || {
                barrier.wait();
                RunLock::acquire(&path, LEASE, Uuid::new_v4())
            })
        }).collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<&RunLock> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(RunLock::inspect(&path).unwrap().unwrap().run_id, winners[0].run_id());
        assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(e, LockError::Held { .. })));
        assert!(!dir.path().join(".churnguard.lock.takeover").exists());
    }

    #[test]
    fn takeover_in_progress_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".churnguard.lock");
        let old = LeaseRecord { run_id: Uuid::new_v4(), pid: 1, acquired_at: Utc::now() - chrono::Duration::hours(2) };
        fs::write(&path, serde_json::to_vec(&old).unwrap()).unwrap();
        fs::write(dir.path().join(".churnguard.lock.takeover"), b"").unwrap();
        assert!(matches!(RunLock::acquire(&path, LEASE, Uuid::new_v4()), Err(LockError::Held { ref holder, .. }) if holder.contains("takeover")));
        assert_eq!(RunLock::inspect(&path).unwrap().unwrap(), old);
    }

    #[test]
    fn fresh_unparsable_lock_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".churnguard.lock");
        fs::write(&path, b"{\"run_id\":").unwrap();
        assert!(matches!(RunLock::acquire(&path, LEASE, Uuid::new_v4()), Err(LockError::Held { .. })));
    }

    #[test]
    fn drop_leaves_a_foreign_lease_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".churnguard.lock");
        let lock = RunLock::acquire(&path, LEASE, Uuid::new_v4()).unwrap();
        let other = LeaseRecord { run_id: Uuid::new_v4(), pid: 2, acquired_at: Utc::now() };
        fs::write(&path, serde_json::to_vec(&other).unwrap()).unwrap();
        drop(lock);
        assert!(path.exists());
    }
}
