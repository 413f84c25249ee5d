//! Cookie sync: a causal barrier between logical events and the watcher.
//!
//! `sync` drops a uniquely-named marker file under the root and hands back
//! a handle that completes when the watcher reports having observed that
//! file. Completion is the filesystem's own acknowledgement; there is no
//! sleeping or polling here.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CookieSyncError {
    #[error("sync timed out after {0:?}")]
    Timeout(Duration),

    #[error("root destroyed before cookie was observed")]
    Aborted,

    #[error("failed to create cookie file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Completion side of one `sync` call.
#[derive(Debug)]
pub struct SyncHandle {
    rx: Receiver<Result<(), CookieSyncError>>,
}

impl SyncHandle {
    /// Block until the cookie is observed, the sync is aborted, or
    /// `timeout` elapses. No partial success: any failure is final.
    pub fn wait(self, timeout: Duration) -> Result<(), CookieSyncError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CookieSyncError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(CookieSyncError::Aborted),
        }
    }
}

type Waiters = HashMap<PathBuf, Sender<Result<(), CookieSyncError>>>;

pub struct CookieSync {
    dir: PathBuf,
    prefix: String,
    serial: AtomicU64,
    outstanding: Mutex<Waiters>,
}

impl CookieSync {
    /// Cookie files land directly under `dir` (the watched root).
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            prefix: format!(".fswatchd-cookie-{}-", std::process::id()),
            serial: AtomicU64::new(0),
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    pub fn cookie_prefix(&self) -> &str {
        &self.prefix
    }

    /// True when `name` (a bare file name) is one of our markers.
    pub fn is_cookie_name(&self, name: &str) -> bool {
        name.starts_with(&self.prefix)
    }

    /// Create a marker file and register a waiter for its observation.
    ///
    /// The created file name is appended to `cookie_file_names` so callers
    /// can report which cookies they are blocked on.
    pub fn sync(&self, cookie_file_names: &mut Vec<String>) -> Result<SyncHandle, CookieSyncError> {
        let serial = self.serial.fetch_add(1, Ordering::AcqRel);
        let name = format!("{}{serial}", self.prefix);
        let path = self.dir.join(&name);

        let (tx, rx) = bounded(1);
        self.outstanding
            .lock()
            .expect("cookie table poisoned")
            .insert(path.clone(), tx);

        if let Err(source) = fs::write(&path, b"") {
            self.outstanding
                .lock()
                .expect("cookie table poisoned")
                .remove(&path);
            return Err(CookieSyncError::Io { path, source });
        }

        cookie_file_names.push(name);
        Ok(SyncHandle { rx })
    }

    /// Called by the watcher when it observes a marker file. Completes the
    /// waiter and removes the file. Unknown paths are ignored (stale
    /// cookies from a previous daemon instance).
    pub fn notify_cookie(&self, path: &Path) {
        let waiter = self
            .outstanding
            .lock()
            .expect("cookie table poisoned")
            .remove(path);
        if let Some(tx) = waiter {
            let _ = tx.send(Ok(()));
        }
        let _ = fs::remove_file(path);
    }

    /// Fail every outstanding sync; used on root teardown.
    pub fn abort_all(&self) {
        let drained: Vec<_> = self
            .outstanding
            .lock()
            .expect("cookie table poisoned")
            .drain()
            .collect();
        for (path, tx) in drained {
            let _ = tx.send(Err(CookieSyncError::Aborted));
            let _ = fs::remove_file(&path);
        }
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().expect("cookie table poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn observation_completes_the_sync() {
        let dir = TempDir::new().unwrap();
        let cookies = CookieSync::new(dir.path().to_path_buf());

        let mut names = Vec::new();
        let handle = cookies.sync(&mut names).unwrap();
        assert_eq!(names.len(), 1);
        let path = dir.path().join(&names[0]);
        assert!(path.exists());

        cookies.notify_cookie(&path);
        handle.wait(Duration::from_secs(1)).unwrap();
        assert!(!path.exists(), "cookie file is removed after observation");
        assert_eq!(cookies.outstanding_count(), 0);
    }

    #[test]
    fn wait_times_out_without_observation() {
        let dir = TempDir::new().unwrap();
        let cookies = CookieSync::new(dir.path().to_path_buf());

        let mut names = Vec::new();
        let handle = cookies.sync(&mut names).unwrap();
        let err = handle.wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, CookieSyncError::Timeout(_)));
    }

    #[test]
    fn abort_fails_outstanding_syncs() {
        let dir = TempDir::new().unwrap();
        let cookies = CookieSync::new(dir.path().to_path_buf());

        let mut names = Vec::new();
        let handle = cookies.sync(&mut names).unwrap();
        cookies.abort_all();
        let err = handle.wait(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CookieSyncError::Aborted));
    }

    #[test]
    fn io_failure_surfaces_and_unregisters() {
        let cookies = CookieSync::new(PathBuf::from("/nonexistent-dir-for-cookie-test"));
        let mut names = Vec::new();
        let err = cookies.sync(&mut names).unwrap_err();
        assert!(matches!(err, CookieSyncError::Io { .. }));
        assert!(names.is_empty());
        assert_eq!(cookies.outstanding_count(), 0);
    }

    #[test]
    fn cookie_names_are_unique() {
        let dir = TempDir::new().unwrap();
        let cookies = CookieSync::new(dir.path().to_path_buf());
        let mut names = Vec::new();
        let _a = cookies.sync(&mut names).unwrap();
        let _b = cookies.sync(&mut names).unwrap();
        assert_ne!(names[0], names[1]);
        assert!(cookies.is_cookie_name(&names[0]));
    }
}
