//! Watched roots.
//!
//! A `Root` is shared by every client watching the same directory; its
//! lifetime is that of the longest holder. It owns the view, the clock,
//! the cookie table, the asserted-states queue, the unilateral publisher
//! and the registered triggers, plus the watcher thread keeping the view
//! current.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::config::Config;
use crate::daemon::clock::RootClock;
use crate::daemon::cookie::{CookieSync, CookieSyncError};
use crate::daemon::publish::Publisher;
use crate::daemon::states::{AssertedStates, ClientStateAssertion};
use crate::daemon::view::{InMemoryView, QueryableView};
use crate::daemon::watcher::RootWatcher;
use crate::trigger::TriggerCommand;

#[derive(Debug, Error)]
pub enum RootError {
    #[error("unable to resolve root {0:?}: directory is not watched")]
    NotWatched(String),

    #[error("unable to watch {path:?}: {message}")]
    Open { path: PathBuf, message: String },
}

pub struct Root {
    path: PathBuf,
    sock_path: PathBuf,
    clock: Arc<RootClock>,
    view: Arc<InMemoryView>,
    pub cookies: Arc<CookieSync>,
    pub asserted_states: Mutex<AssertedStates>,
    pub unilateral_responses: Arc<Publisher>,
    pub triggers: Mutex<BTreeMap<String, Arc<TriggerCommand>>>,
    state_trans_count: AtomicU64,
    cursors: Mutex<HashMap<String, u64>>,
    watcher: Mutex<Option<RootWatcher>>,
    cancelled: AtomicBool,
}

impl Root {
    /// Watch `path`: canonicalize it, crawl it, and start the watcher
    /// thread feeding the view.
    pub fn open(path: &Path, sock_path: PathBuf, config: &Config) -> Result<Arc<Self>, RootError> {
        let canonical = path.canonicalize().map_err(|e| RootError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if !canonical.is_dir() {
            return Err(RootError::Open {
                path: canonical,
                message: "not a directory".into(),
            });
        }

        let clock = Arc::new(RootClock::new());
        let view = Arc::new(InMemoryView::new(Arc::clone(&clock)));
        let cookies = Arc::new(CookieSync::new(canonical.clone()));
        let publisher = Arc::new(Publisher::new());

        let root = Arc::new(Self {
            path: canonical.clone(),
            sock_path,
            clock: Arc::clone(&clock),
            view: Arc::clone(&view),
            cookies: Arc::clone(&cookies),
            asserted_states: Mutex::new(AssertedStates::default()),
            unilateral_responses: Arc::clone(&publisher),
            triggers: Mutex::new(BTreeMap::new()),
            state_trans_count: AtomicU64::new(0),
            cursors: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        });

        let watcher = RootWatcher::spawn(
            canonical.clone(),
            view,
            cookies,
            publisher,
            clock,
            config.settle_period(),
            config.gc_age(),
        )
        .map_err(|e| RootError::Open {
            path: canonical,
            message: e.to_string(),
        })?;
        *root.watcher.lock().expect("watcher slot poisoned") = Some(watcher);

        tracing::info!(root = %root.path.display(), "now watching");
        Ok(root)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn path_str(&self) -> String {
        self.path.display().to_string()
    }

    pub fn sock_path(&self) -> &Path {
        &self.sock_path
    }

    pub fn clock(&self) -> &Arc<RootClock> {
        &self.clock
    }

    pub fn view(&self) -> &Arc<InMemoryView> {
        &self.view
    }

    pub fn view_dyn(&self) -> &dyn QueryableView {
        self.view.as_ref()
    }

    pub fn current_clock_string(&self) -> String {
        self.view.current_clock_string()
    }

    /// Linearize the caller against the watcher: returns once the watcher
    /// has observed a marker created now. A zero timeout disables the
    /// barrier entirely.
    pub fn sync_to_now(&self, timeout: Duration) -> Result<(), CookieSyncError> {
        if timeout.is_zero() {
            return Ok(());
        }
        let mut cookie_file_names = Vec::new();
        let handle = self.cookies.sync(&mut cookie_file_names)?;
        tracing::trace!(root = %self.path.display(), cookies = ?cookie_file_names, "sync");
        handle.wait(timeout)
    }

    pub fn bump_state_trans_count(&self) -> u64 {
        self.state_trans_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn state_trans_count(&self) -> u64 {
        self.state_trans_count.load(Ordering::Acquire)
    }

    /// Remove `assertion` from the state queue. If this promotes a
    /// successor with a buffered enter payload, broadcast it before the
    /// queue lock is released so no later transition can overtake it.
    pub fn remove_assertion(&self, assertion: &Arc<ClientStateAssertion>) {
        let mut states = self
            .asserted_states
            .lock()
            .expect("asserted states poisoned");
        if let Some(payload) = states.remove_assertion(assertion) {
            self.unilateral_responses.enqueue(payload);
        }
    }

    pub fn resolve_cursor(&self, name: &str) -> Option<u64> {
        self.cursors
            .lock()
            .expect("cursor table poisoned")
            .get(name)
            .copied()
    }

    pub fn update_cursor(&self, name: &str, ticks: u64) {
        self.cursors
            .lock()
            .expect("cursor table poisoned")
            .insert(name.to_string(), ticks);
    }

    /// Tear the root down: stop triggers, fail outstanding cookie syncs,
    /// stop the watcher. Idempotent.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(root = %self.path.display(), "cancelling watch");

        let triggers: Vec<Arc<TriggerCommand>> = {
            let mut map = self.triggers.lock().expect("trigger table poisoned");
            std::mem::take(&mut *map).into_values().collect()
        };
        for trigger in triggers {
            trigger.stop();
        }

        self.cookies.abort_all();

        if let Some(watcher) = self
            .watcher
            .lock()
            .expect("watcher slot poisoned")
            .take()
        {
            watcher.stop();
        }
    }
}

impl Drop for Root {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// All currently-watched roots, shared by every client session.
pub struct RootRegistry {
    roots: Mutex<HashMap<PathBuf, Arc<Root>>>,
    sock_path: PathBuf,
    config: Config,
}

impl RootRegistry {
    pub fn new(sock_path: PathBuf, config: Config) -> Self {
        Self {
            roots: Mutex::new(HashMap::new()),
            sock_path,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Look up a watched root, optionally creating it on first use.
    pub fn resolve(&self, path: &str, create: bool) -> Result<Arc<Root>, RootError> {
        let requested = PathBuf::from(path);
        let canonical = requested.canonicalize().unwrap_or(requested);

        let mut roots = self.roots.lock().expect("root table poisoned");
        if let Some(root) = roots.get(&canonical) {
            return Ok(Arc::clone(root));
        }
        if !create {
            return Err(RootError::NotWatched(path.to_string()));
        }
        let root = Root::open(&canonical, self.sock_path.clone(), &self.config)?;
        roots.insert(root.path().to_path_buf(), Arc::clone(&root));
        Ok(root)
    }

    /// Stop watching `path`. The root is cancelled; clients still holding
    /// it keep a dead but safe handle.
    pub fn remove(&self, path: &str) -> Option<Arc<Root>> {
        let requested = PathBuf::from(path);
        let canonical = requested.canonicalize().unwrap_or(requested);
        let root = self
            .roots
            .lock()
            .expect("root table poisoned")
            .remove(&canonical)?;
        root.cancel();
        Some(root)
    }

    pub fn list(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .roots
            .lock()
            .expect("root table poisoned")
            .keys()
            .map(|p| p.display().to_string())
            .collect();
        paths.sort();
        paths
    }

    /// Daemon shutdown: cancel everything.
    pub fn cancel_all(&self) {
        let roots: Vec<Arc<Root>> = {
            let mut map = self.roots.lock().expect("root table poisoned");
            map.drain().map(|(_, root)| root).collect()
        };
        for root in roots {
            root.cancel();
        }
    }
}
