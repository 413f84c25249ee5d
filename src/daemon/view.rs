//! Queryable views over a watched tree.
//!
//! [`QueryableView`] is the capability surface the query executor talks
//! to. Generators a view does not support fail with a not-implemented
//! error so callers can tell capability mismatch from an empty result.
//! [`InMemoryView`] is the standard implementation: a file table kept
//! current by the root's watcher thread.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::daemon::clock::{ClockPosition, RootClock};
use crate::query::eval::QueryContext;
use crate::query::glob::GlobPattern;
use crate::query::{Query, QueryExecError};

/// File kind, rendered as a single character in query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Other,
}

impl FileType {
    pub fn as_char(self) -> char {
        match self {
            FileType::Regular => 'f',
            FileType::Directory => 'd',
            FileType::Symlink => 'l',
            FileType::Other => '?',
        }
    }
}

/// Everything the daemon remembers about one observed file.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub exists: bool,
    pub size: u64,
    pub mode: u32,
    pub mtime_ms: u64,
    pub ctime_ms: u64,
    /// Clock position of the most recent observation of this file.
    pub otime: ClockPosition,
    /// Tick at which this file first appeared in the view.
    pub created_tick: u64,
    pub file_type: FileType,
}

impl FileMeta {
    pub fn new(otime: ClockPosition, file_type: FileType) -> Self {
        Self {
            exists: true,
            size: 0,
            mode: 0,
            mtime_ms: 0,
            ctime_ms: 0,
            otime,
            created_tick: otime.ticks,
            file_type,
        }
    }
}

const VCS_LOCK_FILES: [&str; 2] = [".hg/wlock", ".git/index.lock"];

/// Abstract candidate-file source for the query executor.
pub trait QueryableView: Send + Sync {
    fn clock_position(&self) -> ClockPosition;

    fn current_clock_string(&self) -> String {
        self.clock_position().to_clock_string()
    }

    /// Walk files changed since the query's basis.
    fn time_generator(
        &self,
        _query: &Query,
        _ctx: &mut QueryContext<'_>,
    ) -> Result<(), QueryExecError> {
        Err(QueryExecError::NotImplemented("time_generator"))
    }

    /// Walk files under the query's `path` entries.
    fn path_generator(
        &self,
        _query: &Query,
        _ctx: &mut QueryContext<'_>,
    ) -> Result<(), QueryExecError> {
        Err(QueryExecError::NotImplemented("path_generator"))
    }

    /// Walk files matching the query's `glob` patterns.
    fn glob_generator(
        &self,
        _query: &Query,
        _ctx: &mut QueryContext<'_>,
    ) -> Result<(), QueryExecError> {
        Err(QueryExecError::NotImplemented("glob_generator"))
    }

    /// Walk every file in the view.
    fn all_files_generator(
        &self,
        _query: &Query,
        _ctx: &mut QueryContext<'_>,
    ) -> Result<(), QueryExecError> {
        Err(QueryExecError::NotImplemented("all_files_generator"))
    }

    fn last_age_out_tick(&self) -> u64 {
        0
    }

    fn last_age_out_timestamp(&self) -> Option<SystemTime> {
        None
    }

    /// Forget deleted files whose last observation is older than `ttl`.
    fn age_out(&self, _ttl: Duration) {}

    /// Whether any of the named files currently exists in the view.
    /// Names are wholenames relative to the root, case-sensitive.
    fn any_of_these_files_exist(&self, names: &[&str]) -> bool;

    /// A VCS operation is in progress when a repo lockfile is present.
    fn is_vcs_operation_in_progress(&self) -> bool {
        self.any_of_these_files_exist(&VCS_LOCK_FILES)
    }
}

#[derive(Default)]
struct ViewState {
    files: BTreeMap<String, FileMeta>,
    last_age_out_tick: u64,
    last_age_out_time: Option<SystemTime>,
}

/// The standard view: an in-memory file table fed by the watcher.
pub struct InMemoryView {
    state: Mutex<ViewState>,
    clock: Arc<RootClock>,
}

impl InMemoryView {
    pub fn new(clock: Arc<RootClock>) -> Self {
        Self {
            state: Mutex::new(ViewState::default()),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<RootClock> {
        &self.clock
    }

    /// Record an observation of `wholename`. `disk` is `None` when the
    /// file is gone; deleted entries are retained (marked non-existing)
    /// so `since` queries can report the deletion.
    pub fn record(&self, wholename: &str, disk: Option<DiskInfo>, pos: ClockPosition) {
        let mut state = self.state.lock();
        match disk {
            Some(info) => {
                let entry = state
                    .files
                    .entry(wholename.to_string())
                    .or_insert_with(|| FileMeta::new(pos, info.file_type));
                entry.exists = true;
                entry.size = info.size;
                entry.mode = info.mode;
                entry.mtime_ms = info.mtime_ms;
                entry.ctime_ms = info.ctime_ms;
                entry.file_type = info.file_type;
                entry.otime = pos;
            }
            None => {
                if let Some(entry) = state.files.get_mut(wholename) {
                    entry.exists = false;
                    entry.otime = pos;
                }
            }
        }
    }

    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    fn walk<F>(&self, query: &Query, mut accept: F) -> Result<(), QueryExecError>
    where
        F: FnMut(&str, &FileMeta) -> Result<bool, QueryExecError>,
    {
        let state = self
            .state
            .try_lock_for(query.lock_timeout)
            .ok_or(QueryExecError::LockContention(query.lock_timeout))?;
        for (name, meta) in &state.files {
            if !accept(name, meta)? {
                break;
            }
        }
        Ok(())
    }
}

/// Stat data gathered by the watcher for one path.
#[derive(Debug, Clone, Copy)]
pub struct DiskInfo {
    pub size: u64,
    pub mode: u32,
    pub mtime_ms: u64,
    pub ctime_ms: u64,
    pub file_type: FileType,
}

impl QueryableView for InMemoryView {
    fn clock_position(&self) -> ClockPosition {
        self.clock.position()
    }

    fn time_generator(
        &self,
        query: &Query,
        ctx: &mut QueryContext<'_>,
    ) -> Result<(), QueryExecError> {
        let bound = ctx.since_bound;
        self.walk(query, |name, meta| {
            let changed = if bound.fresh {
                true
            } else if let Some(ticks) = bound.ticks {
                meta.otime.ticks > ticks
            } else if let Some(wall_secs) = bound.wall_secs {
                meta.otime.wall_ms >= wall_secs.saturating_mul(1000)
            } else {
                true
            };
            if changed {
                ctx.candidate(name, meta)?;
            }
            Ok(true)
        })
    }

    fn path_generator(
        &self,
        query: &Query,
        ctx: &mut QueryContext<'_>,
    ) -> Result<(), QueryExecError> {
        let Some(paths) = &query.paths else {
            return Ok(());
        };
        self.walk(query, |name, meta| {
            for spec in paths {
                let matched = if spec.name.is_empty() {
                    true
                } else if name == spec.name {
                    true
                } else {
                    name.len() > spec.name.len()
                        && name.starts_with(&spec.name)
                        && name.as_bytes()[spec.name.len()] == b'/'
                };
                if !matched {
                    continue;
                }
                if spec.depth >= 0 {
                    let tail_start = if spec.name.is_empty() {
                        0
                    } else {
                        spec.name.len() + 1
                    };
                    let extra = name[tail_start.min(name.len())..]
                        .bytes()
                        .filter(|&b| b == b'/')
                        .count() as i64;
                    if extra > spec.depth {
                        continue;
                    }
                }
                ctx.candidate(name, meta)?;
                break;
            }
            Ok(true)
        })
    }

    fn glob_generator(
        &self,
        query: &Query,
        ctx: &mut QueryContext<'_>,
    ) -> Result<(), QueryExecError> {
        let Some(globs) = &query.glob else {
            return Ok(());
        };
        let patterns: Vec<GlobPattern> = globs
            .iter()
            .map(|g| GlobPattern::compile(g, query.case_sensitive, false, false))
            .collect::<Result<_, _>>()
            .map_err(|e| QueryExecError::Generator(e.to_string()))?;
        self.walk(query, |name, meta| {
            if patterns.iter().any(|p| p.matches(name)) {
                ctx.candidate(name, meta)?;
            }
            Ok(true)
        })
    }

    fn all_files_generator(
        &self,
        query: &Query,
        ctx: &mut QueryContext<'_>,
    ) -> Result<(), QueryExecError> {
        self.walk(query, |name, meta| {
            ctx.candidate(name, meta)?;
            Ok(true)
        })
    }

    fn last_age_out_tick(&self) -> u64 {
        self.state.lock().last_age_out_tick
    }

    fn last_age_out_timestamp(&self) -> Option<SystemTime> {
        self.state.lock().last_age_out_time
    }

    fn age_out(&self, ttl: Duration) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let ttl_ms = ttl.as_millis() as u64;
        let mut state = self.state.lock();
        let before = state.files.len();
        state
            .files
            .retain(|_, meta| meta.exists || now_ms.saturating_sub(meta.otime.wall_ms) < ttl_ms);
        if state.files.len() != before {
            state.last_age_out_tick = self.clock.position().ticks;
            state.last_age_out_time = Some(SystemTime::now());
        }
    }

    fn any_of_these_files_exist(&self, names: &[&str]) -> bool {
        let state = self.state.lock();
        names
            .iter()
            .any(|name| state.files.get(*name).is_some_and(|meta| meta.exists))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> InMemoryView {
        InMemoryView::new(Arc::new(RootClock::new()))
    }

    fn touch(view: &InMemoryView, name: &str, file_type: FileType) -> ClockPosition {
        let pos = view.clock().tick();
        view.record(
            name,
            Some(DiskInfo {
                size: 1,
                mode: 0o644,
                mtime_ms: pos.wall_ms,
                ctime_ms: pos.wall_ms,
                file_type,
            }),
            pos,
        );
        pos
    }

    #[test]
    fn record_and_delete_keep_the_entry() {
        let view = view();
        touch(&view, "a.txt", FileType::Regular);
        assert!(view.any_of_these_files_exist(&["a.txt"]));

        let pos = view.clock().tick();
        view.record("a.txt", None, pos);
        assert!(!view.any_of_these_files_exist(&["a.txt"]));
        assert_eq!(view.file_count(), 1, "deleted entries are retained");
    }

    #[test]
    fn vcs_probe_uses_lock_files() {
        let view = view();
        assert!(!view.is_vcs_operation_in_progress());
        touch(&view, ".git/index.lock", FileType::Regular);
        assert!(view.is_vcs_operation_in_progress());

        let pos = view.clock().tick();
        view.record(".git/index.lock", None, pos);
        assert!(!view.is_vcs_operation_in_progress());
    }

    #[test]
    fn age_out_forgets_old_deletions() {
        let view = view();
        touch(&view, "gone.txt", FileType::Regular);
        let pos = view.clock().tick();
        view.record("gone.txt", None, pos);

        // A long TTL keeps it; a zero TTL reaps it.
        view.age_out(Duration::from_secs(3600));
        assert_eq!(view.file_count(), 1);
        view.age_out(Duration::ZERO);
        assert_eq!(view.file_count(), 0);
        assert!(view.last_age_out_timestamp().is_some());
    }

    #[test]
    fn default_generators_are_not_implemented() {
        struct Bare;
        impl QueryableView for Bare {
            fn clock_position(&self) -> ClockPosition {
                ClockPosition::ZERO
            }
            fn any_of_these_files_exist(&self, _names: &[&str]) -> bool {
                false
            }
        }

        let bare = Bare;
        let query = Query::default();
        let mut ctx = QueryContext::for_tests(&query);
        let err = bare.time_generator(&query, &mut ctx).unwrap_err();
        assert!(matches!(err, QueryExecError::NotImplemented(_)));
    }
}
