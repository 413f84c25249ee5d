//! Per-root watcher thread.
//!
//! Bridges OS change notifications into the in-memory view, reports
//! cookie observations, and publishes a `settled` payload after the
//! quiet period. An initial crawl seeds the view before any events are
//! processed.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use walkdir::WalkDir;

use crate::daemon::clock::RootClock;
use crate::daemon::cookie::CookieSync;
use crate::daemon::publish::Publisher;
use crate::daemon::view::{DiskInfo, FileType, InMemoryView, QueryableView};

pub struct RootWatcher {
    stop_tx: Sender<()>,
    handle: std::thread::JoinHandle<()>,
}

impl RootWatcher {
    pub fn spawn(
        root_path: PathBuf,
        view: Arc<InMemoryView>,
        cookies: Arc<CookieSync>,
        publisher: Arc<Publisher>,
        clock: Arc<RootClock>,
        settle_period: Duration,
        gc_age: Option<Duration>,
    ) -> notify::Result<Self> {
        let (event_tx, event_rx) = unbounded();
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(
            move |event: notify::Result<notify::Event>| {
                let _ = event_tx.send(event);
            },
        )?;
        watcher.watch(&root_path, RecursiveMode::Recursive)?;

        let (stop_tx, stop_rx) = bounded(1);
        let handle = std::thread::Builder::new()
            .name(format!("watcher {}", root_path.display()))
            .spawn(move || {
                // The watcher must live on this thread for as long as we run.
                let _watcher = watcher;
                run(
                    &root_path,
                    &view,
                    &cookies,
                    &publisher,
                    &clock,
                    settle_period,
                    gc_age,
                    event_rx,
                    stop_rx,
                );
            })
            .expect("failed to spawn watcher thread");

        Ok(Self { stop_tx, handle })
    }

    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.handle.join();
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    root_path: &Path,
    view: &InMemoryView,
    cookies: &CookieSync,
    publisher: &Publisher,
    clock: &RootClock,
    settle_period: Duration,
    gc_age: Option<Duration>,
    event_rx: Receiver<notify::Result<notify::Event>>,
    stop_rx: Receiver<()>,
) {
    crawl(root_path, view, cookies, clock);

    // The crawl counts as activity so the first settle fires once the
    // tree goes quiet.
    let mut unsettled = true;

    loop {
        crossbeam::select! {
            recv(stop_rx) -> _ => break,
            recv(event_rx) -> msg => match msg {
                Ok(Ok(event)) => {
                    if handle_event(root_path, view, cookies, clock, &event) {
                        unsettled = true;
                    }
                }
                Ok(Err(err)) => {
                    tracing::warn!(root = %root_path.display(), "watcher error: {err}");
                }
                Err(_) => break,
            },
            default(settle_period) => {
                if unsettled {
                    unsettled = false;
                    let payload = json!({
                        "root": root_path.display().to_string(),
                        "clock": clock.position().to_clock_string(),
                        "settled": true,
                    });
                    tracing::debug!(root = %root_path.display(), "settled");
                    publisher.enqueue(payload);
                    if let Some(ttl) = gc_age {
                        view.age_out(ttl);
                    }
                }
            }
        }
    }

    tracing::debug!(root = %root_path.display(), "watcher thread exiting");
}

fn crawl(root_path: &Path, view: &InMemoryView, cookies: &CookieSync, clock: &RootClock) {
    let pos = clock.tick();
    let mut count = 0usize;
    for entry in WalkDir::new(root_path)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
    {
        let Some(wholename) = relative_name(root_path, entry.path()) else {
            continue;
        };
        if is_cookie(cookies, &wholename) {
            continue;
        }
        if let Some(info) = stat(entry.path()) {
            view.record(&wholename, Some(info), pos);
            count += 1;
        }
    }
    tracing::debug!(root = %root_path.display(), files = count, "initial crawl complete");
}

/// Apply one OS event to the view. Returns whether the event counts as
/// tree activity (cookie observations do not).
fn handle_event(
    root_path: &Path,
    view: &InMemoryView,
    cookies: &CookieSync,
    clock: &RootClock,
    event: &notify::Event,
) -> bool {
    let mut activity = false;
    let mut batch_pos = None;
    for path in &event.paths {
        let Some(wholename) = relative_name(root_path, path) else {
            continue;
        };
        if is_cookie(cookies, &wholename) {
            cookies.notify_cookie(path);
            continue;
        }
        // One tick covers the whole batch.
        let pos = *batch_pos.get_or_insert_with(|| clock.tick());
        view.record(&wholename, stat(path), pos);
        activity = true;
    }
    activity
}

fn relative_name(root_path: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root_path).ok()?;
    let name = rel.to_str()?;
    if name.is_empty() {
        return None;
    }
    Some(name.to_string())
}

/// Cookies are only ever created directly under the root.
fn is_cookie(cookies: &CookieSync, wholename: &str) -> bool {
    !wholename.contains('/') && cookies.is_cookie_name(wholename)
}

fn stat(path: &Path) -> Option<DiskInfo> {
    let md = std::fs::symlink_metadata(path).ok()?;
    let file_type = if md.file_type().is_symlink() {
        FileType::Symlink
    } else if md.is_dir() {
        FileType::Directory
    } else if md.is_file() {
        FileType::Regular
    } else {
        FileType::Other
    };
    let mtime_ms = (md.mtime() as u64).saturating_mul(1000)
        + (md.mtime_nsec() as u64) / 1_000_000;
    let ctime_ms = (md.ctime() as u64).saturating_mul(1000)
        + (md.ctime_nsec() as u64) / 1_000_000;
    Some(DiskInfo {
        size: md.len(),
        mode: md.permissions().mode(),
        mtime_ms,
        ctime_ms,
        file_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::view::QueryableView;
    use std::time::Instant;
    use tempfile::TempDir;

    fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    struct Fixture {
        dir: TempDir,
        view: Arc<InMemoryView>,
        cookies: Arc<CookieSync>,
        publisher: Arc<Publisher>,
        watcher: Option<RootWatcher>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let clock = Arc::new(RootClock::new());
            let view = Arc::new(InMemoryView::new(Arc::clone(&clock)));
            let cookies = Arc::new(CookieSync::new(dir.path().to_path_buf()));
            let publisher = Arc::new(Publisher::new());
            let watcher = RootWatcher::spawn(
                dir.path().to_path_buf(),
                Arc::clone(&view),
                Arc::clone(&cookies),
                Arc::clone(&publisher),
                clock,
                Duration::from_millis(20),
                None,
            )
            .unwrap();
            Self {
                dir,
                view,
                cookies,
                publisher,
                watcher: Some(watcher),
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            if let Some(watcher) = self.watcher.take() {
                watcher.stop();
            }
        }
    }

    #[test]
    fn observes_created_files() {
        let fixture = Fixture::new();
        std::fs::write(fixture.dir.path().join("hello.txt"), b"hi").unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            fixture.view.any_of_these_files_exist(&["hello.txt"])
        }));
    }

    #[test]
    fn completes_cookie_syncs() {
        let fixture = Fixture::new();
        let mut names = Vec::new();
        let handle = fixture.cookies.sync(&mut names).unwrap();
        handle.wait(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn publishes_settled_after_quiet_period() {
        let fixture = Fixture::new();
        let sub = fixture.publisher.subscribe(|| {});
        std::fs::write(fixture.dir.path().join("x"), b"x").unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            let mut out = Vec::new();
            sub.get_pending(&mut out);
            out.iter().any(|item| {
                item.payload.get("settled").and_then(|v| v.as_bool()) == Some(true)
                    && item.payload.get("clock").is_some()
            })
        }));
    }
}
