//! End-to-end trigger scenarios: a real root, real settles, real child
//! processes. Outputs are written outside the watched tree so the
//! children themselves do not generate new settles.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;

use fswatchd::config::Config;
use fswatchd::{Root, TriggerCommand};

const WAIT: Duration = Duration::from_secs(15);

// A generous settle keeps each burst of test writes inside one quiet
// window, so every scenario sees exactly the batches it expects.
fn test_config() -> Config {
    Config {
        settle_ms: 200,
        ..Config::default()
    }
}

fn wait_for_file(path: &Path) -> String {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if !contents.is_empty() {
                return contents;
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {}", path.display());
}

fn wait_for_file_content(path: &Path, expected: &str) {
    let deadline = Instant::now() + WAIT;
    let mut last = String::new();
    while Instant::now() < deadline {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if contents == expected {
                return;
            }
            last = contents;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!(
        "timed out waiting for {} to become {expected:?}, last saw {last:?}",
        path.display()
    );
}

struct Fixture {
    root_dir: TempDir,
    out_dir: TempDir,
    root: Arc<Root>,
    trigger: Option<Arc<TriggerCommand>>,
}

impl Fixture {
    fn new() -> Self {
        let root_dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        let config = test_config();
        let root = Root::open(
            root_dir.path(),
            root_dir.path().join("test.sock"),
            &config,
        )
        .unwrap();
        Self {
            root_dir,
            out_dir,
            root,
            trigger: None,
        }
    }

    fn out(&self, name: &str) -> std::path::PathBuf {
        self.out_dir.path().join(name)
    }

    fn start_trigger(&mut self, definition: serde_json::Value) {
        let cmd = Arc::new(TriggerCommand::parse(&self.root, &definition).unwrap());
        cmd.start(&self.root, Arc::new(AtomicBool::new(false)));
        self.trigger = Some(cmd);
    }

    fn touch(&self, name: &str) {
        std::fs::write(self.root_dir.path().join(name), b"x").unwrap();
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        if let Some(trigger) = self.trigger.take() {
            trigger.stop();
        }
        self.root.cancel();
    }
}

#[test]
fn name_per_line_stdin_respects_max_files_and_flags_overflow() {
    let mut fixture = Fixture::new();
    let out = fixture.out_dir.path().display().to_string();
    fixture.start_trigger(json!({
        "name": "capture",
        "command": [
            "sh", "-c",
            format!(
                "cat > {out}/stdin.txt.tmp; \
                 printf %s \"$WATCHMAN_FILES_OVERFLOW\" > {out}/overflow.txt; \
                 printf %s \"${{WATCHMAN_SINCE:-unset}}\" > {out}/since.txt; \
                 mv {out}/stdin.txt.tmp {out}/stdin.txt"
            ),
        ],
        "stdin": "NAME_PER_LINE",
        "max_files_stdin": 2,
    }));

    // Five files; the settle after these creations fires the trigger.
    for name in ["a", "b", "c", "d", "e"] {
        fixture.touch(name);
    }

    wait_for_file_content(&fixture.out("stdin.txt"), "a\nb\n");
    assert_eq!(wait_for_file(&fixture.out("overflow.txt")), "true");
    // First run has no previous clock basis.
    assert_eq!(wait_for_file(&fixture.out("since.txt")), "unset");
}

#[test]
fn incremental_runs_carry_since_and_reset_overflow() {
    let mut fixture = Fixture::new();
    let out = fixture.out_dir.path().display().to_string();
    fixture.start_trigger(json!({
        "name": "capture",
        "command": [
            "sh", "-c",
            format!(
                "cat > {out}/stdin.txt.tmp; \
                 printf %s \"$WATCHMAN_FILES_OVERFLOW\" > {out}/overflow.txt; \
                 printf %s \"${{WATCHMAN_SINCE:-unset}}\" > {out}/since.txt; \
                 printf %s \"$WATCHMAN_CLOCK\" > {out}/clock.txt; \
                 mv {out}/stdin.txt.tmp {out}/stdin.txt"
            ),
        ],
        "stdin": "NAME_PER_LINE",
        "max_files_stdin": 2,
    }));

    for name in ["a", "b", "c"] {
        fixture.touch(name);
    }
    wait_for_file_content(&fixture.out("stdin.txt"), "a\nb\n");
    let first_clock = wait_for_file(&fixture.out("clock.txt"));
    assert!(first_clock.starts_with("c:"));

    // A second settle: only the new file is reported, the previous run's
    // clock shows up as WATCHMAN_SINCE, and overflow clears.
    fixture.touch("f");
    wait_for_file_content(&fixture.out("stdin.txt"), "f\n");
    assert_eq!(std::fs::read_to_string(fixture.out("overflow.txt")).unwrap(), "false");
    let since = std::fs::read_to_string(fixture.out("since.txt")).unwrap();
    assert_eq!(since, first_clock);
}

#[test]
fn append_files_passes_names_in_argv() {
    let mut fixture = Fixture::new();
    let out = fixture.out_dir.path().display().to_string();
    fixture.start_trigger(json!({
        "name": "argv",
        "command": [
            "sh", "-c",
            format!("printf '%s\\n' \"$@\" > {out}/args.txt"),
            "argv0",
        ],
        "append_files": true,
    }));

    for name in ["x", "y", "z"] {
        fixture.touch(name);
    }

    wait_for_file_content(&fixture.out("args.txt"), "x\ny\nz\n");
}

#[test]
fn trigger_env_identifies_root_and_trigger() {
    let mut fixture = Fixture::new();
    let out = fixture.out_dir.path().display().to_string();
    fixture.start_trigger(json!({
        "name": "envdump",
        "command": [
            "sh", "-c",
            format!(
                "printf %s \"$WATCHMAN_ROOT\" > {out}/root.txt; \
                 printf %s \"$WATCHMAN_TRIGGER\" > {out}/trigger.txt; \
                 printf %s \"$WATCHMAN_SOCK\" > {out}/sock.txt"
            ),
        ],
    }));

    fixture.touch("poke");

    assert_eq!(wait_for_file(&fixture.out("root.txt")), fixture.root.path_str());
    assert_eq!(wait_for_file(&fixture.out("trigger.txt")), "envdump");
    assert_eq!(
        wait_for_file(&fixture.out("sock.txt")),
        fixture.root.sock_path().display().to_string()
    );
}

#[test]
fn vcs_lock_defers_the_trigger() {
    let mut fixture = Fixture::new();

    // The lock file exists before the trigger starts.
    std::fs::create_dir(fixture.root_dir.path().join(".git")).unwrap();
    fixture.touch(".git/index.lock");

    let out = fixture.out_dir.path().display().to_string();
    fixture.start_trigger(json!({
        "name": "deferred",
        "command": ["sh", "-c", format!("date >> {out}/ran.txt")],
    }));

    fixture.touch("work");
    std::thread::sleep(Duration::from_millis(500));
    assert!(
        !fixture.out("ran.txt").exists(),
        "trigger must defer while a VCS operation is in progress"
    );

    // Releasing the lock is itself activity; the next settle runs it.
    std::fs::remove_file(fixture.root_dir.path().join(".git/index.lock")).unwrap();
    wait_for_file(&fixture.out("ran.txt"));
}

#[test]
fn stdout_redirection_appends_across_runs() {
    let mut fixture = Fixture::new();
    let target = fixture.out("redirected.txt");
    fixture.start_trigger(json!({
        "name": "redirect",
        "command": ["sh", "-c", "echo ran"],
        "stdout": format!(">>{}", target.display()),
    }));

    fixture.touch("one");
    wait_for_file(&target);

    fixture.touch("two");
    let deadline = Instant::now() + WAIT;
    loop {
        let contents = std::fs::read_to_string(&target).unwrap_or_default();
        if contents == "ran\nran\n" {
            break;
        }
        assert!(Instant::now() < deadline, "append mode should accumulate, got {contents:?}");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn stop_is_idempotent_and_kills_nothing_after_the_fact() {
    let mut fixture = Fixture::new();
    fixture.start_trigger(json!({
        "name": "quiet",
        "command": ["true"],
    }));
    let trigger = fixture.trigger.take().unwrap();
    trigger.stop();
    trigger.stop();
}
