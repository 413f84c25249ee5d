//! Trigger commands: saved queries bound to child-process invocations.
//!
//! Each trigger owns a background worker that waits for settle
//! notifications from the root's publisher, re-evaluates the saved query
//! incrementally, and spawns the configured command when there are
//! results.

pub mod spawn;

use std::collections::BTreeMap;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::daemon::publish::{Item, Subscriber};
use crate::daemon::root::Root;
use crate::query::clockspec::ClockSpec;
use crate::query::eval::Generator;
use crate::query::fields::FieldList;
use crate::query::{Query, QueryParseError, execute, parse_query};

/// Upper bound on one ping wait; the loop re-checks its stop conditions
/// at least this often.
const PING_WAIT: Duration = Duration::from_secs(86_400);

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("invalid trigger definition: {0}")]
    Validation(String),

    #[error(transparent)]
    QueryParse(#[from] QueryParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinStyle {
    DevNull,
    Json,
    NameList,
}

/// Parsed `">path"` / `">>path"` redirection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    pub path: String,
    pub append: bool,
}

fn parse_redirection(
    definition: &Value,
    label: &str,
) -> Result<Option<Redirection>, TriggerError> {
    let Some(value) = definition.get(label) else {
        return Ok(None);
    };
    let name = value.as_str().ok_or_else(|| {
        TriggerError::Validation(format!("{label} must be a string"))
    })?;
    if !name.starts_with('>') {
        return Err(TriggerError::Validation(format!(
            "{label}: must be prefixed with either > or >>, got {name}"
        )));
    }
    if let Some(path) = name.strip_prefix(">>") {
        if cfg!(windows) {
            return Err(TriggerError::Validation(format!(
                "{label}: appending is not supported on this platform"
            )));
        }
        Ok(Some(Redirection {
            path: path.to_string(),
            append: true,
        }))
    } else {
        Ok(Some(Redirection {
            path: name[1..].to_string(),
            append: false,
        }))
    }
}

/// Binary event used to wake the worker.
pub(crate) struct PingEvent {
    set: Mutex<bool>,
    cv: Condvar,
}

impl PingEvent {
    fn new() -> Self {
        Self {
            set: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        *self.set.lock().expect("ping poisoned") = true;
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) {
        let guard = self.set.lock().expect("ping poisoned");
        let _ = self
            .cv
            .wait_timeout_while(guard, timeout, |set| !*set)
            .expect("ping poisoned");
    }

    fn test_and_clear(&self) -> bool {
        std::mem::take(&mut *self.set.lock().expect("ping poisoned"))
    }

    fn is_set(&self) -> bool {
        *self.set.lock().expect("ping poisoned")
    }
}

pub struct TriggerCommand {
    pub name: String,
    /// Definition as received; compared verbatim when a trigger is
    /// re-registered.
    pub definition: Value,
    pub command: Vec<String>,
    pub append_files: bool,
    pub stdin_style: StdinStyle,
    /// 0 = unlimited.
    pub max_files_stdin: usize,
    pub stdout_redirect: Option<Redirection>,
    pub stderr_redirect: Option<Redirection>,
    pub chdir: Option<String>,

    query: Mutex<Query>,
    /// Trigger-scoped child environment overrides; merged over the
    /// daemon's environment at spawn time.
    env: Mutex<BTreeMap<String, String>>,
    current_child: Mutex<Option<Child>>,
    ping: Arc<PingEvent>,
    stop_trigger: AtomicBool,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    subscriber: Mutex<Option<Subscriber>>,
}

impl TriggerCommand {
    /// Parse a trigger definition against `root`.
    pub fn parse(root: &Root, definition: &Value) -> Result<Self, TriggerError> {
        let name = definition
            .get("name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TriggerError::Validation("invalid or missing name".into()))?
            .to_string();

        let command: Vec<String> = match definition.get("command") {
            Some(Value::Array(items)) if !items.is_empty() => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        TriggerError::Validation("command entries must be strings".into())
                    })
                })
                .collect::<Result<_, _>>()?,
            _ => return Err(TriggerError::Validation("invalid command array".into())),
        };

        // The saved query is built from the expression and relative_root
        // keys only; everything else about the definition is trigger-level.
        let mut query_doc = Map::new();
        if let Some(expr) = definition.get("expression") {
            query_doc.insert("expression".into(), expr.clone());
        }
        if let Some(rel) = definition.get("relative_root") {
            query_doc.insert("relative_root".into(), rel.clone());
        }
        let mut query = parse_query(&Value::Object(query_doc))?;

        let append_files = match definition.get("append_files") {
            None => false,
            Some(Value::Bool(flag)) => *flag,
            Some(other) => {
                return Err(TriggerError::Validation(format!(
                    "append_files must be a boolean, got {other}"
                )));
            }
        };
        if append_files {
            // Appending needs a bare name list regardless of the field
            // list, so capture one via the dedup mechanism.
            query.dedup_results = true;
        }

        let stdin_style = match definition.get("stdin") {
            None => StdinStyle::DevNull,
            Some(Value::Array(fields)) => {
                query.fields = FieldList::parse(fields)?;
                StdinStyle::Json
            }
            Some(Value::String(s)) if s == "/dev/null" => StdinStyle::DevNull,
            Some(Value::String(s)) if s == "NAME_PER_LINE" => {
                query.fields = FieldList::default();
                StdinStyle::NameList
            }
            Some(Value::String(s)) => {
                return Err(TriggerError::Validation(format!("invalid stdin value {s}")));
            }
            Some(_) => {
                return Err(TriggerError::Validation("invalid value for stdin".into()));
            }
        };

        let max_files_stdin = match definition.get("max_files_stdin") {
            None => 0,
            Some(value) => value.as_u64().ok_or_else(|| {
                TriggerError::Validation("max_files_stdin must be >= 0".into())
            })? as usize,
        };

        let stdout_redirect = parse_redirection(definition, "stdout")?;
        let stderr_redirect = parse_redirection(definition, "stderr")?;

        let chdir = match definition.get("chdir") {
            None => None,
            Some(value) => Some(
                value
                    .as_str()
                    .ok_or_else(|| TriggerError::Validation("chdir must be a string".into()))?
                    .to_string(),
            ),
        };

        let mut env = BTreeMap::new();
        env.insert("WATCHMAN_ROOT".to_string(), root.path_str());
        env.insert(
            "WATCHMAN_SOCK".to_string(),
            root.sock_path().display().to_string(),
        );
        env.insert("WATCHMAN_TRIGGER".to_string(), name.clone());

        Ok(Self {
            name,
            definition: definition.clone(),
            command,
            append_files,
            stdin_style,
            max_files_stdin,
            stdout_redirect,
            stderr_redirect,
            chdir,
            query: Mutex::new(query),
            env: Mutex::new(env),
            current_child: Mutex::new(None),
            ping: Arc::new(PingEvent::new()),
            stop_trigger: AtomicBool::new(false),
            worker: Mutex::new(None),
            subscriber: Mutex::new(None),
        })
    }

    pub(crate) fn env(&self) -> &Mutex<BTreeMap<String, String>> {
        &self.env
    }

    pub(crate) fn take_child(&self) -> Option<Child> {
        self.current_child.lock().expect("child slot poisoned").take()
    }

    pub(crate) fn store_child(&self, child: Child) {
        *self.current_child.lock().expect("child slot poisoned") = Some(child);
    }

    /// Subscribe to the root's publisher and spawn the worker thread.
    pub fn start(self: &Arc<Self>, root: &Arc<Root>, shutting_down: Arc<AtomicBool>) {
        let ping = Arc::clone(&self.ping);
        let subscriber = root
            .unilateral_responses
            .subscribe(move || ping.notify());
        *self.subscriber.lock().expect("subscriber slot poisoned") = Some(subscriber);

        let this = Arc::clone(self);
        let root = Arc::clone(root);
        let handle = std::thread::Builder::new()
            .name(format!("trigger {} {}", self.name, root.path().display()))
            .spawn(move || this.run(&root, &shutting_down))
            .expect("failed to spawn trigger thread");
        *self.worker.lock().expect("worker slot poisoned") = Some(handle);
    }

    fn run(&self, root: &Arc<Root>, shutting_down: &AtomicBool) {
        tracing::debug!(trigger = %self.name, "waiting for settle");
        let mut pending: Vec<Arc<Item>> = Vec::new();

        while !shutting_down.load(Ordering::Acquire) && !self.stop_trigger.load(Ordering::Acquire)
        {
            self.ping.wait(PING_WAIT);
            if shutting_down.load(Ordering::Acquire) || self.stop_trigger.load(Ordering::Acquire)
            {
                break;
            }
            while self.ping.test_and_clear() {
                pending.clear();
                if let Some(subscriber) =
                    &*self.subscriber.lock().expect("subscriber slot poisoned")
                {
                    subscriber.get_pending(&mut pending);
                }
                let seen_settle = pending.iter().any(|item| {
                    item.payload
                        .get("settled")
                        .is_some_and(|v| v.as_bool().unwrap_or(false))
                });
                if seen_settle && self.maybe_spawn(root) {
                    self.wait_for_child(shutting_down);
                }
            }
        }

        // Teardown: no child survives the worker.
        if let Some(child) = self.take_child() {
            spawn::kill_and_reap(child, &self.name);
        }
        tracing::debug!(trigger = %self.name, "out of loop");
    }

    /// Evaluate the saved query and spawn the command if it matched
    /// anything. Returns whether a child was started.
    fn maybe_spawn(&self, root: &Arc<Root>) -> bool {
        // A repo in the middle of a rebase or similar should settle down
        // before triggers run.
        if root.view_dyn().is_vcs_operation_in_progress() {
            tracing::debug!("deferring triggers until VCS operations complete");
            return false;
        }

        let mut query = self.query.lock().expect("trigger query poisoned");

        // Triggers never need to sync explicitly; settle points are
        // already sync'd to the present time.
        query.sync_timeout = Duration::ZERO;

        tracing::debug!(trigger = %self.name, since = ?query.since_spec, "assessing");
        let mut result = match execute(&query, root, Some(Generator::Time)) {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(
                    trigger = %self.name,
                    "error running trigger query: {err}"
                );
                return false;
            }
        };

        tracing::debug!(
            trigger = %self.name,
            results = result.results.len(),
            "query evaluated"
        );

        // Rotate the basis so the next run is incremental from here.
        let previous_spec = std::mem::replace(
            &mut query.since_spec,
            Some(ClockSpec::Clock(result.clock_at_start)),
        );

        if result.results.is_empty() {
            return false;
        }

        spawn::spawn_command(root, self, &query, &mut result, previous_spec.as_ref());
        true
    }

    /// Reap the running child without blocking ping delivery: polling
    /// stops as soon as a new notification or a stop request arrives.
    fn wait_for_child(&self, shutting_down: &AtomicBool) {
        loop {
            if shutting_down.load(Ordering::Acquire)
                || self.stop_trigger.load(Ordering::Acquire)
                || self.ping.is_set()
            {
                return;
            }
            let mut slot = self.current_child.lock().expect("child slot poisoned");
            match slot.as_mut() {
                None => return,
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => {
                        tracing::debug!(trigger = %self.name, %status, "child exited");
                        *slot = None;
                        return;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(trigger = %self.name, "wait failed: {err}");
                        *slot = None;
                        return;
                    }
                },
            }
            drop(slot);
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Stop the worker and reap any child. Idempotent; safe to call on a
    /// trigger that never started.
    pub fn stop(&self) {
        self.stop_trigger.store(true, Ordering::Release);
        self.ping.notify();
        if let Some(handle) = self.worker.lock().expect("worker slot poisoned").take() {
            let _ = handle.join();
        }
        if let Some(child) = self.take_child() {
            spawn::kill_and_reap(child, &self.name);
        }
        *self.subscriber.lock().expect("subscriber slot poisoned") = None;
    }

    /// Snapshot of the saved query's since basis, for introspection.
    pub fn since_spec(&self) -> Option<ClockSpec> {
        self.query
            .lock()
            .expect("trigger query poisoned")
            .since_spec
            .clone()
    }

    pub(crate) fn query(&self) -> &Mutex<Query> {
        &self.query
    }

    /// Summary used by trigger-list responses.
    pub fn describe(&self) -> Value {
        self.definition.clone()
    }
}

impl Drop for TriggerCommand {
    fn drop(&mut self) {
        let running = self
            .worker
            .lock()
            .expect("worker slot poisoned")
            .is_some();
        if running && !self.stop_trigger.load(Ordering::Acquire) {
            // Destroying a running trigger without stop() loses track of
            // its thread and child.
            tracing::error!(trigger = %self.name, "destroying trigger without stopping it first");
            debug_assert!(false, "destroying trigger without stopping it first");
        }
    }
}
