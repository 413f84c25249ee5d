//! Child-process launch for triggers: stdin preparation, environment
//! seeding, argv budgeting, redirections and process-group placement.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Pid, SysconfVar, sysconf};
use serde_json::Value;

use crate::daemon::root::Root;
use crate::query::clockspec::ClockSpec;
use crate::query::{Query, QueryResult};
use crate::trigger::{Redirection, StdinStyle, TriggerCommand};

/// Slack subtracted from the OS argument budget for miscellaneous
/// overhead.
const ARG_BUDGET_OVERHEAD: usize = 32;

/// Fallback when the OS will not tell us its limit.
const DEFAULT_ARG_MAX: usize = 128 * 1024;

pub(crate) fn os_arg_max() -> usize {
    match sysconf(SysconfVar::ARG_MAX) {
        Ok(Some(limit)) if limit > 0 => limit as usize,
        _ => DEFAULT_ARG_MAX,
    }
}

/// Bytes one argv entry costs: the string, its NUL, and its pointer slot.
fn argv_entry_size(arg: &str) -> usize {
    arg.len() + 1 + std::mem::size_of::<usize>()
}

/// Dry-run measurement of a serialized environment.
fn environ_size(env: &BTreeMap<String, String>) -> usize {
    env.iter()
        .map(|(k, v)| k.len() + 1 + v.len() + 1 + std::mem::size_of::<usize>())
        .sum()
}

/// Choose how many of `names` fit after `command` within `arg_max`.
/// Returns the names that fit and whether any were dropped.
pub(crate) fn append_args_within_budget(
    command: &[String],
    names: &[String],
    env: &BTreeMap<String, String>,
    arg_max: usize,
) -> (Vec<String>, bool) {
    let mut remaining = arg_max.saturating_sub(ARG_BUDGET_OVERHEAD);
    for arg in command {
        remaining = remaining.saturating_sub(argv_entry_size(arg));
    }
    remaining = remaining.saturating_sub(environ_size(env));

    let mut appended = Vec::new();
    for name in names {
        let size = argv_entry_size(name);
        if remaining < size {
            return (appended, true);
        }
        remaining -= size;
        appended.push(name.clone());
    }
    (appended, false)
}

/// Build the child's stdin. Everything except `/dev/null` goes through an
/// anonymous temp file (already unlinked, so cleanup survives crashes)
/// that is rewound before handing the descriptor over.
pub(crate) fn prepare_stdin(
    style: StdinStyle,
    results: &mut Vec<Value>,
    max_files: usize,
) -> std::io::Result<File> {
    if style == StdinStyle::DevNull {
        return File::open("/dev/null");
    }

    // Adjust results to fit within the configured limit.
    if max_files > 0 && results.len() > max_files {
        results.truncate(max_files);
    }

    let mut file = tempfile::tempfile()?;
    match style {
        StdinStyle::Json => {
            serde_json::to_writer(&mut file, results)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
        }
        StdinStyle::NameList => {
            for value in results.iter() {
                let Some(name) = value.as_str() else {
                    continue;
                };
                file.write_all(name.as_bytes())?;
                file.write_all(b"\n")?;
            }
        }
        StdinStyle::DevNull => unreachable!(),
    }
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

fn open_redirect(redirect: &Redirection) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).write(true);
    if redirect.append {
        options.append(true);
    } else {
        options.truncate(true);
    }
    options.open(&redirect.path)
}

pub(crate) fn kill_and_reap(mut child: Child, trigger: &str) {
    let pid = Pid::from_raw(child.id() as i32);
    // The child leads its own process group; signal the whole group.
    if killpg(pid, Signal::SIGTERM).is_err() {
        let _ = child.kill();
    }
    match child.wait() {
        Ok(status) => tracing::debug!(trigger, %status, "reaped previous child"),
        Err(err) => tracing::warn!(trigger, "failed to reap child: {err}"),
    }
}

/// Launch the trigger command for `result`.
pub(crate) fn spawn_command(
    root: &Root,
    cmd: &TriggerCommand,
    query: &Query,
    result: &mut QueryResult,
    since_spec: Option<&ClockSpec>,
) {
    let mut file_overflow = false;
    let arg_max = os_arg_max();

    // Record the overflow before prepare_stdin truncates the results.
    if cmd.max_files_stdin > 0 && result.results.len() > cmd.max_files_stdin {
        file_overflow = true;
    }

    let stdin_file = match prepare_stdin(cmd.stdin_style, &mut result.results, cmd.max_files_stdin)
    {
        Ok(file) => file,
        Err(err) => {
            tracing::error!(
                root = %root.path().display(),
                trigger = %cmd.name,
                "unable to prepare stdin: {err}"
            );
            return;
        }
    };

    {
        let mut env = cmd.env().lock().expect("trigger env poisoned");
        // Recreating a clock value from a non-clock basis is not worth
        // the hassle; it only happens on the first run.
        match since_spec {
            Some(ClockSpec::Clock(pos)) => {
                env.insert("WATCHMAN_SINCE".to_string(), pos.to_clock_string());
            }
            _ => {
                env.remove("WATCHMAN_SINCE");
            }
        }
        env.insert(
            "WATCHMAN_CLOCK".to_string(),
            result.clock_at_start.to_clock_string(),
        );
        match &query.relative_root {
            Some(rel) => {
                env.insert("WATCHMAN_RELATIVE_ROOT".to_string(), rel.clone());
            }
            None => {
                env.remove("WATCHMAN_RELATIVE_ROOT");
            }
        }
    }

    let mut args = cmd.command.clone();
    if cmd.append_files {
        // Measure against the environment as it will be serialized,
        // before the overflow flag itself is added.
        let merged = merged_env(cmd);
        let (appended, overflowed) = append_args_within_budget(
            &cmd.command,
            &result.deduped_file_names,
            &merged,
            arg_max,
        );
        args.extend(appended);
        file_overflow |= overflowed;
    }

    cmd.env().lock().expect("trigger env poisoned").insert(
        "WATCHMAN_FILES_OVERFLOW".to_string(),
        if file_overflow { "true" } else { "false" }.to_string(),
    );
    let env = merged_env(cmd);

    let working_dir = resolve_working_dir(root, query, cmd.chdir.as_deref());
    tracing::debug!(dir = %working_dir.display(), "using working dir");

    let mut command = Command::new(&args[0]);
    command
        .args(&args[1..])
        .env_clear()
        .envs(&env)
        .stdin(Stdio::from(stdin_file))
        .current_dir(&working_dir);

    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    match &cmd.stdout_redirect {
        Some(redirect) => match open_redirect(redirect) {
            Ok(file) => {
                command.stdout(Stdio::from(file));
            }
            Err(err) => {
                tracing::error!(trigger = %cmd.name, "cannot open stdout redirect: {err}");
                return;
            }
        },
        None => {
            command.stdout(Stdio::inherit());
        }
    }
    match &cmd.stderr_redirect {
        Some(redirect) => match open_redirect(redirect) {
            Ok(file) => {
                command.stderr(Stdio::from(file));
            }
            Err(err) => {
                tracing::error!(trigger = %cmd.name, "cannot open stderr redirect: {err}");
                return;
            }
        },
        None => {
            command.stderr(Stdio::inherit());
        }
    }

    // At most one child per trigger.
    if let Some(previous) = cmd.take_child() {
        kill_and_reap(previous, &cmd.name);
    }

    match command.spawn() {
        Ok(child) => {
            tracing::debug!(
                root = %root.path().display(),
                trigger = %cmd.name,
                pid = child.id(),
                "spawned trigger command"
            );
            cmd.store_child(child);
        }
        Err(err) => {
            tracing::error!(
                root = %root.path().display(),
                trigger = %cmd.name,
                "trigger failed: {err}"
            );
        }
    }
}

/// Trigger children inherit the daemon's environment with the trigger's
/// overrides on top.
fn merged_env(cmd: &TriggerCommand) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    for (k, v) in cmd.env().lock().expect("trigger env poisoned").iter() {
        env.insert(k.clone(), v.clone());
    }
    env
}

fn resolve_working_dir(root: &Root, query: &Query, chdir: Option<&str>) -> PathBuf {
    let mut working_dir = match &query.relative_root {
        Some(rel) => root.path().join(rel),
        None => root.path().to_path_buf(),
    };
    if let Some(target) = chdir {
        let target = std::path::Path::new(target);
        working_dir = if target.is_absolute() {
            target.to_path_buf()
        } else {
            working_dir.join(target)
        };
    }
    working_dir
}
