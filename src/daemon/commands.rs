//! Command handlers.
//!
//! Every handler receives the raw command array. Root-taking commands
//! resolve `args[1]` through the registry; `watch` is the only one that
//! creates roots.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::daemon::core::Daemon;
use crate::daemon::ipc::{CommandError, make_response};
use crate::daemon::registry::{CommandRegistry, RegistryError};
use crate::daemon::root::Root;
use crate::daemon::session::{self, ClientSession};
use crate::query::eval::execute;
use crate::query::parse::parse_query_with_defaults;
use crate::trigger::TriggerCommand;

pub struct CommandContext<'a> {
    pub daemon: &'a Arc<Daemon>,
    pub session: &'a mut ClientSession,
}

impl CommandContext<'_> {
    fn root_arg<'v>(&self, args: &'v [Value]) -> Result<&'v str, CommandError> {
        args.get(1).and_then(Value::as_str).ok_or_else(|| {
            CommandError::Validation("second argument must be the root path".into())
        })
    }

    fn resolve_root(&self, args: &[Value], create: bool) -> Result<Arc<Root>, CommandError> {
        let path = self.root_arg(args)?;
        Ok(self.daemon.roots.resolve(path, create)?)
    }
}

/// Register every command, in order. Duplicates abort startup.
pub fn build_registry() -> Result<CommandRegistry, RegistryError> {
    let mut registry = CommandRegistry::new();
    registry.register("watch", cmd_watch)?;
    registry.register("watch-list", cmd_watch_list)?;
    registry.register("watch-del", cmd_watch_del)?;
    registry.register("clock", cmd_clock)?;
    registry.register("query", cmd_query)?;
    registry.register("find", cmd_find)?;
    registry.register("subscribe", cmd_subscribe)?;
    registry.register("unsubscribe", cmd_unsubscribe)?;
    registry.register("state-enter", cmd_state_enter)?;
    registry.register("state-leave", cmd_state_leave)?;
    registry.register("trigger", cmd_trigger)?;
    registry.register("trigger-del", cmd_trigger_del)?;
    registry.register("trigger-list", cmd_trigger_list)?;
    registry.register("shutdown-server", cmd_shutdown)?;
    Ok(registry)
}

fn ok_response(extra: Vec<(&str, Value)>) -> Option<Value> {
    let mut response = make_response();
    for (key, value) in extra {
        response.insert(key.to_string(), value);
    }
    Some(Value::Object(response))
}

fn cmd_watch(
    ctx: &mut CommandContext<'_>,
    args: &[Value],
) -> Result<Option<Value>, CommandError> {
    let root = ctx.resolve_root(args, true)?;
    Ok(ok_response(vec![("watch", json!(root.path_str()))]))
}

fn cmd_watch_list(
    ctx: &mut CommandContext<'_>,
    _args: &[Value],
) -> Result<Option<Value>, CommandError> {
    Ok(ok_response(vec![(
        "roots",
        json!(ctx.daemon.roots.list()),
    )]))
}

fn cmd_watch_del(
    ctx: &mut CommandContext<'_>,
    args: &[Value],
) -> Result<Option<Value>, CommandError> {
    let path = ctx.root_arg(args)?;
    let removed = ctx.daemon.roots.remove(path);
    Ok(ok_response(vec![
        ("watch-del", json!(removed.is_some())),
        ("root", json!(path)),
    ]))
}

fn cmd_clock(
    ctx: &mut CommandContext<'_>,
    args: &[Value],
) -> Result<Option<Value>, CommandError> {
    let root = ctx.resolve_root(args, false)?;
    Ok(ok_response(vec![(
        "clock",
        json!(root.current_clock_string()),
    )]))
}

fn cmd_query(
    ctx: &mut CommandContext<'_>,
    args: &[Value],
) -> Result<Option<Value>, CommandError> {
    if args.len() != 3 {
        return Err(CommandError::Validation(
            "wrong number of arguments for 'query'".into(),
        ));
    }
    let root = ctx.resolve_root(args, false)?;
    let config = &ctx.daemon.config;
    let query = parse_query_with_defaults(
        &args[2],
        config.default_sync_timeout(),
        config.default_lock_timeout(),
    )?;
    let result = execute(&query, &root, None)?;
    Ok(ok_response(vec![
        ("clock", json!(result.clock_at_start.to_clock_string())),
        ("files", Value::Array(result.results)),
        ("is_fresh_instance", json!(result.is_fresh_instance)),
    ]))
}

/// `["find", root, patterns...]`: sugar for a wholename match query.
fn cmd_find(
    ctx: &mut CommandContext<'_>,
    args: &[Value],
) -> Result<Option<Value>, CommandError> {
    let root = ctx.resolve_root(args, false)?;
    let patterns = &args[2..];
    let expression = if patterns.is_empty() {
        json!("exists")
    } else {
        let mut terms = vec![json!("anyof")];
        for pattern in patterns {
            let pattern = pattern.as_str().ok_or_else(|| {
                CommandError::Validation("find patterns must be strings".into())
            })?;
            terms.push(json!(["match", pattern, "wholename"]));
        }
        Value::Array(terms)
    };
    let config = &ctx.daemon.config;
    let query = parse_query_with_defaults(
        &json!({ "expression": expression }),
        config.default_sync_timeout(),
        config.default_lock_timeout(),
    )?;
    let result = execute(&query, &root, None)?;
    Ok(ok_response(vec![
        ("clock", json!(result.clock_at_start.to_clock_string())),
        ("files", Value::Array(result.results)),
    ]))
}

fn cmd_subscribe(
    ctx: &mut CommandContext<'_>,
    args: &[Value],
) -> Result<Option<Value>, CommandError> {
    if args.len() != 3 {
        return Err(CommandError::Validation(
            "wrong number of arguments for 'subscribe'".into(),
        ));
    }
    let root = ctx.resolve_root(args, false)?;
    let name = args[2]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            CommandError::Validation("subscription name must be a non-empty string".into())
        })?;
    ctx.session.subscribe(name.to_string(), &root);
    Ok(ok_response(vec![
        ("subscribe", json!(name)),
        ("clock", json!(root.current_clock_string())),
    ]))
}

fn cmd_unsubscribe(
    ctx: &mut CommandContext<'_>,
    args: &[Value],
) -> Result<Option<Value>, CommandError> {
    let name = args
        .get(2)
        .and_then(Value::as_str)
        .ok_or_else(|| CommandError::Validation("expected subscription name".into()))?;
    let deleted = ctx.session.unsubscribe(name);
    Ok(ok_response(vec![
        ("unsubscribe", json!(name)),
        ("deleted", json!(deleted)),
    ]))
}

fn cmd_state_enter(
    ctx: &mut CommandContext<'_>,
    args: &[Value],
) -> Result<Option<Value>, CommandError> {
    let root = ctx.resolve_root(args, false)?;
    let state_args =
        session::parse_state_args(args, ctx.daemon.config.default_sync_timeout())?;
    session::state_enter(ctx.session, &root, state_args)?;
    // The protocol already sent the OK response.
    Ok(None)
}

fn cmd_state_leave(
    ctx: &mut CommandContext<'_>,
    args: &[Value],
) -> Result<Option<Value>, CommandError> {
    let root = ctx.resolve_root(args, false)?;
    let state_args =
        session::parse_state_args(args, ctx.daemon.config.default_sync_timeout())?;
    session::state_leave(ctx.session, &root, state_args)?;
    Ok(None)
}

fn cmd_trigger(
    ctx: &mut CommandContext<'_>,
    args: &[Value],
) -> Result<Option<Value>, CommandError> {
    if args.len() != 3 {
        return Err(CommandError::Validation(
            "wrong number of arguments for 'trigger'".into(),
        ));
    }
    let root = ctx.resolve_root(args, false)?;
    let definition = &args[2];
    let cmd = Arc::new(TriggerCommand::parse(&root, definition)?);

    let disposition;
    {
        let mut triggers = root.triggers.lock().expect("trigger table poisoned");
        let already_defined = triggers
            .get(&cmd.name)
            .is_some_and(|existing| existing.definition == cmd.definition);
        if already_defined {
            // Same definition: leave the existing trigger (and its
            // clock) alone so it does not re-run immediately.
            disposition = "already_defined";
        } else {
            let previous = triggers.remove(&cmd.name);
            disposition = if previous.is_some() {
                "replaced"
            } else {
                "created"
            };
            if let Some(previous) = previous {
                // Stop the old worker before the replacement starts.
                previous.stop();
            }
            cmd.start(&root, Arc::clone(&ctx.daemon.shutting_down));
            triggers.insert(cmd.name.clone(), Arc::clone(&cmd));
        }
    }

    Ok(ok_response(vec![
        ("triggerid", json!(cmd.name)),
        ("disposition", json!(disposition)),
    ]))
}

fn cmd_trigger_del(
    ctx: &mut CommandContext<'_>,
    args: &[Value],
) -> Result<Option<Value>, CommandError> {
    let root = ctx.resolve_root(args, false)?;
    let name = args
        .get(2)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            CommandError::Validation("expected 2nd parameter to be trigger name".into())
        })?;
    let removed = root
        .triggers
        .lock()
        .expect("trigger table poisoned")
        .remove(name);
    let deleted = removed.is_some();
    if let Some(cmd) = removed {
        cmd.stop();
    }
    Ok(ok_response(vec![
        ("deleted", json!(deleted)),
        ("trigger", json!(name)),
    ]))
}

fn cmd_trigger_list(
    ctx: &mut CommandContext<'_>,
    args: &[Value],
) -> Result<Option<Value>, CommandError> {
    let root = ctx.resolve_root(args, false)?;
    let triggers: Vec<Value> = root
        .triggers
        .lock()
        .expect("trigger table poisoned")
        .values()
        .map(|cmd| cmd.describe())
        .collect();
    Ok(ok_response(vec![("triggers", Value::Array(triggers))]))
}

fn cmd_shutdown(
    ctx: &mut CommandContext<'_>,
    _args: &[Value],
) -> Result<Option<Value>, CommandError> {
    ctx.daemon
        .shutting_down
        .store(true, std::sync::atomic::Ordering::Release);
    Ok(ok_response(vec![("shutdown-server", json!(true))]))
}
