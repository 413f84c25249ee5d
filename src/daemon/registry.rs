//! Command registry.
//!
//! Commands are registered explicitly, in order, during startup; a
//! duplicate name is a startup error rather than a silent override.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::daemon::commands::CommandContext;
use crate::daemon::ipc::CommandError;

/// A command handler. Returning `Ok(None)` means the handler already
/// sent its own response (used by commands that must respond before
/// doing asynchronous work).
pub type CommandHandler =
    fn(&mut CommandContext<'_>, &[Value]) -> Result<Option<Value>, CommandError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("command {0:?} registered twice")]
    Duplicate(&'static str),
}

#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<&'static str, CommandHandler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &'static str,
        handler: CommandHandler,
    ) -> Result<(), RegistryError> {
        if self.commands.insert(name, handler).is_some() {
            return Err(RegistryError::Duplicate(name));
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<CommandHandler> {
        self.commands.get(name).copied()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.commands.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(
        _ctx: &mut CommandContext<'_>,
        _args: &[Value],
    ) -> Result<Option<Value>, CommandError> {
        Ok(None)
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = CommandRegistry::new();
        registry.register("ping", noop).unwrap();
        assert!(matches!(
            registry.register("ping", noop),
            Err(RegistryError::Duplicate("ping"))
        ));
    }

    #[test]
    fn lookup_finds_registered_commands() {
        let mut registry = CommandRegistry::new();
        registry.register("ping", noop).unwrap();
        assert!(registry.lookup("ping").is_some());
        assert!(registry.lookup("pong").is_none());
        assert_eq!(registry.names(), vec!["ping"]);
    }
}
