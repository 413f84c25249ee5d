use thiserror::Error;

use crate::daemon::cookie::CookieSyncError;
use crate::daemon::ipc::IpcError;
use crate::daemon::registry::RegistryError;
use crate::daemon::states::StateError;
use crate::query::{QueryExecError, QueryParseError};
use crate::trigger::TriggerError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the canonical subsystem
/// errors so that `main` and the CLI have a single type to report.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    QueryParse(#[from] QueryParseError),

    #[error(transparent)]
    QueryExec(#[from] QueryExecError),

    #[error(transparent)]
    CookieSync(#[from] CookieSyncError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}
