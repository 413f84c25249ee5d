//! IPC protocol and codec.
//!
//! Protocol: newline-delimited JSON (ndjson) over a Unix socket.
//!
//! Requests are command arrays: `["state-enter", "/root", "mystate"]\n`.
//! Responses and unilateral broadcasts are objects carrying a `version`
//! key; errors are `{"error": {"code": ..., "message": ...}}`.

use std::io::{BufRead, Write};

use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::daemon::cookie::CookieSyncError;
use crate::daemon::root::RootError;
use crate::daemon::states::StateError;
use crate::query::{QueryExecError, QueryParseError};
use crate::trigger::TriggerError;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client disconnected")]
    Disconnected,
}

/// Base response object; handlers add their own keys.
pub fn make_response() -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(
        "version".to_string(),
        Value::String(env!("CARGO_PKG_VERSION").to_string()),
    );
    map
}

/// Read one request line. `Ok(None)` is a clean EOF.
pub fn read_request(line: &str) -> Result<Value, IpcError> {
    Ok(serde_json::from_str(line)?)
}

/// Write one PDU followed by a newline.
pub fn write_pdu(writer: &mut impl Write, pdu: &Value) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, pdu)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Read one line, allowing for read-timeout polling. Returns `Ok(None)`
/// on timeout with no complete line yet.
pub fn read_line_with_timeout(
    reader: &mut impl BufRead,
    line: &mut String,
) -> Result<Option<usize>, IpcError> {
    match reader.read_line(line) {
        Ok(n) => Ok(Some(n)),
        Err(e)
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
        {
            Ok(None)
        }
        Err(e) => Err(IpcError::Io(e)),
    }
}

/// A failed command, tagged so the caller can tell the kinds apart.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0}")]
    Validation(String),

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    QueryParse(#[from] QueryParseError),

    #[error(transparent)]
    QueryExec(#[from] QueryExecError),

    #[error(transparent)]
    Sync(#[from] CookieSyncError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Root(#[from] RootError),
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::Validation(_) => "validation",
            CommandError::UnknownCommand(_) => "unknown_command",
            CommandError::State(StateError::AlreadyAsserted(_)) => "already_asserted",
            CommandError::State(StateError::NotAsserted(_)) => "not_asserted",
            CommandError::State(StateError::ImplicitlyVacated(_)) => "implicitly_vacated",
            CommandError::QueryParse(_) => "query_parse",
            CommandError::QueryExec(QueryExecError::LockContention(_)) => "lock_contention",
            CommandError::QueryExec(QueryExecError::Sync(_)) => "sync_failed",
            CommandError::QueryExec(_) => "query_exec",
            CommandError::Sync(_) => "sync_failed",
            CommandError::Trigger(TriggerError::QueryParse(_)) => "query_parse",
            CommandError::Trigger(_) => "validation",
            CommandError::Root(_) => "root",
        }
    }

    /// Render as an error PDU.
    pub fn to_pdu(&self) -> Value {
        let mut response = make_response();
        response.insert(
            "error".to_string(),
            json!({
                "code": self.code(),
                "message": self.to_string(),
            }),
        );
        Value::Object(response)
    }
}
