//! Client connection handling.
//!
//! One handler thread per connection reads command arrays; a companion
//! writer thread drains the session's pending-response queue. Responses
//! and forwarded broadcasts share that queue, so each client observes
//! them in the order they were produced.

use std::io::BufReader;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::unbounded;
use serde_json::Value;

use crate::daemon::commands::CommandContext;
use crate::daemon::core::Daemon;
use crate::daemon::ipc::{CommandError, read_line_with_timeout, read_request, write_pdu};
use crate::daemon::session::{self, ClientSession};

/// How often an idle connection re-checks the shutdown flag.
const READ_POLL: Duration = Duration::from_millis(500);

pub fn handle_client(stream: UnixStream, daemon: Arc<Daemon>) {
    let session_id = daemon.next_session_id();
    tracing::debug!(session_id, "client connected");

    let writer_stream = match stream.try_clone() {
        Ok(clone) => clone,
        Err(err) => {
            tracing::error!(session_id, "cannot clone client stream: {err}");
            return;
        }
    };
    if let Err(err) = stream.set_read_timeout(Some(READ_POLL)) {
        tracing::error!(session_id, "cannot set read timeout: {err}");
        return;
    }

    let (response_tx, response_rx) = unbounded::<Value>();
    let writer = std::thread::Builder::new()
        .name(format!("client {session_id} writer"))
        .spawn(move || {
            let mut stream = writer_stream;
            for pdu in response_rx {
                if let Err(err) = write_pdu(&mut stream, &pdu) {
                    tracing::debug!("client write failed: {err}");
                    break;
                }
            }
        })
        .expect("failed to spawn writer thread");

    let mut session = ClientSession::new(session_id, response_tx);
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        if daemon.is_shutting_down() {
            break;
        }
        match read_line_with_timeout(&mut reader, &mut line) {
            // Timeout: poll the shutdown flag again. A partial line, if
            // any, stays buffered in `line`.
            Ok(None) => continue,
            Ok(Some(0)) => break,
            Ok(Some(_)) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    match read_request(trimmed) {
                        Ok(request) => dispatch(&daemon, &mut session, &request),
                        Err(err) => {
                            session.send(
                                CommandError::Validation(format!("invalid request: {err}"))
                                    .to_pdu(),
                            );
                        }
                    }
                }
                line.clear();
            }
            Err(err) => {
                tracing::debug!(session_id, "client read failed: {err}");
                break;
            }
        }
    }

    // Implicit vacate of anything the client still holds.
    session::vacate_states(&mut session);

    drop(session);
    let _ = writer.join();
    tracing::debug!(session_id, "client disconnected");
}

fn dispatch(daemon: &Arc<Daemon>, session: &mut ClientSession, request: &Value) {
    let outcome = dispatch_inner(daemon, session, request);
    match outcome {
        Ok(Some(response)) => session.send(response),
        // The handler already responded.
        Ok(None) => {}
        Err(err) => {
            tracing::debug!(command = %request, "command failed: {err}");
            session.send(err.to_pdu());
        }
    }
}

fn dispatch_inner(
    daemon: &Arc<Daemon>,
    session: &mut ClientSession,
    request: &Value,
) -> Result<Option<Value>, CommandError> {
    let args = request
        .as_array()
        .ok_or_else(|| CommandError::Validation("request must be a command array".into()))?;
    let name = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| {
            CommandError::Validation("first element must be the command name".into())
        })?;
    let handler = daemon
        .registry
        .lookup(name)
        .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;
    let mut ctx = CommandContext { daemon, session };
    handler(&mut ctx, args)
}
