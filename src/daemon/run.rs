//! Daemon runner.
//!
//! `fswatchd run` binds the socket and serves until a shutdown signal or
//! a `shutdown-server` command arrives.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::daemon::core::Daemon;
use crate::daemon::ipc::IpcError;
use crate::daemon::server::handle_client;
use crate::{Error, Result};

/// Run the daemon in the current process. Returns once shutdown
/// completes.
pub fn run_daemon(config: Config) -> Result<()> {
    let socket = config
        .socket
        .clone()
        .unwrap_or_else(crate::paths::socket_path);

    if let Some(dir) = socket.parent() {
        std::fs::create_dir_all(dir).map_err(IpcError::from)?;
        let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700));
    }

    // If another daemon is already listening, exit quietly.
    if UnixStream::connect(&socket).is_ok() {
        tracing::warn!("daemon already running on {:?}", socket);
        return Ok(());
    }

    // Remove a stale socket file from a crashed instance.
    let _ = std::fs::remove_file(&socket);

    let listener = UnixListener::bind(&socket).map_err(IpcError::from)?;
    let _ = std::fs::set_permissions(&socket, std::fs::Permissions::from_mode(0o600));
    tracing::info!("daemon listening on {:?}", socket);

    let daemon = Daemon::new(config, socket.clone()).map_err(Error::from)?;

    // SIGTERM/SIGINT set the same flag the command does.
    let _ = signal_hook::flag::register(
        signal_hook::consts::SIGTERM,
        Arc::clone(&daemon.shutting_down),
    );
    let _ = signal_hook::flag::register(
        signal_hook::consts::SIGINT,
        Arc::clone(&daemon.shutting_down),
    );

    listener.set_nonblocking(true).map_err(IpcError::from)?;

    loop {
        if daemon.is_shutting_down() {
            tracing::info!("shutdown requested");
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let daemon = Arc::clone(&daemon);
                std::thread::Builder::new()
                    .name("client handler".to_string())
                    .spawn(move || {
                        let _ = stream.set_nonblocking(false);
                        handle_client(stream, daemon);
                    })
                    .map_err(IpcError::from)?;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                tracing::error!("accept error: {e}");
            }
        }
    }

    daemon.begin_shutdown();

    let _ = std::fs::remove_file(&socket);
    tracing::info!("daemon stopped");
    Ok(())
}
