//! Daemon core: shared state every client session operates against.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::Config;
use crate::daemon::commands;
use crate::daemon::registry::{CommandRegistry, RegistryError};
use crate::daemon::root::RootRegistry;

pub struct Daemon {
    pub roots: RootRegistry,
    pub registry: CommandRegistry,
    pub config: Config,
    /// Process-wide stop flag; every loop polls this between waits.
    pub shutting_down: Arc<AtomicBool>,
    sock_path: PathBuf,
    next_session_id: AtomicU64,
}

impl Daemon {
    pub fn new(config: Config, sock_path: PathBuf) -> Result<Arc<Self>, RegistryError> {
        let registry = commands::build_registry()?;
        Ok(Arc::new(Self {
            roots: RootRegistry::new(sock_path.clone(), config.clone()),
            registry,
            config,
            shutting_down: Arc::new(AtomicBool::new(false)),
            sock_path,
            next_session_id: AtomicU64::new(1),
        }))
    }

    pub fn sock_path(&self) -> &PathBuf {
        &self.sock_path
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::AcqRel)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Flip the stop flag and tear down every root.
    pub fn begin_shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("shutting down");
        self.roots.cancel_all();
    }
}
