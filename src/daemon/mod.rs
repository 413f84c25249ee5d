//! Daemon module - the filesystem-observation service.
//!
//! Provides:
//! - Per-root clocks, cookie sync, and the unilateral publisher
//! - Queryable views kept current by per-root watcher threads
//! - The client-state assertion registry
//! - Command registry and per-connection sessions
//! - IPC over a Unix socket

pub mod clock;
pub mod commands;
pub mod cookie;
pub mod core;
pub mod ipc;
pub mod publish;
pub mod registry;
pub mod root;
pub mod run;
pub mod server;
pub mod session;
pub mod states;
pub mod view;
pub mod watcher;

pub use clock::{ClockPosition, RootClock};
pub use cookie::{CookieSync, CookieSyncError, SyncHandle};
pub use core::Daemon;
pub use ipc::{CommandError, IpcError, make_response};
pub use publish::{Publisher, Subscriber, WeakSubscriber};
pub use registry::{CommandRegistry, RegistryError};
pub use root::{Root, RootError, RootRegistry};
pub use run::run_daemon;
pub use session::ClientSession;
pub use states::{AssertedStates, ClientStateAssertion, Disposition, StateError};
pub use view::{FileMeta, FileType, InMemoryView, QueryableView};
