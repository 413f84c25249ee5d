#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
mod paths;
pub mod query;
pub mod telemetry;
pub mod trigger;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers need at the crate root.
pub use crate::daemon::clock::{ClockPosition, RootClock};
pub use crate::daemon::cookie::{CookieSync, CookieSyncError, SyncHandle};
pub use crate::daemon::publish::{Publisher, Subscriber};
pub use crate::daemon::root::{Root, RootRegistry};
pub use crate::daemon::states::{AssertedStates, ClientStateAssertion, Disposition, StateError};
pub use crate::daemon::view::{FileMeta, FileType, InMemoryView, QueryableView};
pub use crate::paths::socket_path;
pub use crate::query::clockspec::ClockSpec;
pub use crate::query::{Query, QueryExecError, QueryParseError, QueryResult};
pub use crate::trigger::{TriggerCommand, TriggerError};
