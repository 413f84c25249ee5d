//! Config loading and schema.

mod load;
mod schema;

pub use load::{apply_env_overrides, config_path, load, load_or_default};
pub use schema::Config;
