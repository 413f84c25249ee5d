use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Daemon configuration.
///
/// Every field has a default so a missing or partial config file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Quiet period (ms) after the last observed change before a root is
    /// considered settled and triggers are notified.
    pub settle_ms: u64,

    /// Default `sync_timeout` (ms) applied to queries and state assertions
    /// that do not specify one.
    pub sync_timeout_ms: u64,

    /// Default `lock_timeout` (ms) for acquiring the view during a query.
    pub lock_timeout_ms: u64,

    /// How long (seconds) deleted files are remembered by a view before
    /// being aged out. 0 disables age-out.
    pub gc_age_secs: u64,

    /// Listening socket path override.
    pub socket: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settle_ms: 20,
            sync_timeout_ms: 60_000,
            lock_timeout_ms: 1_000,
            gc_age_secs: 43_200,
            socket: None,
        }
    }
}

impl Config {
    pub fn settle_period(&self) -> Duration {
        Duration::from_millis(self.settle_ms.max(1))
    }

    pub fn default_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn default_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn gc_age(&self) -> Option<Duration> {
        (self.gc_age_secs > 0).then(|| Duration::from_secs(self.gc_age_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert!(cfg.settle_ms > 0);
        assert_eq!(cfg.default_sync_timeout(), Duration::from_secs(60));
        assert!(cfg.gc_age().is_some());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str("settle_ms = 5").unwrap();
        assert_eq!(cfg.settle_ms, 5);
        assert_eq!(cfg.sync_timeout_ms, Config::default().sync_timeout_ms);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("no_such_key = 1").is_err());
    }
}
