//! XDG directory helpers for runtime/config locations.

use std::path::PathBuf;

/// Base directory for runtime state (the listening socket).
///
/// Uses `FSWATCHD_RUNTIME_DIR` if set, otherwise `$XDG_RUNTIME_DIR/fswatchd`
/// or a per-user directory under the system temp dir.
pub fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FSWATCHD_RUNTIME_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_RUNTIME_DIR")
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| PathBuf::from(s).join("fswatchd"))
        .unwrap_or_else(|| {
            std::env::temp_dir().join(format!("fswatchd-{}", std::process::id()))
        })
}

/// Directory for the user config file.
///
/// `FSWATCHD_CONFIG_DIR` overrides; otherwise `$XDG_CONFIG_HOME/fswatchd`
/// or `~/.config/fswatchd`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FSWATCHD_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("fswatchd")
}

/// Default path of the daemon's listening socket.
pub fn socket_path() -> PathBuf {
    runtime_dir().join("fswatchd.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_lives_under_runtime_dir() {
        let sock = socket_path();
        assert!(sock.starts_with(runtime_dir()));
        assert_eq!(sock.file_name().unwrap(), "fswatchd.sock");
    }
}
