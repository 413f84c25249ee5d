//! Per-root logical clock.
//!
//! Every observed change batch advances the root's tick counter. A
//! `ClockPosition` pairs that tick with the wall time it was taken at and
//! renders as an opaque clock string that round-trips through parsing.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A monotonic logical position: `(tick, wall time)`.
///
/// Ordered by tick alone; wall time is carried for humans and for
/// timestamp-based since comparisons.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClockPosition {
    pub ticks: u64,
    pub wall_ms: u64,
}

impl ClockPosition {
    pub const ZERO: ClockPosition = ClockPosition {
        ticks: 0,
        wall_ms: 0,
    };

    pub fn new(ticks: u64, wall_ms: u64) -> Self {
        Self { ticks, wall_ms }
    }

    /// Render as an opaque clock string, `c:<wall_ms>:<ticks>`.
    pub fn to_clock_string(&self) -> String {
        format!("c:{}:{}", self.wall_ms, self.ticks)
    }

    /// Parse a clock string produced by [`to_clock_string`].
    ///
    /// `parse(render(p)) == p` for every position p.
    pub fn parse(s: &str) -> Result<Self, ClockParseError> {
        let rest = s
            .strip_prefix("c:")
            .ok_or_else(|| ClockParseError::BadPrefix(s.to_string()))?;
        let (wall, ticks) = rest
            .split_once(':')
            .ok_or_else(|| ClockParseError::Malformed(s.to_string()))?;
        Ok(Self {
            wall_ms: wall
                .parse()
                .map_err(|_| ClockParseError::Malformed(s.to_string()))?,
            ticks: ticks
                .parse()
                .map_err(|_| ClockParseError::Malformed(s.to_string()))?,
        })
    }
}

impl PartialEq for ClockPosition {
    fn eq(&self, other: &Self) -> bool {
        self.ticks == other.ticks
    }
}

impl Eq for ClockPosition {}

impl PartialOrd for ClockPosition {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClockPosition {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ticks.cmp(&other.ticks)
    }
}

impl fmt::Display for ClockPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_clock_string())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockParseError {
    #[error("clock string must start with 'c:', got {0:?}")]
    BadPrefix(String),
    #[error("malformed clock string {0:?}")]
    Malformed(String),
}

/// The tick source for one root.
///
/// `tick()` advances and returns the new position; `position()` observes
/// without advancing. Ticks never decrease, even if the wall clock does.
pub struct RootClock {
    ticks: AtomicU64,
}

impl RootClock {
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(1),
        }
    }

    pub fn tick(&self) -> ClockPosition {
        let ticks = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        ClockPosition {
            ticks,
            wall_ms: now_ms(),
        }
    }

    pub fn position(&self) -> ClockPosition {
        ClockPosition {
            ticks: self.ticks.load(Ordering::Acquire),
            wall_ms: now_ms(),
        }
    }
}

impl Default for RootClock {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_is_monotonic() {
        let clock = RootClock::new();
        let a = clock.tick();
        let b = clock.tick();
        let c = clock.tick();
        assert!(b > a);
        assert!(c > b);
    }

    #[test]
    fn position_does_not_advance() {
        let clock = RootClock::new();
        let a = clock.position();
        let b = clock.position();
        assert_eq!(a.ticks, b.ticks);
        let after = clock.tick();
        assert!(after > a);
    }

    #[test]
    fn clock_string_round_trips() {
        for pos in [
            ClockPosition::ZERO,
            ClockPosition::new(1, 0),
            ClockPosition::new(42, 1_700_000_000_123),
            ClockPosition::new(u64::MAX, u64::MAX),
        ] {
            let rendered = pos.to_clock_string();
            let parsed = ClockPosition::parse(&rendered).unwrap();
            assert_eq!(parsed.ticks, pos.ticks);
            assert_eq!(parsed.wall_ms, pos.wall_ms);
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ClockPosition::parse("").is_err());
        assert!(ClockPosition::parse("n:cursor").is_err());
        assert!(ClockPosition::parse("c:12").is_err());
        assert!(ClockPosition::parse("c:a:b").is_err());
    }

    #[test]
    fn order_is_by_tick_alone() {
        let older = ClockPosition::new(5, 9_999);
        let newer = ClockPosition::new(6, 1);
        assert!(newer > older);
    }
}
