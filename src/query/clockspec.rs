//! Clock specifications for `since` constraints.
//!
//! A spec is either absolute (a parsed clock string) or relative: a named
//! cursor, a unix timestamp, or the fresh-instance token.

use serde_json::Value;

use crate::daemon::clock::ClockPosition;
use crate::query::QueryParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockSpec {
    /// An absolute position previously handed out by this daemon.
    Clock(ClockPosition),
    /// A named cursor maintained per root (`n:<name>`).
    NamedCursor(String),
    /// Unix timestamp in seconds.
    Timestamp(u64),
    /// The `"fresh"` token: no basis, walk everything.
    FreshInstance,
}

impl ClockSpec {
    /// Parse a spec from a request document value.
    pub fn parse(value: &Value) -> Result<Self, QueryParseError> {
        match value {
            Value::String(s) => {
                if s == "fresh" {
                    Ok(ClockSpec::FreshInstance)
                } else if s.starts_with("c:") {
                    ClockPosition::parse(s)
                        .map(ClockSpec::Clock)
                        .map_err(|e| QueryParseError::InvalidClockSpec(e.to_string()))
                } else if let Some(name) = s.strip_prefix("n:") {
                    if name.is_empty() {
                        Err(QueryParseError::InvalidClockSpec(
                            "named cursor must not be empty".into(),
                        ))
                    } else {
                        Ok(ClockSpec::NamedCursor(name.to_string()))
                    }
                } else {
                    Err(QueryParseError::InvalidClockSpec(format!(
                        "unrecognized clock spec {s:?}"
                    )))
                }
            }
            Value::Number(n) => n
                .as_u64()
                .map(ClockSpec::Timestamp)
                .ok_or_else(|| {
                    QueryParseError::InvalidClockSpec(format!(
                        "timestamp must be a non-negative integer, got {n}"
                    ))
                }),
            other => Err(QueryParseError::InvalidClockSpec(format!(
                "expected string or integer, got {other}"
            ))),
        }
    }

    /// Render back to the request-document form.
    pub fn render(&self) -> Value {
        match self {
            ClockSpec::Clock(pos) => Value::String(pos.to_clock_string()),
            ClockSpec::NamedCursor(name) => Value::String(format!("n:{name}")),
            ClockSpec::Timestamp(secs) => Value::from(*secs),
            ClockSpec::FreshInstance => Value::String("fresh".into()),
        }
    }

    pub fn is_clock(&self) -> bool {
        matches!(self, ClockSpec::Clock(_))
    }

    /// A spec is relative when satisfying it requires consulting the
    /// root's history rather than an absolute position.
    pub fn is_relative(&self) -> bool {
        !self.is_clock()
    }
}
