//! Query engine: request parsing, expression evaluation, execution.
//!
//! A request document is parsed once into an immutable [`Query`]; execution
//! walks candidates produced by one of the view's generators and renders a
//! field list for every file the expression accepts.

pub mod clockspec;
pub mod eval;
pub mod expr;
pub mod fields;
pub mod glob;
pub mod intcompare;
pub mod parse;

use std::time::Duration;

use thiserror::Error;

pub use clockspec::ClockSpec;
pub use eval::{QueryContext, execute};
pub use expr::Expr;
pub use fields::FieldList;
pub use parse::parse_query;

use crate::daemon::cookie::CookieSyncError;

/// Case mode for name/path matching terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseSensitivity {
    Sensitive,
    Insensitive,
}

/// A `path` generator entry: a directory name plus an optional depth cap
/// (negative = unlimited).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSpec {
    pub name: String,
    pub depth: i64,
}

/// An immutable parsed query.
#[derive(Debug)]
pub struct Query {
    pub expr: Option<Expr>,
    /// Source form of `expr`, echoed by [`Query::render`].
    pub expr_source: Option<serde_json::Value>,
    pub fields: FieldList,
    pub since_spec: Option<ClockSpec>,
    pub relative_root: Option<String>,
    pub paths: Option<Vec<PathSpec>>,
    pub glob: Option<Vec<String>>,
    pub suffixes: Option<Vec<String>>,
    pub sync_timeout: Duration,
    pub lock_timeout: Duration,
    pub dedup_results: bool,
    pub case_sensitive: CaseSensitivity,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            expr: None,
            expr_source: None,
            fields: FieldList::default(),
            since_spec: None,
            relative_root: None,
            paths: None,
            glob: None,
            suffixes: None,
            sync_timeout: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(1),
            dedup_results: false,
            case_sensitive: CaseSensitivity::Sensitive,
        }
    }
}

impl Query {
    /// Re-render the recognized request-document keys. Parsing the result
    /// yields an equivalent query.
    pub fn render(&self) -> serde_json::Value {
        let mut doc = serde_json::Map::new();
        if let Some(source) = &self.expr_source {
            doc.insert("expression".into(), source.clone());
        }
        doc.insert("fields".into(), serde_json::Value::Array(self.fields.names()));
        if let Some(since) = &self.since_spec {
            doc.insert("since".into(), since.render());
        }
        if let Some(rel) = &self.relative_root {
            doc.insert("relative_root".into(), rel.clone().into());
        }
        if let Some(paths) = &self.paths {
            let rendered: Vec<serde_json::Value> = paths
                .iter()
                .map(|p| {
                    if p.depth < 0 {
                        serde_json::Value::String(p.name.clone())
                    } else {
                        serde_json::json!({"path": p.name, "depth": p.depth})
                    }
                })
                .collect();
            doc.insert("path".into(), rendered.into());
        }
        if let Some(glob) = &self.glob {
            doc.insert("glob".into(), glob.clone().into());
        }
        if let Some(suffixes) = &self.suffixes {
            doc.insert("suffix".into(), suffixes.clone().into());
        }
        doc.insert(
            "sync_timeout".into(),
            serde_json::Value::from(self.sync_timeout.as_millis() as u64),
        );
        doc.insert(
            "lock_timeout".into(),
            serde_json::Value::from(self.lock_timeout.as_millis() as u64),
        );
        doc.insert(
            "case_sensitive".into(),
            (self.case_sensitive == CaseSensitivity::Sensitive).into(),
        );
        doc.insert("dedup_results".into(), self.dedup_results.into());
        serde_json::Value::Object(doc)
    }
}

/// Result of one query execution.
#[derive(Debug)]
pub struct QueryResult {
    /// Rendered field values, one per accepted file.
    pub results: Vec<serde_json::Value>,
    /// Sampled from the view before the walk began, so callers can use it
    /// as the `since` basis for the next incremental query.
    pub clock_at_start: crate::daemon::clock::ClockPosition,
    /// Insertion-ordered accepted file names; populated when
    /// `dedup_results` is set.
    pub deduped_file_names: Vec<String>,
    /// True when the query had no usable `since` basis and walked the
    /// whole view.
    pub is_fresh_instance: bool,
}

/// Request-document rejection. Never retried.
#[derive(Debug, Error)]
pub enum QueryParseError {
    #[error("unknown query field {0:?}")]
    UnknownKey(String),

    #[error("unknown expression term {0:?}")]
    UnknownTerm(String),

    #[error("invalid '{term}' term: {message}")]
    Term {
        term: &'static str,
        message: String,
    },

    #[error("invalid clock spec: {0}")]
    InvalidClockSpec(String),

    #[error("{0}")]
    Invalid(String),
}

/// Failure while executing a query. Local to the query, never fatal to
/// the daemon.
#[derive(Debug, Error)]
pub enum QueryExecError {
    #[error("{0} not implemented by this view")]
    NotImplemented(&'static str),

    #[error("could not acquire the view within {0:?}")]
    LockContention(Duration),

    #[error("sync failed: {0}")]
    Sync(#[from] CookieSyncError),

    #[error("generator failure: {0}")]
    Generator(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
