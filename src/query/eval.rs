//! Query execution.
//!
//! `execute` snapshots the clock, optionally cookie-syncs, picks the
//! generators, walks candidates, and renders accepted files.

use std::collections::HashSet;

use serde_json::Value;

use crate::daemon::clock::ClockPosition;
use crate::daemon::root::Root;
use crate::query::clockspec::ClockSpec;
use crate::query::expr::FileView;
use crate::query::{Query, QueryExecError, QueryResult};

/// Resolved `since` basis for one execution.
#[derive(Debug, Clone, Copy)]
pub struct SinceBound {
    pub ticks: Option<u64>,
    pub wall_secs: Option<u64>,
    pub fresh: bool,
}

impl SinceBound {
    pub const FRESH: SinceBound = SinceBound {
        ticks: None,
        wall_secs: None,
        fresh: true,
    };
}

/// Which candidate source to walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generator {
    Time,
    Path,
    Glob,
    AllFiles,
}

/// Accumulates results while generators feed candidates in.
pub struct QueryContext<'a> {
    query: &'a Query,
    pub since_bound: SinceBound,
    pub results: Vec<Value>,
    pub deduped: Vec<String>,
    dedup_seen: HashSet<String>,
    /// Candidates already evaluated; composed generators may yield the
    /// same file more than once.
    seen: HashSet<String>,
}

impl<'a> QueryContext<'a> {
    pub fn new(query: &'a Query, since_bound: SinceBound) -> Self {
        Self {
            query,
            since_bound,
            results: Vec::new(),
            deduped: Vec::new(),
            dedup_seen: HashSet::new(),
            seen: HashSet::new(),
        }
    }

    #[cfg(test)]
    pub fn for_tests(query: &'a Query) -> Self {
        Self::new(query, SinceBound::FRESH)
    }

    /// Offer one candidate file. Applies `relative_root`, the top-level
    /// suffix filter, and the expression; renders on acceptance.
    pub fn candidate(
        &mut self,
        wholename: &str,
        meta: &crate::daemon::view::FileMeta,
    ) -> Result<(), QueryExecError> {
        let adjusted = match &self.query.relative_root {
            None => wholename,
            Some(rel) if rel.is_empty() => wholename,
            Some(rel) => {
                let is_child = wholename.len() > rel.len()
                    && wholename.starts_with(rel.as_str())
                    && wholename.as_bytes()[rel.len()] == b'/';
                if !is_child {
                    return Ok(());
                }
                &wholename[rel.len() + 1..]
            }
        };

        if let Some(suffixes) = &self.query.suffixes {
            let basename = adjusted.rsplit(['/', '\\']).next().unwrap_or(adjusted);
            let matched = basename
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_ascii_lowercase())
                .is_some_and(|ext| suffixes.iter().any(|s| *s == ext));
            if !matched {
                return Ok(());
            }
        }

        if !self.seen.insert(adjusted.to_string()) {
            return Ok(());
        }

        let file = FileView {
            wholename: adjusted,
            meta,
        };
        let accepted = match &self.query.expr {
            Some(expr) => expr.evaluate(&file)?,
            None => true,
        };
        if !accepted {
            return Ok(());
        }

        self.results
            .push(self.query.fields.render_file(adjusted, meta, &self.since_bound));
        if self.query.dedup_results && self.dedup_seen.insert(adjusted.to_string()) {
            self.deduped.push(adjusted.to_string());
        }
        Ok(())
    }
}

/// Execute `query` against `root`'s view.
///
/// `forced` overrides generator selection; triggers pass
/// `Generator::Time` because settle notifications are incremental by
/// construction.
pub fn execute(
    query: &Query,
    root: &Root,
    forced: Option<Generator>,
) -> Result<QueryResult, QueryExecError> {
    let view = root.view_dyn();

    // Sampled before any walk so callers can resume from here.
    let clock_at_start = view.clock_position();

    if !query.sync_timeout.is_zero() {
        root.sync_to_now(query.sync_timeout)?;
    }

    let since_bound = resolve_since(query, root, clock_at_start);
    let mut ctx = QueryContext::new(query, since_bound);

    match forced {
        Some(generator) => run_generator(generator, query, root, &mut ctx)?,
        None => {
            let mut ran_any = false;
            if query.paths.is_some() {
                run_generator(Generator::Path, query, root, &mut ctx)?;
                ran_any = true;
            }
            if query.glob.is_some() {
                run_generator(Generator::Glob, query, root, &mut ctx)?;
                ran_any = true;
            }
            if !ran_any {
                if query.since_spec.is_some() {
                    run_generator(Generator::Time, query, root, &mut ctx)?;
                } else {
                    run_generator(Generator::AllFiles, query, root, &mut ctx)?;
                }
            }
        }
    }

    if let Some(ClockSpec::NamedCursor(name)) = &query.since_spec {
        root.update_cursor(name, clock_at_start.ticks);
    }

    Ok(QueryResult {
        results: ctx.results,
        clock_at_start,
        deduped_file_names: ctx.deduped,
        is_fresh_instance: since_bound.fresh,
    })
}

fn run_generator(
    generator: Generator,
    query: &Query,
    root: &Root,
    ctx: &mut QueryContext<'_>,
) -> Result<(), QueryExecError> {
    let view = root.view_dyn();
    match generator {
        Generator::Time => view.time_generator(query, ctx),
        Generator::Path => view.path_generator(query, ctx),
        Generator::Glob => view.glob_generator(query, ctx),
        Generator::AllFiles => view.all_files_generator(query, ctx),
    }
}

fn resolve_since(query: &Query, root: &Root, _now: ClockPosition) -> SinceBound {
    match &query.since_spec {
        None => SinceBound::FRESH,
        Some(ClockSpec::Clock(pos)) => SinceBound {
            ticks: Some(pos.ticks),
            wall_secs: None,
            fresh: false,
        },
        Some(ClockSpec::Timestamp(secs)) => SinceBound {
            ticks: None,
            wall_secs: Some(*secs),
            fresh: false,
        },
        Some(ClockSpec::NamedCursor(name)) => match root.resolve_cursor(name) {
            Some(ticks) => SinceBound {
                ticks: Some(ticks),
                wall_secs: None,
                fresh: false,
            },
            // First use of a cursor has no basis.
            None => SinceBound::FRESH,
        },
        Some(ClockSpec::FreshInstance) => SinceBound::FRESH,
    }
}
