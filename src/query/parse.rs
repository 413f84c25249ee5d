//! Request-document parsing.
//!
//! Parsing is strict: unknown top-level keys and unknown expression terms
//! are validation errors. Expression terms dispatch through a name-keyed
//! registry built by explicit, ordered registration; each term parser
//! validates its own arity and argument types.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use crate::daemon::view::FileType;
use crate::query::clockspec::ClockSpec;
use crate::query::expr::{Expr, NameScope, SinceField, SinceOperand};
use crate::query::fields::FieldList;
use crate::query::glob::GlobPattern;
use crate::query::intcompare::{CompareOp, IntCompare};
use crate::query::{CaseSensitivity, PathSpec, Query, QueryParseError};

pub struct ParseContext<'r> {
    pub case_sensitive: CaseSensitivity,
    registry: &'r TermRegistry,
}

impl ParseContext<'_> {
    pub fn parse_term(&self, value: &Value) -> Result<Expr, QueryParseError> {
        self.registry.parse_term(self, value)
    }
}

type TermParser = for<'r> fn(&ParseContext<'r>, &str, &[Value]) -> Result<Expr, QueryParseError>;

/// Name-keyed expression term registry.
pub struct TermRegistry {
    terms: BTreeMap<&'static str, TermParser>,
}

impl TermRegistry {
    fn register(&mut self, name: &'static str, parser: TermParser) -> Result<(), QueryParseError> {
        if self.terms.insert(name, parser).is_some() {
            return Err(QueryParseError::Invalid(format!(
                "term {name:?} registered twice"
            )));
        }
        Ok(())
    }

    /// The standard term set, registered in one explicit pass.
    pub fn standard() -> Result<Self, QueryParseError> {
        let mut registry = TermRegistry {
            terms: BTreeMap::new(),
        };
        registry.register("true", parse_const)?;
        registry.register("false", parse_const)?;
        registry.register("not", parse_not)?;
        registry.register("allof", parse_compound)?;
        registry.register("anyof", parse_compound)?;
        registry.register("name", parse_name)?;
        registry.register("iname", parse_name)?;
        registry.register("dirname", parse_dirname)?;
        registry.register("idirname", parse_dirname)?;
        registry.register("match", parse_match)?;
        registry.register("imatch", parse_match)?;
        registry.register("type", parse_type)?;
        registry.register("exists", parse_exists_empty)?;
        registry.register("empty", parse_exists_empty)?;
        registry.register("size", parse_size)?;
        registry.register("suffix", parse_suffix)?;
        registry.register("since", parse_since)?;
        Ok(registry)
    }

    pub fn parse_term(
        &self,
        ctx: &ParseContext<'_>,
        value: &Value,
    ) -> Result<Expr, QueryParseError> {
        let (name, args): (&str, &[Value]) = match value {
            // A bare string is a no-argument term.
            Value::String(s) => (s.as_str(), &[]),
            Value::Array(items) => {
                let name = items
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        QueryParseError::Invalid(
                            "expression term must start with a term name".into(),
                        )
                    })?;
                (name, &items[1..])
            }
            other => {
                return Err(QueryParseError::Invalid(format!(
                    "expected expression term, got {other}"
                )));
            }
        };
        let parser = self
            .terms
            .get(name)
            .ok_or_else(|| QueryParseError::UnknownTerm(name.to_string()))?;
        parser(ctx, name, args)
    }
}

// ---------------------------------------------------------------------------
// Term parsers
// ---------------------------------------------------------------------------

fn term_case(ctx: &ParseContext<'_>, name: &str) -> CaseSensitivity {
    // The i-prefixed variants force insensitive matching; the plain forms
    // inherit the query's case mode.
    if name.starts_with('i') {
        CaseSensitivity::Insensitive
    } else {
        ctx.case_sensitive
    }
}

fn static_term(name: &str) -> &'static str {
    match name {
        "true" => "true",
        "false" => "false",
        "not" => "not",
        "allof" => "allof",
        "anyof" => "anyof",
        "name" => "name",
        "iname" => "iname",
        "dirname" => "dirname",
        "idirname" => "idirname",
        "match" => "match",
        "imatch" => "imatch",
        "type" => "type",
        "exists" => "exists",
        "empty" => "empty",
        "size" => "size",
        "suffix" => "suffix",
        "since" => "since",
        _ => "term",
    }
}

fn parse_const(_ctx: &ParseContext<'_>, name: &str, args: &[Value]) -> Result<Expr, QueryParseError> {
    if !args.is_empty() {
        return Err(QueryParseError::Term {
            term: static_term(name),
            message: "takes no arguments".into(),
        });
    }
    Ok(if name == "true" { Expr::True } else { Expr::False })
}

fn parse_not(ctx: &ParseContext<'_>, _name: &str, args: &[Value]) -> Result<Expr, QueryParseError> {
    if args.len() != 1 {
        return Err(QueryParseError::Term {
            term: "not",
            message: format!("expected exactly one sub-term, got {}", args.len()),
        });
    }
    Ok(Expr::Not(Box::new(ctx.parse_term(&args[0])?)))
}

fn parse_compound(ctx: &ParseContext<'_>, name: &str, args: &[Value]) -> Result<Expr, QueryParseError> {
    let term = static_term(name);
    if args.is_empty() {
        return Err(QueryParseError::Term {
            term,
            message: "needs at least one sub-term".into(),
        });
    }
    let parsed: Vec<Expr> = args
        .iter()
        .map(|arg| ctx.parse_term(arg))
        .collect::<Result<_, _>>()?;
    Ok(if name == "allof" {
        Expr::AllOf(parsed)
    } else {
        Expr::AnyOf(parsed)
    })
}

fn parse_scope(term: &'static str, value: &Value) -> Result<NameScope, QueryParseError> {
    match value.as_str() {
        Some("basename") => Ok(NameScope::Basename),
        Some("wholename") => Ok(NameScope::Wholename),
        _ => Err(QueryParseError::Term {
            term,
            message: format!("scope must be \"basename\" or \"wholename\", got {value}"),
        }),
    }
}

fn parse_name(ctx: &ParseContext<'_>, name: &str, args: &[Value]) -> Result<Expr, QueryParseError> {
    let term = static_term(name);
    if args.is_empty() || args.len() > 2 {
        return Err(QueryParseError::Term {
            term,
            message: format!("expected 1 or 2 arguments, got {}", args.len()),
        });
    }
    let names = match &args[0] {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or(QueryParseError::Term {
                    term,
                    message: "name list entries must be strings".into(),
                })
            })
            .collect::<Result<_, _>>()?,
        other => {
            return Err(QueryParseError::Term {
                term,
                message: format!("expected string or array of strings, got {other}"),
            });
        }
    };
    let scope = match args.get(1) {
        Some(value) => parse_scope(term, value)?,
        None => NameScope::Basename,
    };
    Ok(Expr::Name {
        names,
        scope,
        case: term_case(ctx, name),
    })
}

fn parse_dirname(ctx: &ParseContext<'_>, name: &str, args: &[Value]) -> Result<Expr, QueryParseError> {
    let term = static_term(name);
    if args.is_empty() || args.len() > 2 {
        return Err(QueryParseError::Term {
            term,
            message: format!("expected 1 or 2 arguments, got {}", args.len()),
        });
    }
    let path = args[0]
        .as_str()
        .ok_or(QueryParseError::Term {
            term,
            message: "first argument must be a string path".into(),
        })?
        .to_string();

    let depth = match args.get(1) {
        None => IntCompare {
            op: CompareOp::Ge,
            operand: 0,
        },
        Some(Value::Array(depth_term)) => {
            if depth_term.first().and_then(Value::as_str) != Some("depth") {
                return Err(QueryParseError::Term {
                    term,
                    message: "second argument must be a relational depth term".into(),
                });
            }
            IntCompare::parse_args(term, &depth_term[1..])?
        }
        Some(other) => {
            return Err(QueryParseError::Term {
                term,
                message: format!("second argument must be a depth term, got {other}"),
            });
        }
    };

    Ok(Expr::DirName {
        path,
        depth,
        case: term_case(ctx, name),
    })
}

fn parse_match(ctx: &ParseContext<'_>, name: &str, args: &[Value]) -> Result<Expr, QueryParseError> {
    let term = static_term(name);
    if args.is_empty() || args.len() > 3 {
        return Err(QueryParseError::Term {
            term,
            message: format!("expected 1 to 3 arguments, got {}", args.len()),
        });
    }
    let pattern = args[0].as_str().ok_or(QueryParseError::Term {
        term,
        message: "pattern must be a string".into(),
    })?;
    let scope = match args.get(1) {
        Some(value) => parse_scope(term, value)?,
        None => NameScope::Basename,
    };
    let mut include_dot_files = false;
    let mut no_escape = false;
    if let Some(flags) = args.get(2) {
        let obj = flags.as_object().ok_or(QueryParseError::Term {
            term,
            message: "flags must be an object".into(),
        })?;
        for (key, value) in obj {
            let flag = value.as_bool().ok_or_else(|| QueryParseError::Term {
                term,
                message: format!("flag {key:?} must be a boolean"),
            })?;
            match key.as_str() {
                "includedotfiles" => include_dot_files = flag,
                "noescape" => no_escape = flag,
                _ => {
                    return Err(QueryParseError::Term {
                        term,
                        message: format!("unknown flag {key:?}"),
                    });
                }
            }
        }
    }
    let pattern = GlobPattern::compile(pattern, term_case(ctx, name), include_dot_files, no_escape)
        .map_err(|e| QueryParseError::Term {
            term,
            message: e.to_string(),
        })?;
    Ok(Expr::Match { pattern, scope })
}

fn parse_type(_ctx: &ParseContext<'_>, _name: &str, args: &[Value]) -> Result<Expr, QueryParseError> {
    if args.len() != 1 {
        return Err(QueryParseError::Term {
            term: "type",
            message: format!("expected exactly one argument, got {}", args.len()),
        });
    }
    let code = args[0].as_str().ok_or(QueryParseError::Term {
        term: "type",
        message: "type code must be a string".into(),
    })?;
    let file_type = match code {
        "f" => FileType::Regular,
        "d" => FileType::Directory,
        "l" => FileType::Symlink,
        other => {
            return Err(QueryParseError::Term {
                term: "type",
                message: format!("unknown type code {other:?}, expected f, d or l"),
            });
        }
    };
    Ok(Expr::Type(file_type))
}

fn parse_exists_empty(
    _ctx: &ParseContext,
    name: &str,
    args: &[Value],
) -> Result<Expr, QueryParseError> {
    if !args.is_empty() {
        return Err(QueryParseError::Term {
            term: static_term(name),
            message: "takes no arguments".into(),
        });
    }
    Ok(if name == "exists" {
        Expr::Exists
    } else {
        Expr::Empty
    })
}

fn parse_size(_ctx: &ParseContext<'_>, _name: &str, args: &[Value]) -> Result<Expr, QueryParseError> {
    Ok(Expr::Size(IntCompare::parse_args("size", args)?))
}

fn parse_suffix(_ctx: &ParseContext<'_>, _name: &str, args: &[Value]) -> Result<Expr, QueryParseError> {
    if args.len() != 1 {
        return Err(QueryParseError::Term {
            term: "suffix",
            message: format!("expected exactly one argument, got {}", args.len()),
        });
    }
    Ok(Expr::Suffix {
        suffixes: parse_suffix_set("suffix", &args[0])?,
    })
}

fn parse_since(_ctx: &ParseContext<'_>, _name: &str, args: &[Value]) -> Result<Expr, QueryParseError> {
    if args.is_empty() || args.len() > 2 {
        return Err(QueryParseError::Term {
            term: "since",
            message: format!("expected 1 or 2 arguments, got {}", args.len()),
        });
    }
    let spec = ClockSpec::parse(&args[0])?;
    let field = match args.get(1) {
        None => SinceField::OClock,
        Some(value) => match value.as_str() {
            Some("oclock") => SinceField::OClock,
            Some("cclock") => SinceField::CClock,
            Some("mtime") => SinceField::Mtime,
            Some("ctime") => SinceField::Ctime,
            _ => {
                return Err(QueryParseError::Term {
                    term: "since",
                    message: format!(
                        "field must be oclock, cclock, mtime or ctime, got {value}"
                    ),
                });
            }
        },
    };
    let operand = match (&spec, field) {
        (ClockSpec::Clock(pos), SinceField::OClock | SinceField::CClock) => {
            SinceOperand::Ticks(pos.ticks)
        }
        (ClockSpec::Clock(_), SinceField::Mtime | SinceField::Ctime) => {
            return Err(QueryParseError::Term {
                term: "since",
                message: "wall-time fields need a timestamp, not a clock".into(),
            });
        }
        (ClockSpec::Timestamp(secs), _) => SinceOperand::Timestamp(*secs),
        (ClockSpec::NamedCursor(_) | ClockSpec::FreshInstance, _) => {
            return Err(QueryParseError::Term {
                term: "since",
                message: "since terms need a clock or timestamp spec".into(),
            });
        }
    };
    Ok(Expr::Since {
        spec: operand,
        field,
    })
}

fn parse_suffix_set(term: &'static str, value: &Value) -> Result<Vec<String>, QueryParseError> {
    match value {
        Value::String(s) => Ok(vec![s.to_ascii_lowercase()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(|s| s.to_ascii_lowercase())
                    .ok_or(QueryParseError::Term {
                        term,
                        message: "suffix entries must be strings".into(),
                    })
            })
            .collect(),
        other => Err(QueryParseError::Term {
            term,
            message: format!("expected string or array of strings, got {other}"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Top-level request document
// ---------------------------------------------------------------------------

const RECOGNIZED_KEYS: [&str; 11] = [
    "expression",
    "fields",
    "since",
    "relative_root",
    "path",
    "glob",
    "suffix",
    "sync_timeout",
    "case_sensitive",
    "dedup_results",
    "lock_timeout",
];

/// Parse a request document with the built-in defaults.
pub fn parse_query(doc: &Value) -> Result<Query, QueryParseError> {
    let defaults = Query::default();
    parse_query_with_defaults(doc, defaults.sync_timeout, defaults.lock_timeout)
}

/// Parse a request document, using the daemon's configured defaults for
/// any timeout the document does not set.
pub fn parse_query_with_defaults(
    doc: &Value,
    default_sync_timeout: Duration,
    default_lock_timeout: Duration,
) -> Result<Query, QueryParseError> {
    let obj = doc.as_object().ok_or_else(|| {
        QueryParseError::Invalid(format!("query must be an object, got {doc}"))
    })?;

    for key in obj.keys() {
        if !RECOGNIZED_KEYS.contains(&key.as_str()) {
            return Err(QueryParseError::UnknownKey(key.clone()));
        }
    }

    let mut query = Query {
        sync_timeout: default_sync_timeout,
        lock_timeout: default_lock_timeout,
        ..Query::default()
    };

    if let Some(value) = obj.get("case_sensitive") {
        let sensitive = value.as_bool().ok_or_else(|| {
            QueryParseError::Invalid("case_sensitive must be a boolean".into())
        })?;
        query.case_sensitive = if sensitive {
            CaseSensitivity::Sensitive
        } else {
            CaseSensitivity::Insensitive
        };
    }

    if let Some(value) = obj.get("dedup_results") {
        query.dedup_results = value.as_bool().ok_or_else(|| {
            QueryParseError::Invalid("dedup_results must be a boolean".into())
        })?;
    }

    if let Some(value) = obj.get("sync_timeout") {
        query.sync_timeout = parse_timeout("sync_timeout", value)?;
    }

    if let Some(value) = obj.get("lock_timeout") {
        query.lock_timeout = parse_timeout("lock_timeout", value)?;
    }

    if let Some(value) = obj.get("fields") {
        let items = value.as_array().ok_or_else(|| {
            QueryParseError::Invalid("fields must be an array of field names".into())
        })?;
        query.fields = FieldList::parse(items)?;
    }

    if let Some(value) = obj.get("since") {
        query.since_spec = Some(ClockSpec::parse(value)?);
    }

    if let Some(value) = obj.get("relative_root") {
        let rel = value.as_str().ok_or_else(|| {
            QueryParseError::Invalid("relative_root must be a string".into())
        })?;
        query.relative_root = Some(rel.trim_end_matches('/').to_string());
    }

    if let Some(value) = obj.get("path") {
        query.paths = Some(parse_path_list(value)?);
    }

    if let Some(value) = obj.get("glob") {
        let items = value.as_array().ok_or_else(|| {
            QueryParseError::Invalid("glob must be an array of patterns".into())
        })?;
        let globs: Vec<String> = items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    QueryParseError::Invalid("glob patterns must be strings".into())
                })
            })
            .collect::<Result<_, _>>()?;
        query.glob = Some(globs);
    }

    if let Some(value) = obj.get("suffix") {
        query.suffixes = Some(parse_suffix_set("suffix", value)?);
    }

    if let Some(value) = obj.get("expression") {
        let registry = TermRegistry::standard()?;
        let ctx = ParseContext {
            case_sensitive: query.case_sensitive,
            registry: &registry,
        };
        query.expr = Some(ctx.parse_term(value)?);
        query.expr_source = Some(value.clone());
    }

    Ok(query)
}

fn parse_timeout(key: &str, value: &Value) -> Result<Duration, QueryParseError> {
    value
        .as_u64()
        .map(Duration::from_millis)
        .ok_or_else(|| QueryParseError::Invalid(format!("{key} must be an integer >= 0")))
}

fn parse_path_list(value: &Value) -> Result<Vec<PathSpec>, QueryParseError> {
    let items = value.as_array().ok_or_else(|| {
        QueryParseError::Invalid("path must be an array".into())
    })?;
    items
        .iter()
        .map(|item| match item {
            Value::String(s) => Ok(PathSpec {
                name: s.trim_end_matches('/').to_string(),
                depth: -1,
            }),
            Value::Object(obj) => {
                let name = obj
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        QueryParseError::Invalid("path entry needs a \"path\" string".into())
                    })?
                    .trim_end_matches('/')
                    .to_string();
                let depth = obj
                    .get("depth")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| {
                        QueryParseError::Invalid("path entry needs an integer \"depth\"".into())
                    })?;
                for key in obj.keys() {
                    if key != "path" && key != "depth" {
                        return Err(QueryParseError::Invalid(format!(
                            "unknown path entry key {key:?}"
                        )));
                    }
                }
                Ok(PathSpec { name, depth })
            }
            other => Err(QueryParseError::Invalid(format!(
                "path entries must be strings or objects, got {other}"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let err = parse_query(&json!({"nonsense": 1})).unwrap_err();
        assert!(matches!(err, QueryParseError::UnknownKey(k) if k == "nonsense"));
    }

    #[test]
    fn unknown_term_is_rejected() {
        let err = parse_query(&json!({"expression": ["frobnicate"]})).unwrap_err();
        assert!(matches!(err, QueryParseError::UnknownTerm(t) if t == "frobnicate"));
    }

    #[test]
    fn negative_sync_timeout_is_rejected() {
        assert!(parse_query(&json!({"sync_timeout": -1})).is_err());
        assert!(parse_query(&json!({"sync_timeout": 0})).is_ok());
    }

    #[test]
    fn dirname_arity_and_shape() {
        assert!(parse_query(&json!({"expression": ["dirname"]})).is_err());
        assert!(parse_query(&json!({"expression": ["dirname", 3]})).is_err());
        assert!(
            parse_query(&json!({"expression": ["dirname", "sub", ["depth", "eq", 1], "x"]}))
                .is_err()
        );
        assert!(
            parse_query(&json!({"expression": ["dirname", "sub", ["height", "eq", 1]]})).is_err()
        );
        assert!(
            parse_query(&json!({"expression": ["dirname", "sub", ["depth", "between", 1]]}))
                .is_err()
        );

        let query =
            parse_query(&json!({"expression": ["dirname", "sub", ["depth", "eq", 1]]})).unwrap();
        match query.expr.unwrap() {
            Expr::DirName { path, depth, .. } => {
                assert_eq!(path, "sub");
                assert_eq!(depth, IntCompare { op: CompareOp::Eq, operand: 1 });
            }
            other => panic!("unexpected expr {other:?}"),
        }
    }

    #[test]
    fn bare_string_terms() {
        let query = parse_query(&json!({"expression": "exists"})).unwrap();
        assert!(matches!(query.expr, Some(Expr::Exists)));
        let query = parse_query(&json!({"expression": "true"})).unwrap();
        assert!(matches!(query.expr, Some(Expr::True)));
    }

    #[test]
    fn iname_forces_insensitive() {
        let query = parse_query(&json!({"expression": ["iname", "README"]})).unwrap();
        match query.expr.unwrap() {
            Expr::Name { case, .. } => assert_eq!(case, CaseSensitivity::Insensitive),
            other => panic!("unexpected expr {other:?}"),
        }
    }

    #[test]
    fn case_mode_flows_into_plain_terms() {
        let query = parse_query(&json!({
            "case_sensitive": false,
            "expression": ["name", "readme"],
        }))
        .unwrap();
        match query.expr.unwrap() {
            Expr::Name { case, .. } => assert_eq!(case, CaseSensitivity::Insensitive),
            other => panic!("unexpected expr {other:?}"),
        }
    }

    #[test]
    fn match_flags() {
        assert!(parse_query(&json!({
            "expression": ["match", "*.c", "wholename", {"bogus": true}]
        }))
        .is_err());
        let query = parse_query(&json!({
            "expression": ["match", "*.c", "wholename", {"includedotfiles": true}]
        }))
        .unwrap();
        assert!(matches!(query.expr, Some(Expr::Match { .. })));
    }

    #[test]
    fn since_term_field_rules() {
        assert!(parse_query(&json!({"expression": ["since", "c:1:2", "mtime"]})).is_err());
        assert!(parse_query(&json!({"expression": ["since", "n:cur"]})).is_err());
        assert!(parse_query(&json!({"expression": ["since", 1700000000, "mtime"]})).is_ok());
        assert!(parse_query(&json!({"expression": ["since", "c:1:2"]})).is_ok());
    }

    #[test]
    fn path_entries() {
        let query = parse_query(&json!({
            "path": ["sub/", {"path": "other", "depth": 2}]
        }))
        .unwrap();
        assert_eq!(
            query.paths.unwrap(),
            vec![
                PathSpec { name: "sub".into(), depth: -1 },
                PathSpec { name: "other".into(), depth: 2 },
            ]
        );
        assert!(parse_query(&json!({"path": [{"path": "x"}]})).is_err());
        assert!(parse_query(&json!({"path": [{"path": "x", "depth": 1, "junk": 2}]})).is_err());
    }

    #[test]
    fn parse_render_parse_is_stable() {
        let doc = json!({
            "expression": ["allof", ["type", "f"], ["suffix", "c"]],
            "fields": ["name", "size"],
            "since": "c:100:5",
            "relative_root": "src",
            "glob": ["**/*.c"],
            "sync_timeout": 1234,
            "lock_timeout": 99,
            "case_sensitive": true,
            "dedup_results": true,
        });
        let query = parse_query(&doc).unwrap();
        let rendered = query.render();
        // Every key in the original document survives with its value.
        for (key, value) in doc.as_object().unwrap() {
            assert_eq!(rendered.get(key), Some(value), "key {key}");
        }
        // And re-parsing the rendered form is equivalent.
        let reparsed = parse_query(&rendered).unwrap();
        assert_eq!(reparsed.render(), rendered);
    }
}
