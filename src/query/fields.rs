//! Field list parsing and rendering.
//!
//! A query's `fields` selects what is emitted per accepted file. The
//! single-field `["name"]` case renders bare strings so name lists stay
//! cheap to produce and consume.

use serde_json::{Map, Value, json};

use crate::daemon::view::FileMeta;
use crate::query::QueryParseError;
use crate::query::eval::SinceBound;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Name,
    Exists,
    New,
    Size,
    Mode,
    Mtime,
    Ctime,
    OClock,
    CClock,
    Type,
}

impl Field {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "name" => Some(Field::Name),
            "exists" => Some(Field::Exists),
            "new" => Some(Field::New),
            "size" => Some(Field::Size),
            "mode" => Some(Field::Mode),
            "mtime" => Some(Field::Mtime),
            "ctime" => Some(Field::Ctime),
            "oclock" => Some(Field::OClock),
            "cclock" => Some(Field::CClock),
            "type" => Some(Field::Type),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Exists => "exists",
            Field::New => "new",
            Field::Size => "size",
            Field::Mode => "mode",
            Field::Mtime => "mtime",
            Field::Ctime => "ctime",
            Field::OClock => "oclock",
            Field::CClock => "cclock",
            Field::Type => "type",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldList(Vec<Field>);

impl Default for FieldList {
    fn default() -> Self {
        FieldList(vec![Field::Name])
    }
}

impl FieldList {
    pub fn new(fields: Vec<Field>) -> Self {
        FieldList(fields)
    }

    pub fn parse(values: &[Value]) -> Result<Self, QueryParseError> {
        if values.is_empty() {
            return Err(QueryParseError::Invalid(
                "field list must not be empty".into(),
            ));
        }
        let mut fields = Vec::with_capacity(values.len());
        for value in values {
            let name = value.as_str().ok_or_else(|| {
                QueryParseError::Invalid(format!("field names must be strings, got {value}"))
            })?;
            let field = Field::parse(name)
                .ok_or_else(|| QueryParseError::Invalid(format!("unknown field {name:?}")))?;
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
        Ok(FieldList(fields))
    }

    pub fn is_name_only(&self) -> bool {
        self.0 == [Field::Name]
    }

    pub fn names(&self) -> Vec<Value> {
        self.0
            .iter()
            .map(|f| Value::String(f.as_str().to_string()))
            .collect()
    }

    /// Render one accepted file.
    pub fn render_file(&self, wholename: &str, meta: &FileMeta, bound: &SinceBound) -> Value {
        if self.is_name_only() {
            return Value::String(wholename.to_string());
        }
        let mut out = Map::new();
        for field in &self.0 {
            let value = match field {
                Field::Name => json!(wholename),
                Field::Exists => json!(meta.exists),
                Field::New => json!(is_new(meta, bound)),
                Field::Size => json!(meta.size),
                Field::Mode => json!(meta.mode),
                Field::Mtime => json!(meta.mtime_ms / 1000),
                Field::Ctime => json!(meta.ctime_ms / 1000),
                Field::OClock => json!(meta.otime.to_clock_string()),
                Field::CClock => json!(format!("c:{}:{}", meta.ctime_ms, meta.created_tick)),
                Field::Type => json!(meta.file_type.as_char().to_string()),
            };
            out.insert(field.as_str().to_string(), value);
        }
        Value::Object(out)
    }
}

/// A file is new when it appeared after the query's basis; on a fresh
/// instance everything is new.
fn is_new(meta: &FileMeta, bound: &SinceBound) -> bool {
    if bound.fresh {
        return true;
    }
    match bound.ticks {
        Some(ticks) => meta.created_tick > ticks,
        None => true,
    }
}
