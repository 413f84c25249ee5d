//! Relational integer comparison used by `depth` and `size` terms.

use serde_json::Value;

use crate::query::QueryParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "eq" => Some(CompareOp::Eq),
            "ne" => Some(CompareOp::Ne),
            "gt" => Some(CompareOp::Gt),
            "ge" => Some(CompareOp::Ge),
            "lt" => Some(CompareOp::Lt),
            "le" => Some(CompareOp::Le),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntCompare {
    pub op: CompareOp,
    pub operand: i64,
}

impl IntCompare {
    pub fn eval(&self, value: i64) -> bool {
        match self.op {
            CompareOp::Eq => value == self.operand,
            CompareOp::Ne => value != self.operand,
            CompareOp::Gt => value > self.operand,
            CompareOp::Ge => value >= self.operand,
            CompareOp::Lt => value < self.operand,
            CompareOp::Le => value <= self.operand,
        }
    }

    /// Parse the trailing `[op, operand]` of a relational term such as
    /// `["depth", "ge", 2]` (`args` here is `["ge", 2]`).
    pub fn parse_args(term: &'static str, args: &[Value]) -> Result<Self, QueryParseError> {
        if args.len() != 2 {
            return Err(QueryParseError::Term {
                term,
                message: format!("expected [operator, operand], got {} arguments", args.len()),
            });
        }
        let op_name = args[0].as_str().ok_or_else(|| QueryParseError::Term {
            term,
            message: "operator must be a string".into(),
        })?;
        let op = CompareOp::parse(op_name).ok_or_else(|| QueryParseError::Term {
            term,
            message: format!("unknown operator {op_name:?}, expected eq|ne|gt|ge|lt|le"),
        })?;
        let operand = args[1].as_i64().ok_or_else(|| QueryParseError::Term {
            term,
            message: "operand must be an integer".into(),
        })?;
        Ok(IntCompare { op, operand })
    }
}
