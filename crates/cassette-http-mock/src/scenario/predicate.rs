//! JSON-body predicate tree.
//!
//! Leaves select a value with a gjson-style dot path (no `$` prefix; numeric
//! segments index into arrays) and test it; combinators compose. A body that
//! is not valid JSON makes every field-requiring leaf yield no match.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum PredicateError {
    #[error("empty field path")]
    EmptyField,
    #[error("invalid regex {pattern:?}: {source}")]
    Regex {
        pattern: String,
        source: regex::Error,
    },
}

/// Predicate configuration as written in the scenario YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyPredicate {
    /// Structural equality of the selected value.
    Eq(FieldValue<Value>),
    /// Selected string value matches the regular expression.
    Rx(FieldValue<String>),
    Gt(FieldValue<f64>),
    Lt(FieldValue<f64>),
    Gte(FieldValue<f64>),
    Lte(FieldValue<f64>),
    /// Matches iff every child matches.
    And(Vec<BodyPredicate>),
    /// Matches iff any child matches.
    Or(Vec<BodyPredicate>),
    Not(Box<BodyPredicate>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldValue<T> {
    pub field: String,
    pub value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Lt,
    Gte,
    Lte,
}

/// Compiled form: field paths pre-split, regexes pre-built.
#[derive(Debug, Clone)]
pub enum CompiledPredicate {
    Eq { path: Vec<String>, value: Value },
    Rx { path: Vec<String>, regex: Regex },
    Cmp {
        path: Vec<String>,
        op: CmpOp,
        value: f64,
    },
    And(Vec<CompiledPredicate>),
    Or(Vec<CompiledPredicate>),
    Not(Box<CompiledPredicate>),
}

impl CompiledPredicate {
    pub fn compile(predicate: &BodyPredicate) -> Result<Self, PredicateError> {
        match predicate {
            BodyPredicate::Eq(leaf) => Ok(CompiledPredicate::Eq {
                path: parse_field_path(&leaf.field)?,
                value: leaf.value.clone(),
            }),
            BodyPredicate::Rx(leaf) => Ok(CompiledPredicate::Rx {
                path: parse_field_path(&leaf.field)?,
                regex: Regex::new(&leaf.value).map_err(|source| PredicateError::Regex {
                    pattern: leaf.value.clone(),
                    source,
                })?,
            }),
            BodyPredicate::Gt(leaf) => compile_cmp(leaf, CmpOp::Gt),
            BodyPredicate::Lt(leaf) => compile_cmp(leaf, CmpOp::Lt),
            BodyPredicate::Gte(leaf) => compile_cmp(leaf, CmpOp::Gte),
            BodyPredicate::Lte(leaf) => compile_cmp(leaf, CmpOp::Lte),
            BodyPredicate::And(children) => Ok(CompiledPredicate::And(compile_all(children)?)),
            BodyPredicate::Or(children) => Ok(CompiledPredicate::Or(compile_all(children)?)),
            BodyPredicate::Not(inner) => {
                Ok(CompiledPredicate::Not(Box::new(Self::compile(inner)?)))
            }
        }
    }

    /// Evaluate against the parsed request body (`None` when the body was not
    /// valid JSON).
    pub fn matches(&self, body: Option<&Value>) -> bool {
        match self {
            CompiledPredicate::Eq { path, value } => body
                .and_then(|b| resolve(b, path))
                .is_some_and(|v| v == value),
            CompiledPredicate::Rx { path, regex } => body
                .and_then(|b| resolve(b, path))
                .and_then(Value::as_str)
                .is_some_and(|s| regex.is_match(s)),
            CompiledPredicate::Cmp { path, op, value } => body
                .and_then(|b| resolve(b, path))
                .and_then(Value::as_f64)
                .is_some_and(|n| match op {
                    CmpOp::Gt => n > *value,
                    CmpOp::Lt => n < *value,
                    CmpOp::Gte => n >= *value,
                    CmpOp::Lte => n <= *value,
                }),
            CompiledPredicate::And(children) => children.iter().all(|c| c.matches(body)),
            CompiledPredicate::Or(children) => children.iter().any(|c| c.matches(body)),
            CompiledPredicate::Not(inner) => !inner.matches(body),
        }
    }
}

fn compile_cmp(leaf: &FieldValue<f64>, op: CmpOp) -> Result<CompiledPredicate, PredicateError> {
    Ok(CompiledPredicate::Cmp {
        path: parse_field_path(&leaf.field)?,
        op,
        value: leaf.value,
    })
}

fn compile_all(children: &[BodyPredicate]) -> Result<Vec<CompiledPredicate>, PredicateError> {
    children.iter().map(CompiledPredicate::compile).collect()
}

fn parse_field_path(field: &str) -> Result<Vec<String>, PredicateError> {
    if field.is_empty() {
        return Err(PredicateError::EmptyField);
    }
    let segments: Vec<String> = field.split('.').map(str::to_string).collect();
    if segments.iter().any(String::is_empty) {
        return Err(PredicateError::EmptyField);
    }
    Ok(segments)
}

fn resolve<'a>(mut value: &'a Value, path: &[String]) -> Option<&'a Value> {
    for segment in path {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}
