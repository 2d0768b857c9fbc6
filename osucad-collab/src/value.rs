//! Dynamically typed values stored in shared objects.
//!
//! Every floating point component is rounded to [`PRECISION_DIGITS`]
//! decimal places before a value enters a mutation, so all replicas hold
//! bit-identical numbers no matter where the edit came from.

use std::collections::BTreeMap;

use osucad_core::Vec2;
use serde::{Deserialize, Serialize};

/// Decimal digits kept for floating point payloads.
pub const PRECISION_DIGITS: i32 = 3;

/// Round `value` to [`PRECISION_DIGITS`] decimal places. Non-finite input
/// is returned unchanged.
pub fn round_precision(value: f64) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let factor = 10f64.powi(PRECISION_DIGITS);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Vec2(Vec2),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Apply fixed-precision rounding to every float, recursively.
    pub fn normalized(self) -> Value {
        match self {
            Value::Float(f) => Value::Float(round_precision(f)),
            Value::Vec2(v) => Value::Vec2(v.rounded(PRECISION_DIGITS)),
            Value::List(items) => Value::List(items.into_iter().map(Value::normalized).collect()),
            Value::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, v.normalized()))
                    .collect(),
            ),
            other => other,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_vec2(&self) -> Option<Vec2> {
        match self {
            Value::Vec2(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec2> for Value {
    fn from(v: Vec2) -> Self {
        Value::Vec2(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}
