// Result row values - the dynamic value domain returned by resource graph queries
//
// Query results arrive as JSON objects whose values can be any scalar, a nested
// object or an array of nested objects. They are decoded once into `RowValue`
// so that the flattening engine can match exhaustively over the shape instead
// of probing types at runtime.

use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

/// One result row: column name to value
///
/// A `BTreeMap` keeps key iteration sorted, which makes flattening output
/// deterministic for the same input row.
pub type Row = BTreeMap<String, RowValue>;

/// A dynamically typed value inside a result row
///
/// Narrow integer and float types are widened to their 64-bit representation
/// on construction (see the `From` impls below), so downstream code only ever
/// sees `Int`, `UInt`, `Float`, `String`, `Bool` and `Null` scalars.
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Object(Row),
    Array(Vec<RowValue>),
}

impl RowValue {
    /// Normalizes the value into a list of nested rows for expand fields
    ///
    /// - Object: a single-element list
    /// - Array: every element that is itself an object, in order
    /// - Anything else: empty list (expand is skipped silently)
    pub fn nested_rows(&self) -> Vec<&Row> {
        match self {
            RowValue::Object(row) => vec![row],
            RowValue::Array(items) => items
                .iter()
                .filter_map(|item| match item {
                    RowValue::Object(row) => Some(row),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl From<serde_json::Value> for RowValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => RowValue::Null,
            serde_json::Value::Bool(v) => RowValue::Bool(v),
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    RowValue::Int(v)
                } else if let Some(v) = n.as_u64() {
                    RowValue::UInt(v)
                } else {
                    // as_f64 only fails for arbitrary precision numbers
                    n.as_f64().map(RowValue::Float).unwrap_or(RowValue::Null)
                }
            }
            serde_json::Value::String(v) => RowValue::String(v),
            serde_json::Value::Array(items) => {
                RowValue::Array(items.into_iter().map(RowValue::from).collect())
            }
            serde_json::Value::Object(map) => RowValue::Object(
                map.into_iter()
                    .map(|(key, value)| (key, RowValue::from(value)))
                    .collect(),
            ),
        }
    }
}

impl<'de> Deserialize<'de> for RowValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        serde_json::Value::deserialize(deserializer).map(RowValue::from)
    }
}

macro_rules! widen_to_i64 {
    ($($t:ty),*) => {
        $(impl From<$t> for RowValue {
            fn from(v: $t) -> Self {
                RowValue::Int(i64::from(v))
            }
        })*
    };
}

widen_to_i64!(i8, u8, i16, u16, i32, u32, i64);

impl From<u64> for RowValue {
    fn from(v: u64) -> Self {
        RowValue::UInt(v)
    }
}

impl From<f32> for RowValue {
    fn from(v: f32) -> Self {
        RowValue::Float(f64::from(v))
    }
}

impl From<f64> for RowValue {
    fn from(v: f64) -> Self {
        RowValue::Float(v)
    }
}

impl From<bool> for RowValue {
    fn from(v: bool) -> Self {
        RowValue::Bool(v)
    }
}

impl From<&str> for RowValue {
    fn from(v: &str) -> Self {
        RowValue::String(v.to_string())
    }
}

impl From<String> for RowValue {
    fn from(v: String) -> Self {
        RowValue::String(v)
    }
}

/// Parses a JSON object into a result row
#[cfg(test)]
pub fn parse_row(json: &str) -> Result<Row, serde_json::Error> {
    serde_json::from_str(json)
}
