//! Typed field values for shared records.
//!
//! Records exchanged between participants are ordered maps from field name
//! to a tagged [`FieldValue`]. Equality is structural.

use std::cell::Cell;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

/// Insertion-ordered field map.
pub type FieldMap = IndexMap<String, FieldValue>;

/// Deepest nesting of lists and maps accepted when decoding.
pub const MAX_NESTING: usize = 128;

/// A single value inside a shared record.
///
/// Externally tagged on the wire and in JSON exports. Decoding rejects
/// values nested deeper than [`MAX_NESTING`].
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub enum FieldValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<FieldValue>),
    Map(FieldMap),
}

/// Decoding shape of [`FieldValue`]; variants must stay in the same order.
#[derive(Deserialize)]
#[serde(rename = "FieldValue")]
enum FieldValueRepr {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<FieldValue>),
    Map(FieldMap),
}

impl From<FieldValueRepr> for FieldValue {
    fn from(repr: FieldValueRepr) -> Self {
        match repr {
            FieldValueRepr::Null => FieldValue::Null,
            FieldValueRepr::Bool(b) => FieldValue::Bool(b),
            FieldValueRepr::Number(n) => FieldValue::Number(n),
            FieldValueRepr::Text(s) => FieldValue::Text(s),
            FieldValueRepr::List(items) => FieldValue::List(items),
            FieldValueRepr::Map(map) => FieldValue::Map(map),
        }
    }
}

thread_local! {
    static DECODE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Counts one level of value nesting on the decoding thread.
struct DepthGuard;

impl DepthGuard {
    fn enter() -> Option<Self> {
        DECODE_DEPTH.with(|depth| {
            let next = depth.get() + 1;
            (next <= MAX_NESTING).then(|| {
                depth.set(next);
                DepthGuard
            })
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DECODE_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let _guard = DepthGuard::enter().ok_or_else(|| {
            serde::de::Error::custom(format!("field value nested deeper than {MAX_NESTING}"))
        })?;
        FieldValueRepr::deserialize(deserializer).map(Into::into)
    }
}

impl FieldValue {
    /// Borrow the text content, if this is a textual value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, FieldValue::Text(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Short name of the variant, used in log lines.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "bool",
            FieldValue::Number(_) => "number",
            FieldValue::Text(_) => "text",
            FieldValue::List(_) => "list",
            FieldValue::Map(_) => "map",
        }
    }

    /// Convert into a `serde_json::Value`.
    ///
    /// Non-finite numbers have no JSON representation and become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            FieldValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(b),
            Value::Number(n) => FieldValue::Number(n.as_f64().unwrap_or(0.0)),
            Value::String(s) => FieldValue::Text(s),
            Value::Array(items) => FieldValue::List(items.into_iter().map(Into::into).collect()),
            Value::Object(obj) => {
                FieldValue::Map(obj.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<i32> for FieldValue {
    fn from(n: i32) -> Self {
        FieldValue::Number(f64::from(n))
    }
}

impl From<u64> for FieldValue {
    fn from(n: u64) -> Self {
        FieldValue::Number(n as f64)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Number(n as f64)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<FieldMap> for FieldValue {
    fn from(map: FieldMap) -> Self {
        FieldValue::Map(map)
    }
}

impl From<Vec<FieldValue>> for FieldValue {
    fn from(items: Vec<FieldValue>) -> Self {
        FieldValue::List(items)
    }
}

/// Build a [`FieldMap`] from `(key, value)` pairs, preserving order.
pub fn field_map<K, V, I>(pairs: I) -> FieldMap
where
    K: Into<String>,
    V: Into<FieldValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
