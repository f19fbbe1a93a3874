//! Ordered key/value tree handed to the log writer.

use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use std::borrow::Cow;

pub type Label = Cow<'static, str>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Dict(Vec<(Label, Value)>),
    List(Vec<Value>),
    Str(String),
    Int(i64),
    Uint(u64),
    Bool(bool),
    Time(DateTime<Utc>),
    Null,
    Hex(Vec<u8>),
    /// A user id; the writer may add a resolved name next to it.
    Uid(u32),
    Gid(u32),
}

impl Value {
    /// Convert a JSON snapshot (statistics) into a tree.
    pub fn from_json(v: &Json) -> Value {
        match v {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match (n.as_u64(), n.as_i64()) {
                (Some(u), _) => Value::Uint(u),
                (None, Some(i)) => Value::Int(i),
                _ => Value::Str(n.to_string()),
            },
            Json::String(s) => Value::Str(s.clone()),
            Json::Array(a) => Value::List(a.iter().map(Value::from_json).collect()),
            Json::Object(m) => Value::Dict(
                m.iter().map(|(k, v)| (Label::Owned(k.clone()), Value::from_json(v))).collect(),
            ),
        }
    }

    /// Look up a direct child of a dict.
    pub fn get(&self, label: &str) -> Option<&Value> {
        match self {
            Value::Dict(items) => items.iter().find(|(k, _)| k == label).map(|(_, v)| v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}

/// Builder for a dict that keeps insertion order.
#[derive(Debug, Default)]
pub struct Dict(Vec<(Label, Value)>);

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, label: &'static str, v: impl Into<Value>) -> &mut Self {
        self.0.push((Label::Borrowed(label), v.into()));
        self
    }

    pub fn put_opt<V: Into<Value>>(&mut self, label: &'static str, v: Option<V>) -> &mut Self {
        if let Some(v) = v {
            self.put(label, v);
        }
        self
    }

    pub fn extend(&mut self, other: Value) -> &mut Self {
        if let Value::Dict(items) = other {
            self.0.extend(items);
        }
        self
    }

    pub fn build(self) -> Value {
        Value::Dict(self.0)
    }
}

impl From<Dict> for Value {
    fn from(d: Dict) -> Self {
        d.build()
    }
}
