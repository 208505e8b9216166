//! Document values and path navigation

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Field map of a document body. Ordered so that encoding is canonical.
pub type Fields = BTreeMap<String, Value>;

/// A value that can be stored in a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(Fields),
}

impl Value {
    /// An empty object
    pub fn object() -> Self {
        Value::Object(Fields::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(Number::Integer(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(Number::Float(n)) => Some(*n),
            Value::Number(Number::Integer(n)) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Fields> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Fields> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Name of the value's type, used in validation messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(Number::Integer(_)) => "integer",
            Value::Number(Number::Float(_)) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Get a value at a path (e.g., "items[0].name")
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(self);
        }

        let mut current = self;
        for segment in PathSegment::parse(path) {
            match segment {
                PathSegment::Key(key) => {
                    current = current.as_object()?.get(key)?;
                }
                PathSegment::Index(idx) => {
                    current = current.as_array()?.get(idx)?;
                }
            }
        }
        Some(current)
    }

    /// Set a value at a path, creating intermediate objects/arrays as needed
    pub fn set_path(&mut self, path: &str, value: Value) -> crate::Result<()> {
        if path.is_empty() {
            *self = value;
            return Ok(());
        }

        let segments: Vec<PathSegment> = PathSegment::parse(path).collect();
        if segments.is_empty() {
            return Err(crate::Error::InvalidPath(path.to_string()));
        }
        let mut current = self;

        for (i, segment) in segments.iter().enumerate() {
            let is_last = i == segments.len() - 1;

            match segment {
                PathSegment::Key(key) => {
                    if !matches!(current, Value::Object(_)) {
                        *current = Value::object();
                    }

                    if let Value::Object(map) = current {
                        if is_last {
                            map.insert(key.to_string(), value);
                            return Ok(());
                        }
                        current = map.entry(key.to_string()).or_insert(Value::Null);
                    }
                }
                PathSegment::Index(idx) => {
                    if !matches!(current, Value::Array(_)) {
                        *current = Value::Array(Vec::new());
                    }

                    if let Value::Array(arr) = current {
                        while arr.len() <= *idx {
                            arr.push(Value::Null);
                        }
                        if is_last {
                            arr[*idx] = value;
                            return Ok(());
                        }
                        current = &mut arr[*idx];
                    }
                }
            }
        }

        Ok(())
    }

    /// Rank of the value's type in the total order used for sorting
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    /// Total order over values: by type rank first, then by content.
    ///
    /// Integers and floats compare numerically; floats use `total_cmp`.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(Number::Integer(a)), Value::Number(Number::Integer(b))) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.as_f64().total_cmp(&b.as_f64()),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.total_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Object(a), Value::Object(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ord = ka.cmp(kb).then_with(|| va.total_cmp(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    /// Ordering between values of comparable types, `None` across types
    pub fn partial_compare(&self, other: &Value) -> Option<Ordering> {
        if self.type_rank() != other.type_rank() {
            return None;
        }
        Some(self.total_cmp(other))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(Number::Integer(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(Number::Float(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl From<Fields> for Value {
    fn from(v: Fields) -> Self {
        Value::Object(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Number(Number::Integer(i)),
                None => Value::Number(Number::Float(n.as_f64().unwrap_or(f64::NAN))),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => Value::Array(arr.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(Number::Integer(i)) => serde_json::Value::from(*i),
            Value::Number(Number::Float(f)) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(arr) => serde_json::Value::Array(arr.iter().map(Into::into).collect()),
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.into())).collect(),
            ),
        }
    }
}

/// Number type supporting both integers and floats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Integer(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(&self) -> f64 {
        match self {
            Number::Integer(n) => *n as f64,
            Number::Float(n) => *n,
        }
    }
}

/// Path segment for navigating document structure
#[derive(Debug, Clone)]
pub enum PathSegment<'a> {
    Key(&'a str),
    Index(usize),
}

impl<'a> PathSegment<'a> {
    /// Parse a path string into segments
    /// Examples: "foo.bar", "items[0]", "users[0].name"
    pub fn parse(path: &'a str) -> impl Iterator<Item = PathSegment<'a>> {
        PathParser { path, pos: 0 }
    }
}

struct PathParser<'a> {
    path: &'a str,
    pos: usize,
}

impl<'a> Iterator for PathParser<'a> {
    type Item = PathSegment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.pos >= self.path.len() {
                return None;
            }

            let remaining = &self.path[self.pos..];
            let remaining = remaining.strip_prefix('.').unwrap_or(remaining);
            if remaining.is_empty() {
                return None;
            }
            self.pos = self.path.len() - remaining.len();

            if remaining.starts_with('[') {
                if let Some(end) = remaining.find(']') {
                    self.pos += end + 1;
                    if let Ok(idx) = remaining[1..end].parse::<usize>() {
                        return Some(PathSegment::Index(idx));
                    }
                    continue;
                }
            }

            let end = remaining
                .find(|c: char| c == '.' || c == '[')
                .unwrap_or(remaining.len());
            let key = &remaining[..end];
            self.pos += end;

            if !key.is_empty() {
                return Some(PathSegment::Key(key));
            }
            // a stray '[' without a closing bracket
            self.pos += 1;
        }
    }
}
