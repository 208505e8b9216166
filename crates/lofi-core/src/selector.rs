//! Selectors and queries over document fields
//!
//! Selectors can be built programmatically or parsed from a Mango-style
//! JSON object:
//!
//! ```text
//! {"done": false, "name": {"$prefix": "buy"}}
//! {"$or": [{"priority": {"$gte": 3}}, {"tags": {"$in": ["urgent"]}}]}
//! ```

use crate::document::Document;
use crate::error::{Error, Result};
use crate::value::Value;
use std::cmp::Ordering;

/// Predicate over document fields
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    All,
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    In(String, Vec<Value>),
    Nin(String, Vec<Value>),
    Exists(String, bool),
    Prefix(String, String),
    And(Vec<Selector>),
    Or(Vec<Selector>),
    Not(Box<Selector>),
}

impl Selector {
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Selector::Eq(path.into(), value.into())
    }

    pub fn and(self, other: Selector) -> Self {
        match self {
            Selector::All => other,
            Selector::And(mut parts) => {
                parts.push(other);
                Selector::And(parts)
            }
            s => Selector::And(vec![s, other]),
        }
    }

    /// Evaluate against a document body
    pub fn matches(&self, doc: &Document) -> bool {
        self.matches_value(&doc.data)
    }

    pub fn matches_value(&self, data: &Value) -> bool {
        let cmp = |path: &str, v: &Value| data.get_path(path).and_then(|f| f.partial_compare(v));
        match self {
            Selector::All => true,
            Selector::Eq(path, v) => data.get_path(path).map_or(v.is_null(), |f| f == v),
            Selector::Ne(path, v) => data.get_path(path).map_or(!v.is_null(), |f| f != v),
            Selector::Gt(path, v) => cmp(path, v) == Some(Ordering::Greater),
            Selector::Gte(path, v) => matches!(cmp(path, v), Some(Ordering::Greater | Ordering::Equal)),
            Selector::Lt(path, v) => cmp(path, v) == Some(Ordering::Less),
            Selector::Lte(path, v) => matches!(cmp(path, v), Some(Ordering::Less | Ordering::Equal)),
            Selector::In(path, values) => data
                .get_path(path)
                .map_or(false, |f| values.iter().any(|v| v == f)),
            Selector::Nin(path, values) => data
                .get_path(path)
                .map_or(true, |f| values.iter().all(|v| v != f)),
            Selector::Exists(path, should) => {
                let present = data.get_path(path).map_or(false, |f| !f.is_null());
                present == *should
            }
            Selector::Prefix(path, prefix) => data
                .get_path(path)
                .and_then(Value::as_str)
                .map_or(false, |s| s.starts_with(prefix.as_str())),
            Selector::And(parts) => parts.iter().all(|s| s.matches_value(data)),
            Selector::Or(parts) => parts.iter().any(|s| s.matches_value(data)),
            Selector::Not(inner) => !inner.matches_value(data),
        }
    }

    /// Parse a Mango-style JSON selector
    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        let obj = json
            .as_object()
            .ok_or_else(|| Error::InvalidSelector("selector must be an object".into()))?;

        let mut parts = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            match key.as_str() {
                "$and" | "$or" => {
                    let arr = value.as_array().ok_or_else(|| {
                        Error::InvalidSelector(format!("{} expects an array", key))
                    })?;
                    let inner = arr.iter().map(Selector::from_json).collect::<Result<Vec<_>>>()?;
                    parts.push(if key == "$and" {
                        Selector::And(inner)
                    } else {
                        Selector::Or(inner)
                    });
                }
                "$not" => parts.push(Selector::Not(Box::new(Selector::from_json(value)?))),
                op if op.starts_with('$') => {
                    return Err(Error::InvalidSelector(format!("unknown operator {}", op)));
                }
                path => parts.push(Self::parse_condition(path, value)?),
            }
        }

        Ok(match parts.len() {
            0 => Selector::All,
            1 => parts.remove(0),
            _ => Selector::And(parts),
        })
    }

    fn parse_condition(path: &str, cond: &serde_json::Value) -> Result<Self> {
        let ops = match cond.as_object() {
            Some(ops) if ops.keys().all(|k| k.starts_with('$')) && !ops.is_empty() => ops,
            _ => return Ok(Selector::Eq(path.to_string(), Value::from(cond.clone()))),
        };

        let mut parts = Vec::with_capacity(ops.len());
        for (op, arg) in ops {
            let p = path.to_string();
            let value = || Value::from(arg.clone());
            let list = || -> Result<Vec<Value>> {
                arg.as_array()
                    .map(|a| a.iter().cloned().map(Value::from).collect())
                    .ok_or_else(|| Error::InvalidSelector(format!("{} expects an array", op)))
            };
            parts.push(match op.as_str() {
                "$eq" => Selector::Eq(p, value()),
                "$ne" => Selector::Ne(p, value()),
                "$gt" => Selector::Gt(p, value()),
                "$gte" => Selector::Gte(p, value()),
                "$lt" => Selector::Lt(p, value()),
                "$lte" => Selector::Lte(p, value()),
                "$in" => Selector::In(p, list()?),
                "$nin" => Selector::Nin(p, list()?),
                "$exists" => Selector::Exists(p, arg.as_bool().unwrap_or(true)),
                "$prefix" => Selector::Prefix(
                    p,
                    arg.as_str()
                        .ok_or_else(|| Error::InvalidSelector("$prefix expects a string".into()))?
                        .to_string(),
                ),
                other => return Err(Error::InvalidSelector(format!("unknown operator {}", other))),
            });
        }

        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Selector::And(parts)
        })
    }
}

impl Default for Selector {
    fn default() -> Self {
        Selector::All
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// A selector with ordering and paging
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub selector: Selector,
    pub sort: Vec<(String, SortOrder)>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(selector: Selector) -> Self {
        Self {
            selector,
            ..Default::default()
        }
    }

    pub fn sort_by(mut self, path: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((path.into(), order));
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// True when the result set is a window over the matching set
    pub fn is_windowed(&self) -> bool {
        self.skip > 0 || self.limit.is_some()
    }

    /// Parse `{"selector": {...}, "sort": [{"name": "asc"}], "skip": 0, "limit": 10}`
    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        let selector = match json.get("selector") {
            Some(sel) => Selector::from_json(sel)?,
            None => Selector::All,
        };

        let mut sort = Vec::new();
        if let Some(entries) = json.get("sort").and_then(|s| s.as_array()) {
            for entry in entries {
                let (path, dir) = entry
                    .as_object()
                    .and_then(|o| o.iter().next())
                    .ok_or_else(|| Error::InvalidSelector("sort entries must be objects".into()))?;
                let order = match dir.as_str() {
                    Some("desc") => SortOrder::Desc,
                    Some("asc") | None => SortOrder::Asc,
                    Some(other) => {
                        return Err(Error::InvalidSelector(format!("bad sort order {}", other)))
                    }
                };
                sort.push((path.clone(), order));
            }
        }

        Ok(Self {
            selector,
            sort,
            skip: json.get("skip").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
            limit: json.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize),
        })
    }

    /// Sort key of a document under this query's ordering
    pub fn sort_key(&self, doc: &Document) -> SortKey {
        SortKey {
            parts: self
                .sort
                .iter()
                .map(|(path, order)| (doc.get(path).cloned().unwrap_or_default(), *order))
                .collect(),
            id: doc.id.as_str().to_string(),
        }
    }
}

/// Total ordering key: the sort fields in order, then the primary key
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    parts: Vec<(Value, SortOrder)>,
    id: String,
}

impl SortKey {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Eq for SortKey {}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for ((a, order), (b, _)) in self.parts.iter().zip(other.parts.iter()) {
            let ord = match order {
                SortOrder::Asc => a.total_cmp(b),
                SortOrder::Desc => b.total_cmp(a),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.id.cmp(&other.id)
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
