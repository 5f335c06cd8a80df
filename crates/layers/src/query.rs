//! Query Specification: what a tile definition asks the data source for.

use std::collections::BTreeMap;

use serde_json::{Number, Value};

use crate::template::TemplateError;

/// Recursive query description.
///
/// * `Text` is a statement template.
/// * `Sequence` whose head is `Text` is a statement plus bind arguments.
/// * `Mapping` names one entry per output layer.
/// * `Empty` means "nothing to query"; inside a mapping it yields an empty
///   layer, as a bind argument it binds `NULL`.
#[derive(Debug, Clone, PartialEq)]
pub enum QuerySpec {
    Empty,
    Number(Number),
    Text(String),
    Sequence(Vec<QuerySpec>),
    Mapping(BTreeMap<String, QuerySpec>),
}

impl QuerySpec {
    /// Statement with positional bind arguments (`$1`, `$2`, ...).
    pub fn statement(sql: impl Into<String>, args: impl IntoIterator<Item = QuerySpec>) -> Self {
        let mut items = vec![QuerySpec::Text(sql.into())];
        items.extend(args);
        QuerySpec::Sequence(items)
    }

    /// One entry per output layer.
    pub fn layers<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, QuerySpec)>,
    {
        QuerySpec::Mapping(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// `None` for NaN and infinities, which have no JSON or SQL literal.
    pub fn float(value: f64) -> Option<Self> {
        Number::from_f64(value).map(QuerySpec::Number)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, QuerySpec::Empty)
    }
}

impl From<&str> for QuerySpec {
    fn from(value: &str) -> Self {
        QuerySpec::Text(value.to_string())
    }
}

impl From<String> for QuerySpec {
    fn from(value: String) -> Self {
        QuerySpec::Text(value)
    }
}

impl From<i64> for QuerySpec {
    fn from(value: i64) -> Self {
        QuerySpec::Number(value.into())
    }
}

impl From<Vec<QuerySpec>> for QuerySpec {
    fn from(value: Vec<QuerySpec>) -> Self {
        QuerySpec::Sequence(value)
    }
}

impl From<BTreeMap<String, QuerySpec>> for QuerySpec {
    fn from(value: BTreeMap<String, QuerySpec>) -> Self {
        QuerySpec::Mapping(value)
    }
}

impl TryFrom<Value> for QuerySpec {
    type Error = TemplateError;

    /// `null` and `false` mean "no query"; `true` has no meaning and is rejected.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null | Value::Bool(false) => Ok(QuerySpec::Empty),
            Value::Bool(true) => Err(TemplateError::UnsupportedValue(value)),
            Value::Number(n) => Ok(QuerySpec::Number(n)),
            Value::String(s) => Ok(QuerySpec::Text(s)),
            Value::Array(items) => items
                .into_iter()
                .map(QuerySpec::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(QuerySpec::Sequence),
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| QuerySpec::try_from(v).map(|spec| (k, spec)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(QuerySpec::Mapping),
        }
    }
}
