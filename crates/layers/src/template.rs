//! Placeholder substitution over a [`QuerySpec`].
//!
//! `!name!` inside any text is replaced with the tile context's value for
//! `name`. Replacement is a single left-to-right pass; inserted text is never
//! scanned again.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use foundation::TileContext;
use regex::Regex;
use serde_json::Value;

use crate::query::QuerySpec;

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateError {
    /// A placeholder names no tile context field.
    UnknownToken { token: String, fragment: String },
    /// A JSON value with no query meaning (e.g. `true`).
    UnsupportedValue(Value),
    /// Resolved entry that is not a statement (bare number, nested argument list).
    InvalidStatement { layer: String, reason: String },
}

impl std::fmt::Display for TemplateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateError::UnknownToken { token, fragment } => {
                write!(f, "unknown placeholder !{token}! in {fragment:?}")
            }
            TemplateError::UnsupportedValue(v) => {
                write!(f, "value {v} cannot be used in a query")
            }
            TemplateError::InvalidStatement { layer, reason } => {
                write!(f, "layer {layer}: {reason}")
            }
        }
    }
}

impl std::error::Error for TemplateError {}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"!([A-Za-z0-9_-]+)!").expect("valid placeholder regex"))
}

/// Resolves every text fragment in `spec` against `ctx`.
///
/// Shape is preserved: sequences keep length and order, mappings keep their
/// key set, numbers and `Empty` pass through unchanged.
pub fn resolve(spec: &QuerySpec, ctx: &TileContext) -> Result<QuerySpec, TemplateError> {
    match spec {
        QuerySpec::Empty => Ok(QuerySpec::Empty),
        QuerySpec::Number(n) => Ok(QuerySpec::Number(n.clone())),
        QuerySpec::Text(text) => substitute(text, ctx).map(QuerySpec::Text),
        QuerySpec::Sequence(items) => items
            .iter()
            .map(|item| resolve(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(QuerySpec::Sequence),
        QuerySpec::Mapping(entries) => entries
            .iter()
            .map(|(k, v)| resolve(v, ctx).map(|r| (k.clone(), r)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(QuerySpec::Mapping),
    }
}

/// Substitutes placeholders in one fragment.
pub fn substitute(text: &str, ctx: &TileContext) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in placeholder_pattern().captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = ctx
            .token(name.as_str())
            .ok_or_else(|| TemplateError::UnknownToken {
                token: name.as_str().to_string(),
                fragment: text.to_string(),
            })?;
        out.push_str(&text[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}
