//! Layer Query Executor: the seam between the orchestrator and a data source.
//!
//! Implementations run one statement and hand back rows as JSON objects;
//! [`features_from_rows`] turns those into a layer. A layer is all or nothing:
//! the first bad row fails it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use formats::{Feature, Geometry, GeometryError, LayerResult};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::query::QuerySpec;
use crate::template::TemplateError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Column carrying each row's geometry as GeoJSON (text or JSON).
pub const GEOMETRY_COLUMN: &str = "the_geom_geojson";

/// One result row, column name to value.
pub type Row = Map<String, Value>;

/// Typed positional bind argument.
#[derive(Debug, Clone, PartialEq)]
pub enum BindArg {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl std::fmt::Display for BindArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindArg::Null => write!(f, "NULL"),
            BindArg::Int(v) => write!(f, "{v}"),
            BindArg::Float(v) => write!(f, "{v}"),
            BindArg::Text(v) => write!(f, "{v:?}"),
        }
    }
}

/// A fully resolved statement ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<BindArg>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, args: Vec<BindArg>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }

    /// Builds the statement for `layer` from a resolved entry: bare text, or a
    /// sequence of text followed by its arguments.
    pub fn from_resolved(layer: &str, spec: &QuerySpec) -> Result<Self, TemplateError> {
        let invalid = |reason: &str| TemplateError::InvalidStatement {
            layer: layer.to_string(),
            reason: reason.to_string(),
        };
        match spec {
            QuerySpec::Text(sql) => Ok(Self::new(sql.clone(), Vec::new())),
            QuerySpec::Sequence(items) => {
                let Some((QuerySpec::Text(sql), rest)) = items.split_first() else {
                    return Err(invalid("statement list must start with text"));
                };
                let args = rest
                    .iter()
                    .map(|arg| match arg {
                        QuerySpec::Empty => Ok(BindArg::Null),
                        QuerySpec::Text(s) => Ok(BindArg::Text(s.clone())),
                        QuerySpec::Number(n) => Ok(match n.as_i64() {
                            Some(i) => BindArg::Int(i),
                            None => BindArg::Float(n.as_f64().unwrap_or(f64::NAN)),
                        }),
                        QuerySpec::Sequence(_) | QuerySpec::Mapping(_) => {
                            Err(invalid("bind arguments must be numbers, text or empty"))
                        }
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::new(sql.clone(), args))
            }
            QuerySpec::Number(_) => Err(invalid("a number is not a statement")),
            QuerySpec::Empty | QuerySpec::Mapping(_) => Err(invalid("not a statement")),
        }
    }
}

impl std::fmt::Display for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sql)?;
        if !self.args.is_empty() {
            let args: Vec<String> = self.args.iter().map(ToString::to_string).collect();
            write!(f, " [{}]", args.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ExecutionError {
    /// No connection became available within the bounded wait.
    PoolTimeout { waited: Duration },
    /// The statement failed, or a returned row could not become a feature.
    Query {
        statement: String,
        args: Vec<BindArg>,
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ExecutionError {
    pub fn query(
        statement: &Statement,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        ExecutionError::Query {
            statement: statement.sql.clone(),
            args: statement.args.clone(),
            cause: cause.into(),
        }
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionError::PoolTimeout { waited } => {
                write!(f, "no connection available after {}ms", waited.as_millis())
            }
            ExecutionError::Query { statement, cause, .. } => {
                write!(f, "query failed: {cause} (statement: {statement})")
            }
        }
    }
}

impl std::error::Error for ExecutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecutionError::PoolTimeout { .. } => None,
            ExecutionError::Query { cause, .. } => Some(cause.as_ref() as _),
        }
    }
}

/// Runs statements against a spatial data source.
///
/// Implementations must be `Send + Sync`; the orchestrator runs the layers of
/// one tile concurrently against the same executor.
pub trait LayerExecutor: Send + Sync {
    /// Stable description of the backing data source. Distinct sources must
    /// return distinct identities; default cache keys are derived from it.
    fn identity(&self) -> &str;

    fn execute<'a>(
        &'a self,
        statement: &'a Statement,
    ) -> BoxFuture<'a, Result<LayerResult, ExecutionError>>;
}

/// Converts result rows into features.
///
/// The geometry column is parsed (JSON text or a JSON object) and removed from
/// the properties; every other column is copied as is.
pub fn features_from_rows(rows: Vec<Row>) -> Result<LayerResult, GeometryError> {
    rows.into_iter()
        .enumerate()
        .map(|(i, mut row)| {
            let geometry = match row.remove(GEOMETRY_COLUMN) {
                Some(Value::String(text)) => Geometry::from_geojson_str(&text),
                Some(value @ Value::Object(_)) => Geometry::from_geojson_value(&value),
                Some(Value::Null) | None => Err(GeometryError(format!(
                    "row {i} has no {GEOMETRY_COLUMN} value"
                ))),
                Some(other) => Err(GeometryError(format!(
                    "row {i}: {GEOMETRY_COLUMN} must be GeoJSON, got {other}"
                ))),
            }?;
            Ok(Feature::new(geometry, row))
        })
        .collect()
}

#[derive(Debug, Clone)]
enum Scripted {
    Rows(Vec<Row>),
    Failure(String),
}

#[derive(Debug)]
struct ScriptError(String);

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ScriptError {}

/// In-memory executor with scripted responses.
///
/// A statement is answered by the first script whose pattern occurs in its
/// SQL; unmatched statements fail. Every call is recorded.
#[derive(Debug)]
pub struct MemoryExecutor {
    identity: String,
    scripts: Vec<(String, Scripted)>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    executed: Mutex<Vec<Statement>>,
}

impl MemoryExecutor {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            scripts: Vec::new(),
            delay: None,
            calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_rows(mut self, pattern: impl Into<String>, rows: Vec<Row>) -> Self {
        self.scripts.push((pattern.into(), Scripted::Rows(rows)));
        self
    }

    pub fn with_failure(mut self, pattern: impl Into<String>, message: impl Into<String>) -> Self {
        self.scripts
            .push((pattern.into(), Scripted::Failure(message.into())));
        self
    }

    /// Sleeps this long (tokio clock) before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<Statement> {
        self.executed.lock().clone()
    }
}

impl LayerExecutor for MemoryExecutor {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn execute<'a>(
        &'a self,
        statement: &'a Statement,
    ) -> BoxFuture<'a, Result<LayerResult, ExecutionError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.executed.lock().push(statement.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let scripted = self
                .scripts
                .iter()
                .find(|(pattern, _)| statement.sql.contains(pattern.as_str()))
                .map(|(_, s)| s.clone());
            match scripted {
                Some(Scripted::Rows(rows)) => {
                    features_from_rows(rows).map_err(|e| ExecutionError::query(statement, e))
                }
                Some(Scripted::Failure(message)) => {
                    Err(ExecutionError::query(statement, ScriptError(message)))
                }
                None => Err(ExecutionError::query(
                    statement,
                    ScriptError("no scripted response".to_string()),
                )),
            }
        })
    }
}

/// Builds a [`Row`] from literal pairs.
pub fn row<I, K>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
