use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use formats::EncodeError;
use layers::{ExecutionError, TemplateError};

use crate::middleware::MiddlewareError;
use crate::render::Phase;

/// Everything that can end a tile render without a body.
#[derive(Debug)]
pub enum RenderError {
    /// Malformed request (bad extension, coordinates off the grid).
    InvalidRequest(String),
    Middleware(MiddlewareError),
    Template(TemplateError),
    QueryExecution(ExecutionError),
    PoolTimeout { waited: Duration },
    /// A shared cached computation failed.
    CacheComputation(Arc<dyn std::error::Error + Send + Sync>),
    Encoding(EncodeError),
    File { path: PathBuf, source: std::io::Error },
    /// The tile definition emitted an error.
    Definition(String),
    /// Every render context was dropped without an emission.
    NoEmission,
    Timeout(Duration),
    IllegalTransition { from: Phase, to: Phase },
}

impl RenderError {
    /// Whether the caller, not the server, is at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(self, RenderError::InvalidRequest(_))
    }
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            RenderError::Middleware(e) => write!(f, "middleware error: {e}"),
            RenderError::Template(e) => write!(f, "query template error: {e}"),
            RenderError::QueryExecution(e) => write!(f, "{e}"),
            RenderError::PoolTimeout { waited } => {
                write!(f, "connection pool exhausted after {}ms", waited.as_millis())
            }
            RenderError::CacheComputation(e) => write!(f, "cached render failed: {e}"),
            RenderError::Encoding(e) => write!(f, "{e}"),
            RenderError::File { path, source } => {
                write!(f, "cannot read {}: {source}", path.display())
            }
            RenderError::Definition(cause) => write!(f, "tile render error: {cause}"),
            RenderError::NoEmission => write!(f, "tile definition finished without rendering"),
            RenderError::Timeout(limit) => {
                write!(f, "tile render exceeded {}ms", limit.as_millis())
            }
            RenderError::IllegalTransition { from, to } => {
                write!(f, "illegal render transition {from:?} -> {to:?}")
            }
        }
    }
}

impl std::error::Error for RenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RenderError::Middleware(e) => Some(e),
            RenderError::Template(e) => Some(e),
            RenderError::QueryExecution(e) => Some(e),
            RenderError::CacheComputation(e) => Some(e.as_ref() as _),
            RenderError::Encoding(e) => Some(e),
            RenderError::File { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ExecutionError> for RenderError {
    fn from(value: ExecutionError) -> Self {
        match value {
            ExecutionError::PoolTimeout { waited } => RenderError::PoolTimeout { waited },
            other => RenderError::QueryExecution(other),
        }
    }
}

impl From<TemplateError> for RenderError {
    fn from(value: TemplateError) -> Self {
        RenderError::Template(value)
    }
}

impl From<EncodeError> for RenderError {
    fn from(value: EncodeError) -> Self {
        RenderError::Encoding(value)
    }
}

impl From<MiddlewareError> for RenderError {
    fn from(value: MiddlewareError) -> Self {
        RenderError::Middleware(value)
    }
}
