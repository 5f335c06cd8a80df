//! Request middleware run in registration order before a tile definition.

use foundation::TileContext;
use http::HeaderMap;
use layers::BoxFuture;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiddlewareError(pub String);

impl MiddlewareError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl std::fmt::Display for MiddlewareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MiddlewareError {}

/// What middleware can see and change about the request in flight.
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    pub request_headers: HeaderMap,
    /// Headers added to the tile response, whatever the outcome.
    pub response_headers: HeaderMap,
    output: Option<Value>,
}

impl Exchange {
    pub fn new(request_headers: HeaderMap) -> Self {
        Self {
            request_headers,
            ..Default::default()
        }
    }

    /// Hands a value downstream; the last middleware to set one wins.
    pub fn set_output(&mut self, value: Value) {
        self.output = Some(value);
    }

    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    pub fn take_output(&mut self) -> Option<Value> {
        self.output.take()
    }
}

/// Returning `Ok` continues the chain; `Err` halts the request and the tile
/// definition never runs.
pub trait Middleware: Send + Sync {
    fn handle<'a>(
        &'a self,
        exchange: &'a mut Exchange,
        tile: &'a TileContext,
    ) -> BoxFuture<'a, Result<(), MiddlewareError>>;
}

/// Adapts a synchronous closure into [`Middleware`].
pub struct FnMiddleware<F>(pub F);

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut Exchange, &TileContext) -> Result<(), MiddlewareError> + Send + Sync,
{
    fn handle<'a>(
        &'a self,
        exchange: &'a mut Exchange,
        tile: &'a TileContext,
    ) -> BoxFuture<'a, Result<(), MiddlewareError>> {
        let result = (self.0)(exchange, tile);
        Box::pin(async move { result })
    }
}

pub fn middleware_fn<F>(f: F) -> FnMiddleware<F>
where
    F: Fn(&mut Exchange, &TileContext) -> Result<(), MiddlewareError> + Send + Sync,
{
    FnMiddleware(f)
}
