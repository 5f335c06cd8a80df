//! Per-request render context and its phase machine.
//!
//! ```text
//! Idle ─► AwaitingEmission ─► Resolving ─► Encoding ─► Done
//!   │            │  │  └──────────────────────▲  ▲
//!   │            │  └─────────────────────────┘  │
//!   └────────────┴──────────────► Failed ◄───────┘ (from any non-terminal)
//! ```
//!
//! A definition drives the context with exactly one emission. The first one
//! moves the phase out of `AwaitingEmission`; any later one is rejected.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use layers::QuerySpec;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::cache::{CacheKeyFn, CacheSettings};
use crate::error::RenderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    AwaitingEmission,
    Resolving,
    Encoding,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Idle, AwaitingEmission)
                | (Idle, Failed)
                | (AwaitingEmission, Resolving | Encoding | Done | Failed)
                | (Resolving, Encoding | Failed)
                | (Encoding, Done | Failed)
        )
    }
}

/// The single effective output of a tile definition.
#[derive(Debug)]
pub enum Emission {
    Query(QuerySpec),
    Raw(Vec<u8>),
    Empty,
    Fail(RenderError),
}

impl Emission {
    fn target_phase(&self) -> Phase {
        match self {
            Emission::Query(_) => Phase::Resolving,
            Emission::Raw(_) => Phase::Done,
            Emission::Empty => Phase::Encoding,
            Emission::Fail(_) => Phase::Failed,
        }
    }
}

#[derive(Debug)]
pub struct RenderState {
    phase: Phase,
    cache: Option<CacheSettings>,
}

impl RenderState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            cache: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cache_override(&self) -> Option<&CacheSettings> {
        self.cache.as_ref()
    }

    pub fn advance(&mut self, next: Phase) -> Result<(), RenderError> {
        if !self.phase.can_transition_to(next) {
            return Err(RenderError::IllegalTransition {
                from: self.phase,
                to: next,
            });
        }
        tracing::trace!(from = ?self.phase, to = ?next, "render phase");
        self.phase = next;
        Ok(())
    }

    /// Moves to `Failed` unless already terminal.
    pub fn fail(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = Phase::Failed;
        }
    }
}

impl Default for RenderState {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedState = Arc<Mutex<RenderState>>;

/// Handle a tile definition uses to produce its output.
///
/// Cheap to clone; clones share one emission slot. If every clone is dropped
/// without emitting, the render fails with [`RenderError::NoEmission`].
#[derive(Debug, Clone)]
pub struct RenderContext {
    state: SharedState,
    slot: Arc<Mutex<Option<oneshot::Sender<Emission>>>>,
    middleware_output: Arc<Option<Value>>,
}

impl RenderContext {
    pub fn new(
        state: SharedState,
        middleware_output: Option<Value>,
    ) -> (Self, oneshot::Receiver<Emission>) {
        let (tx, rx) = oneshot::channel();
        let ctx = Self {
            state,
            slot: Arc::new(Mutex::new(Some(tx))),
            middleware_output: Arc::new(middleware_output),
        };
        (ctx, rx)
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase()
    }

    /// Value the middleware chain handed downstream, if any.
    pub fn middleware_output(&self) -> Option<&Value> {
        self.middleware_output.as_ref().as_ref()
    }

    /// Turns caching on for this request with the given overrides. Unset
    /// fields fall back to the layer, then the server settings.
    pub fn cache(&self, key: Option<CacheKeyFn>, ttl: Option<Duration>) {
        self.state.lock().cache = Some(CacheSettings { key, ttl });
    }

    pub fn query(&self, spec: impl Into<QuerySpec>) -> Result<(), RenderError> {
        self.emit(Emission::Query(spec.into()))
    }

    /// Query given as JSON: `null`/`false` mean empty, `true` is rejected.
    pub fn query_json(&self, value: Value) -> Result<(), RenderError> {
        match QuerySpec::try_from(value) {
            Ok(spec) => self.emit(Emission::Query(spec)),
            Err(e) => self.emit(Emission::Fail(e.into())),
        }
    }

    /// Reads a statement template from disk, then queries with it.
    pub async fn query_file(&self, path: impl AsRef<Path>) -> Result<(), RenderError> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(text) => self.emit(Emission::Query(QuerySpec::Text(text))),
            Err(source) => self.emit(Emission::Fail(RenderError::File {
                path: path.to_path_buf(),
                source,
            })),
        }
    }

    /// Sends `bytes` as the response body untouched.
    pub fn raw(&self, bytes: impl Into<Vec<u8>>) -> Result<(), RenderError> {
        self.emit(Emission::Raw(bytes.into()))
    }

    pub async fn raw_file(&self, path: impl AsRef<Path>) -> Result<(), RenderError> {
        let path = path.as_ref();
        match tokio::fs::read(path).await {
            Ok(bytes) => self.emit(Emission::Raw(bytes)),
            Err(source) => self.emit(Emission::Fail(RenderError::File {
                path: path.to_path_buf(),
                source,
            })),
        }
    }

    /// Renders a tile with no layers.
    pub fn empty(&self) -> Result<(), RenderError> {
        self.emit(Emission::Empty)
    }

    pub fn error(&self, cause: impl std::fmt::Display) -> Result<(), RenderError> {
        self.emit(Emission::Fail(RenderError::Definition(cause.to_string())))
    }

    fn emit(&self, emission: Emission) -> Result<(), RenderError> {
        let target = emission.target_phase();
        let mut state = self.state.lock();
        let sender = match state.advance(target) {
            Ok(()) => self.slot.lock().take(),
            Err(e) => {
                tracing::warn!(error = %e, "emission rejected");
                return Err(e);
            }
        };
        drop(state);
        match sender {
            // A dropped receiver means the request is already gone.
            Some(tx) => {
                let _ = tx.send(emission);
                Ok(())
            }
            None => Err(RenderError::IllegalTransition {
                from: Phase::AwaitingEmission,
                to: target,
            }),
        }
    }
}
