//! Optional timing hooks around the named stages of a tile render.
//!
//! Every stage that starts reports exactly once: explicitly through
//! [`StageTimer::finish`], or as a failure when the timer is dropped unfinished
//! (error return or cancelled future).

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    TemplateResolution,
    LayerQuery,
    Orchestration,
    RoundTrip,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::TemplateResolution => "template_resolution",
            Stage::LayerQuery => "layer_query",
            Stage::Orchestration => "orchestration",
            Stage::RoundTrip => "round_trip",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEvent {
    pub stage: Stage,
    /// Layer name for per-layer stages, tile path otherwise.
    pub label: String,
    pub elapsed: Duration,
    pub outcome: Outcome,
}

/// Receiver of stage events. Implementations must be cheap; they run inline
/// on the request task.
pub trait Instrumentation: Send + Sync {
    fn on_stage(&self, event: &StageEvent);
}

/// Logs every stage at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInstrumentation;

impl Instrumentation for TracingInstrumentation {
    fn on_stage(&self, event: &StageEvent) {
        tracing::debug!(
            stage = event.stage.as_str(),
            label = %event.label,
            elapsed_us = event.elapsed.as_micros() as u64,
            ok = event.outcome == Outcome::Success,
            "stage finished"
        );
    }
}

/// The instrumentation set a pipeline instance was configured with.
///
/// Empty by default; cloning shares the sinks.
#[derive(Clone, Default)]
pub struct Hooks {
    sinks: Vec<Arc<dyn Instrumentation>>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl Hooks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Instrumentation>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn emit(&self, event: &StageEvent) {
        for sink in &self.sinks {
            sink.on_stage(event);
        }
    }

    pub fn start(&self, stage: Stage, label: impl Into<String>) -> StageTimer<'_> {
        StageTimer {
            hooks: self,
            stage,
            label: label.into(),
            started: Instant::now(),
            finished: false,
        }
    }

    /// Times `fut`, reporting success for `Ok` and failure for `Err` or cancellation.
    pub async fn timed<F, T, E>(&self, stage: Stage, label: impl Into<String>, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let timer = self.start(stage, label);
        let result = fut.await;
        timer.finish(if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        });
        result
    }
}

pub struct StageTimer<'a> {
    hooks: &'a Hooks,
    stage: Stage,
    label: String,
    started: Instant,
    finished: bool,
}

impl StageTimer<'_> {
    pub fn finish(mut self, outcome: Outcome) -> Duration {
        self.finished = true;
        self.report(outcome)
    }

    fn report(&mut self, outcome: Outcome) -> Duration {
        let elapsed = self.started.elapsed();
        if !self.hooks.is_empty() {
            self.hooks.emit(&StageEvent {
                stage: self.stage,
                label: std::mem::take(&mut self.label),
                elapsed,
                outcome,
            });
        }
        elapsed
    }
}

impl Drop for StageTimer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.report(Outcome::Failure);
        }
    }
}
