//! The tile render pipeline.
//!
//! middleware → definition → emission → template resolution → orchestration
//! (through the cache when enabled) → encoding. The whole run is bounded by
//! the request timeout; dropping the returned future cancels outstanding
//! queries.

use std::sync::Arc;
use std::time::Duration;

use formats::{AssembledLayers, TileBody, encode};
use foundation::TileContext;
use http::HeaderMap;
use layers::{LayerExecutor, RenderPlan, render_layers, resolve};
use parking_lot::Mutex;
use runtime::{Hooks, Outcome, Stage};
use tokio::sync::oneshot;

use crate::cache::{CacheError, CacheSettings, TileCache, resolve_cache_policy, source_digest};
use crate::error::RenderError;
use crate::layer::LayerDefinition;
use crate::middleware::Exchange;
use crate::render::{Emission, Phase, RenderContext, RenderState, SharedState};
use crate::request::TileRequest;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub request_timeout: Duration,
    /// Server-wide caching; `None` leaves caching to layers and requests.
    pub cache: Option<CacheSettings>,
    pub hooks: Hooks,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            cache: None,
            hooks: Hooks::none(),
        }
    }
}

/// A rendered tile plus headers middleware asked to add.
#[derive(Debug, Clone)]
pub struct TileResponse {
    pub body: TileBody,
    pub headers: HeaderMap,
}

/// A failed render plus headers middleware asked to add.
#[derive(Debug)]
pub struct RenderFailure {
    pub error: RenderError,
    pub headers: HeaderMap,
}

pub struct RenderPipeline {
    executor: Arc<dyn LayerExecutor>,
    cache: Option<Arc<TileCache>>,
    config: PipelineConfig,
}

impl std::fmt::Debug for RenderPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPipeline")
            .field("source", &source_digest(self.executor.identity()))
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}

impl RenderPipeline {
    /// `cache` is the shared tile cache; `None` disables caching at every level.
    pub fn new(
        executor: Arc<dyn LayerExecutor>,
        cache: Option<Arc<TileCache>>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            executor,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&Arc<TileCache>> {
        self.cache.as_ref()
    }

    /// Renders one tile of `layer`.
    pub async fn render(
        &self,
        layer: &LayerDefinition,
        request: TileRequest,
    ) -> Result<TileResponse, RenderFailure> {
        let label = request.path();
        let timer = self.config.hooks.start(Stage::RoundTrip, label.clone());
        let state: SharedState = Arc::new(Mutex::new(RenderState::new()));
        let mut exchange = Exchange::new(request.headers);

        let limit = self.config.request_timeout;
        let run = self.run(layer, &request.tile, request.encoding, &state, &mut exchange, &label);
        let result = match tokio::time::timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => Err(RenderError::Timeout(limit)),
        };

        let headers = std::mem::take(&mut exchange.response_headers);
        match result {
            Ok(body) => {
                timer.finish(Outcome::Success);
                Ok(TileResponse { body, headers })
            }
            Err(error) => {
                state.lock().fail();
                timer.finish(Outcome::Failure);
                tracing::warn!(tile = %label, error = %error, "tile render failed");
                Err(RenderFailure { error, headers })
            }
        }
    }

    async fn run(
        &self,
        layer: &LayerDefinition,
        tile: &TileContext,
        encoding: formats::TileEncoding,
        state: &SharedState,
        exchange: &mut Exchange,
        label: &str,
    ) -> Result<TileBody, RenderError> {
        tracing::debug!(tile = %label, "rendering tile");

        for middleware in &layer.middleware {
            middleware.handle(exchange, tile).await?;
        }
        state.lock().advance(Phase::AwaitingEmission)?;

        let (render_ctx, rx) = RenderContext::new(state.clone(), exchange.take_output());
        let emission = await_emission(layer.definition.render(tile.clone(), render_ctx), rx).await?;

        let layers = match emission {
            Emission::Raw(bytes) => return Ok(TileBody::raw(bytes)),
            Emission::Fail(e) => return Err(e),
            Emission::Empty => AssembledLayers::new(),
            Emission::Query(spec) => {
                let timer = self.config.hooks.start(Stage::TemplateResolution, label);
                let resolved = resolve(&spec, tile).and_then(|r| RenderPlan::from_resolved(&r));
                timer.finish(if resolved.is_ok() {
                    Outcome::Success
                } else {
                    Outcome::Failure
                });
                let plan = resolved?;
                let layers = self.layers_for(layer, tile, plan, state, label).await?;
                state.lock().advance(Phase::Encoding)?;
                layers
            }
        };

        let body = encode(&layers, tile.coord, encoding, &layer.vector_tile)?;
        state.lock().advance(Phase::Done)?;
        tracing::debug!(
            tile = %label,
            layers = layers.len(),
            features = layers.feature_count(),
            bytes = body.bytes.len(),
            "tile rendered"
        );
        Ok(body)
    }

    async fn layers_for(
        &self,
        layer: &LayerDefinition,
        tile: &TileContext,
        plan: RenderPlan,
        state: &SharedState,
        label: &str,
    ) -> Result<AssembledLayers, RenderError> {
        let executor = self.executor.clone();
        let hooks = self.config.hooks.clone();
        let orchestration_label = label.to_string();
        let compute = async move {
            hooks
                .timed(
                    Stage::Orchestration,
                    orchestration_label,
                    render_layers(executor.as_ref(), &plan, &hooks),
                )
                .await
        };

        let policy = {
            let state = state.lock();
            resolve_cache_policy(
                [
                    state.cache_override(),
                    layer.cache.as_ref(),
                    self.config.cache.as_ref(),
                ],
                self.executor.identity(),
                tile,
            )
        };

        match (policy, &self.cache) {
            (Some((key, ttl)), Some(cache)) => cache
                .get_or_compute(&key, ttl, compute)
                .await
                .map_err(cache_failure),
            _ => Ok(compute.await?),
        }
    }
}

/// Drives the definition until it emits, finishes without emitting, or drops
/// its last context.
async fn await_emission(
    mut definition: layers::BoxFuture<'static, ()>,
    mut rx: oneshot::Receiver<Emission>,
) -> Result<Emission, RenderError> {
    tokio::select! {
        emitted = &mut rx => return emitted.map_err(|_| RenderError::NoEmission),
        () = &mut definition => {}
    }
    // The definition returned; a context clone it handed off may still emit.
    rx.await.map_err(|_| RenderError::NoEmission)
}

fn cache_failure(error: CacheError) -> RenderError {
    match error {
        CacheError::Computation(cause) => {
            if let layers::ExecutionError::PoolTimeout { waited } = cause.as_ref() {
                return RenderError::PoolTimeout { waited: *waited };
            }
            RenderError::CacheComputation(cause)
        }
        CacheError::Abandoned => RenderError::CacheComputation(Arc::new(CacheError::Abandoned)),
    }
}
