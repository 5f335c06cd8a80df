//! HTTP front end for the tile render pipeline.
//!
//! `GET /<layer>/<z>/<x>/<y>.<topojson|mvt>` renders one tile of a registered
//! layer. Client mistakes answer 400, unknown layers 404, and everything else
//! 500 with a generic body unless errors are exposed.

pub mod config;
pub mod demo;
pub mod postgres;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use layers::LayerExecutor;
use runtime::Hooks;
use streaming::{
    CacheSettings, CacheStore, LayerDefinition, MemoryStore, PipelineConfig, RenderError,
    RenderPipeline, TileCache, TileRequest, TileResponse,
};
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use uuid::Uuid;

/// Registry of layers plus the settings shared by every render.
pub struct TileServer {
    executor: Arc<dyn LayerExecutor>,
    store: Option<Arc<dyn CacheStore>>,
    config: PipelineConfig,
    layers: BTreeMap<String, Arc<LayerDefinition>>,
    expose_errors: bool,
}

impl TileServer {
    /// Server backed by `executor` with an in-memory tile cache. Nothing is
    /// cached until a request, a layer or [`TileServer::cache`] asks for it.
    pub fn new(executor: Arc<dyn LayerExecutor>) -> Self {
        Self {
            executor,
            store: Some(Arc::new(MemoryStore::new())),
            config: PipelineConfig::default(),
            layers: BTreeMap::new(),
            expose_errors: false,
        }
    }

    /// Replaces the cache store; `None` disables caching entirely.
    pub fn with_store(mut self, store: Option<Arc<dyn CacheStore>>) -> Self {
        self.store = store;
        self
    }

    /// Caches every layer with these settings unless overridden.
    pub fn cache(mut self, settings: CacheSettings) -> Self {
        self.config.cache = Some(settings);
        self
    }

    pub fn request_timeout(mut self, limit: Duration) -> Self {
        self.config.request_timeout = limit;
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.config.hooks = hooks;
        self
    }

    /// Sends render error details to clients instead of a generic message.
    pub fn expose_errors(mut self, expose: bool) -> Self {
        self.expose_errors = expose;
        self
    }

    /// Registers a layer, replacing any earlier one with the same name.
    pub fn layer(mut self, definition: LayerDefinition) -> Self {
        if self.layers.contains_key(&definition.name) {
            tracing::warn!(layer = %definition.name, "replacing layer definition");
        }
        self.layers
            .insert(definition.name.clone(), Arc::new(definition));
        self
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    pub fn router(self) -> Router {
        let cache = self.store.map(|store| Arc::new(TileCache::new(store)));
        let state = AppState {
            pipeline: Arc::new(RenderPipeline::new(self.executor, cache, self.config)),
            layers: Arc::new(self.layers),
            expose_errors: self.expose_errors,
        };

        Router::new()
            .route("/healthz", get(healthz))
            .route("/:layer/:z/:x/:file", get(get_tile))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<RenderPipeline>,
    layers: Arc<BTreeMap<String, Arc<LayerDefinition>>>,
    expose_errors: bool,
}

async fn healthz() -> Response {
    (StatusCode::OK, "ok").into_response()
}

async fn get_tile(
    State(state): State<AppState>,
    AxumPath((layer, z, x, file)): AxumPath<(String, String, String, String)>,
    headers: HeaderMap,
) -> Response {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("tile", %request_id, %layer, %z, %x, %file);

    async move {
        let Some(definition) = state.layers.get(&layer) else {
            tracing::debug!("unknown layer");
            return (StatusCode::NOT_FOUND, format!("unknown layer {layer}")).into_response();
        };
        let request = match TileRequest::parse(&layer, &z, &x, &file, headers) {
            Ok(request) => request,
            Err(err) => return error_response(&err, HeaderMap::new(), state.expose_errors),
        };

        match state.pipeline.render(definition, request).await {
            Ok(response) => tile_response(response),
            Err(failure) => error_response(&failure.error, failure.headers, state.expose_errors),
        }
    }
    .instrument(span)
    .await
}

fn tile_response(response: TileResponse) -> Response {
    let TileResponse { body, headers } = response;
    let mut out = (StatusCode::OK, Body::from(Bytes::from(body.bytes))).into_response();
    out.headers_mut().extend(headers);
    out.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static(body.content_type),
    );
    out
}

fn error_response(error: &RenderError, headers: HeaderMap, expose: bool) -> Response {
    let (status, message) = if error.is_client_error() {
        (StatusCode::BAD_REQUEST, error.to_string())
    } else {
        tracing::error!(error = %error, "tile request failed");
        let message = if expose {
            error.to_string()
        } else {
            "tile render failed".to_string()
        };
        (StatusCode::INTERNAL_SERVER_ERROR, message)
    };
    let mut out = (status, message).into_response();
    out.headers_mut().extend(headers);
    out
}
