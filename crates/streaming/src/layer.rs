//! Layer definitions: the code that decides what a tile contains.

use std::sync::Arc;

use formats::VectorTileOptions;
use foundation::TileContext;
use layers::BoxFuture;

use crate::cache::CacheSettings;
use crate::middleware::Middleware;
use crate::render::RenderContext;

/// Produces a tile by driving its [`RenderContext`] to exactly one emission.
///
/// Implemented for every `Fn(TileContext, RenderContext) -> impl Future<Output = ()>`,
/// so an async closure is a definition.
pub trait TileDefinition: Send + Sync {
    fn render(&self, tile: TileContext, render: RenderContext) -> BoxFuture<'static, ()>;
}

impl<F, Fut> TileDefinition for F
where
    F: Fn(TileContext, RenderContext) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn render(&self, tile: TileContext, render: RenderContext) -> BoxFuture<'static, ()> {
        Box::pin(self(tile, render))
    }
}

/// A named layer: middleware chain, definition and per-layer settings.
#[derive(Clone)]
pub struct LayerDefinition {
    pub name: String,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub definition: Arc<dyn TileDefinition>,
    pub cache: Option<CacheSettings>,
    pub vector_tile: VectorTileOptions,
}

impl std::fmt::Debug for LayerDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerDefinition")
            .field("name", &self.name)
            .field("middleware", &self.middleware.len())
            .field("cache", &self.cache)
            .finish()
    }
}

impl LayerDefinition {
    /// Layer rendered by an async closure.
    pub fn new<F, Fut>(name: impl Into<String>, render: F) -> Self
    where
        F: Fn(TileContext, RenderContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::from_definition(name, Arc::new(render))
    }

    pub fn from_definition(name: impl Into<String>, definition: Arc<dyn TileDefinition>) -> Self {
        Self {
            name: name.into(),
            middleware: Vec::new(),
            definition,
            cache: None,
            vector_tile: VectorTileOptions::default(),
        }
    }

    pub fn with_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn with_cache(mut self, settings: CacheSettings) -> Self {
        self.cache = Some(settings);
        self
    }

    pub fn with_vector_tile(mut self, options: VectorTileOptions) -> Self {
        self.vector_tile = options;
        self
    }
}
