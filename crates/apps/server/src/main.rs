use std::process::ExitCode;
use std::sync::Arc;

use axum::http::{header, HeaderName, Method};
use runtime::{Hooks, TracingInstrumentation};
use streaming::{CacheSettings, CacheStore, MemoryStore};
use tile_server::config::{CacheBackend, ServerConfig, DEFAULT_LOG_LEVEL};
use tile_server::demo::addresses_layer;
use tile_server::postgres::PostgresExecutor;
use tile_server::TileServer;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let config = ServerConfig::from_env();
    let log_level = config
        .as_ref()
        .map_or(DEFAULT_LOG_LEVEL, |config| config.log_level.as_str());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    let config = match config {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ServerConfig) -> Result<(), String> {
    let database_url = config
        .database_url
        .clone()
        .ok_or_else(|| "DATABASE_URL is not set".to_string())?;
    let executor = Arc::new(PostgresExecutor::new(database_url, config.pool.clone()));

    let store: Option<Arc<dyn CacheStore>> = match config.cache_backend {
        CacheBackend::Memory => Some(Arc::new(MemoryStore::new())),
        CacheBackend::None => None,
    };

    let mut server = TileServer::new(executor)
        .with_store(store)
        .request_timeout(config.request_timeout)
        .hooks(Hooks::none().with(Arc::new(TracingInstrumentation)))
        .expose_errors(config.expose_errors)
        .layer(addresses_layer());
    if let Some(ttl) = config.cache_ttl {
        server = server.cache(CacheSettings::new().with_ttl(ttl));
    }
    let layers: Vec<String> = server.layer_names().map(str::to_string).collect();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers([
            HeaderName::from_static("x-requested-with"),
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
        ])
        .allow_methods([Method::GET, Method::OPTIONS]);
    let app = server.router().layer(cors);

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .map_err(|e| format!("cannot bind {}: {e}", config.addr))?;
    info!(layers = ?layers, cache = ?config.cache_backend, "tile server listening on http://{}", config.addr);
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("server error: {e}"))
}
