use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use streaming::DEFAULT_REQUEST_TIMEOUT;

use crate::postgres::{PoolConfig, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_POOL_SIZE};

pub const DEFAULT_ADDR: &str = "127.0.0.1:3000";
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    None,
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid { key: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { key, value } => write!(f, "invalid {key}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Server settings read from `TILE_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub database_url: Option<String>,
    pub pool: PoolConfig,
    pub request_timeout: Duration,
    /// Global cache TTL; when set every layer is cached by default.
    pub cache_ttl: Option<Duration>,
    pub cache_backend: CacheBackend,
    pub log_level: String,
    pub expose_errors: bool,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw_addr = lookup("TILE_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let addr = raw_addr.parse().map_err(|_| ConfigError::Invalid {
            key: "TILE_ADDR",
            value: raw_addr.clone(),
        })?;

        let cache_backend = match lookup("TILE_CACHE").as_deref() {
            None | Some("memory") => CacheBackend::Memory,
            Some("none") => CacheBackend::None,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "TILE_CACHE",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            addr,
            database_url: lookup("DATABASE_URL").filter(|v| !v.is_empty()),
            pool: PoolConfig {
                max_size: env_var_usize(&lookup, "TILE_POOL_SIZE", DEFAULT_POOL_SIZE).max(1),
                acquire_timeout: env_var_millis(&lookup, "TILE_POOL_TIMEOUT_MS")
                    .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT),
                statement_timeout: env_var_millis(&lookup, "TILE_STATEMENT_TIMEOUT_MS"),
            },
            request_timeout: env_var_millis(&lookup, "TILE_REQUEST_TIMEOUT_MS")
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            cache_ttl: env_var_u64(&lookup, "TILE_CACHE_TTL_SECS").map(Duration::from_secs),
            cache_backend,
            log_level: lookup("TILE_LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            expose_errors: env_var_bool(&lookup, "TILE_EXPOSE_ERRORS"),
        })
    }
}

fn env_var_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_var_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    lookup(key).and_then(|v| v.parse().ok())
}

fn env_var_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    env_var_u64(lookup, key).map(Duration::from_millis)
}

fn env_var_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    matches!(
        lookup(key).as_deref(),
        Some("1" | "true" | "TRUE" | "yes")
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::{CacheBackend, ServerConfig};

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig, super::ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.addr.to_string(), "127.0.0.1:3000");
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.pool.max_size, 10);
        assert_eq!(cfg.pool.acquire_timeout, Duration::from_secs(5));
        assert_eq!(cfg.pool.statement_timeout, None);
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.cache_ttl, None);
        assert_eq!(cfg.cache_backend, CacheBackend::Memory);
        assert_eq!(cfg.log_level, "info");
        assert!(!cfg.expose_errors);
    }

    #[test]
    fn overrides() {
        let cfg = config(&[
            ("TILE_ADDR", "0.0.0.0:8080"),
            ("DATABASE_URL", "postgres://localhost/gis"),
            ("TILE_POOL_SIZE", "4"),
            ("TILE_STATEMENT_TIMEOUT_MS", "2500"),
            ("TILE_CACHE_TTL_SECS", "600"),
            ("TILE_CACHE", "none"),
            ("TILE_EXPOSE_ERRORS", "1"),
        ])
        .unwrap();
        assert_eq!(cfg.addr.port(), 8080);
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/gis"));
        assert_eq!(cfg.pool.max_size, 4);
        assert_eq!(cfg.pool.statement_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(cfg.cache_ttl, Some(Duration::from_secs(600)));
        assert_eq!(cfg.cache_backend, CacheBackend::None);
        assert!(cfg.expose_errors);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(config(&[("TILE_ADDR", "nowhere")]).is_err());
        assert!(config(&[("TILE_CACHE", "redis")]).is_err());
    }
}
