//! PostgreSQL layer executor with a bounded connection pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use formats::LayerResult;
use layers::{BindArg, BoxFuture, ExecutionError, LayerExecutor, Row, Statement, features_from_rows};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Client, NoTls};

pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_size: usize,
    /// Longest a query waits for a free connection.
    pub acquire_timeout: Duration,
    /// Applied to every new connection as `statement_timeout`.
    pub statement_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_SIZE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            statement_timeout: None,
        }
    }
}

#[derive(Debug)]
pub enum PoolError {
    Timeout { waited: Duration },
    Connect(tokio_postgres::Error),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Timeout { waited } => {
                write!(f, "pool exhausted after {}ms", waited.as_millis())
            }
            PoolError::Connect(e) => write!(f, "postgres connect failed: {e}"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Timeout { .. } => None,
            PoolError::Connect(e) => Some(e),
        }
    }
}

/// Connections are opened lazily, at most `max_size` at a time. Idle ones are
/// kept for reuse; closed ones are discarded.
pub struct PgPool {
    url: String,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Client>>,
}

impl std::fmt::Debug for PgPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPool")
            .field("config", &self.config)
            .field("available", &self.available())
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl PgPool {
    pub fn new(url: impl Into<String>, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_size));
        Self {
            url: url.into(),
            config,
            permits,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Connections that could be checked out right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub async fn acquire(&self) -> Result<PooledClient<'_>, PoolError> {
        let permit = self.permit().await?;
        let reused = {
            let mut idle = self.idle.lock();
            std::iter::from_fn(|| idle.pop()).find(|client| !client.is_closed())
        };
        let client = match reused {
            Some(client) => client,
            None => self.connect().await?,
        };
        Ok(PooledClient {
            pool: self,
            client: Some(client),
            _permit: permit,
        })
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>, PoolError> {
        let waited = self.config.acquire_timeout;
        match tokio::time::timeout(waited, self.permits.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            // The semaphore is never closed.
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(waited_ms = waited.as_millis() as u64, "postgres pool exhausted");
                Err(PoolError::Timeout { waited })
            }
        }
    }

    async fn connect(&self) -> Result<Client, PoolError> {
        let (client, connection) = tokio_postgres::connect(&self.url, NoTls)
            .await
            .map_err(PoolError::Connect)?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::warn!(error = %err, "postgres connection closed");
            }
        });
        if let Some(limit) = self.config.statement_timeout {
            client
                .batch_execute(&format!("SET statement_timeout = {}", limit.as_millis()))
                .await
                .map_err(PoolError::Connect)?;
        }
        tracing::debug!("opened postgres connection");
        Ok(client)
    }
}

/// A checked-out connection. Dropping it, on any path, returns the connection
/// to the idle list and frees its slot.
pub struct PooledClient<'a> {
    pool: &'a PgPool,
    client: Option<Client>,
    _permit: SemaphorePermit<'a>,
}

impl PooledClient<'_> {
    pub fn client(&self) -> &Client {
        self.client
            .as_ref()
            .expect("pooled client is present until drop")
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if !client.is_closed() {
                self.pool.idle.lock().push(client);
            }
        }
    }
}

/// Runs layer statements against PostgreSQL/PostGIS.
#[derive(Debug)]
pub struct PostgresExecutor {
    identity: String,
    pool: PgPool,
}

impl PostgresExecutor {
    /// The connection string doubles as the data-source identity.
    pub fn new(url: impl Into<String>, config: PoolConfig) -> Self {
        let url = url.into();
        Self {
            pool: PgPool::new(url.clone(), config),
            identity: url,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl LayerExecutor for PostgresExecutor {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn execute<'a>(
        &'a self,
        statement: &'a Statement,
    ) -> BoxFuture<'a, Result<LayerResult, ExecutionError>> {
        Box::pin(async move {
            let conn = self.pool.acquire().await.map_err(|e| match e {
                PoolError::Timeout { waited } => ExecutionError::PoolTimeout { waited },
                other => ExecutionError::query(statement, other),
            })?;

            let params: Vec<(&(dyn ToSql + Sync), Type)> =
                statement.args.iter().map(bind_param).collect();
            let rows = conn
                .client()
                .query_typed(&statement.sql, &params)
                .await
                .map_err(|e| ExecutionError::query(statement, e))?;
            drop(conn);

            tracing::debug!(rows = rows.len(), "statement returned");
            let rows = rows
                .iter()
                .map(row_to_json)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ExecutionError::query(statement, e))?;
            features_from_rows(rows).map_err(|e| ExecutionError::query(statement, e))
        })
    }
}

static NULL_TEXT: Option<&str> = None;

fn bind_param(arg: &BindArg) -> (&(dyn ToSql + Sync), Type) {
    match arg {
        BindArg::Null => (&NULL_TEXT as &(dyn ToSql + Sync), Type::TEXT),
        BindArg::Int(v) => (v as &(dyn ToSql + Sync), Type::INT8),
        BindArg::Float(v) => (v as &(dyn ToSql + Sync), Type::FLOAT8),
        BindArg::Text(v) => (v as &(dyn ToSql + Sync), Type::TEXT),
    }
}

fn row_to_json(row: &tokio_postgres::Row) -> Result<Row, tokio_postgres::Error> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = ColumnDecoder::for_type(column.type_()).decode(row, idx, column.name())?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

/// How a result column becomes a JSON property value.
///
/// Numerics are carried as decimal strings and temporal types as ISO 8601
/// text. Columns of any other type come out as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnDecoder {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Json,
    Text,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Uuid,
    Unsupported,
}

impl ColumnDecoder {
    fn for_type(ty: &Type) -> Self {
        match *ty {
            Type::BOOL => Self::Bool,
            Type::INT2 => Self::Int2,
            Type::INT4 => Self::Int4,
            Type::INT8 => Self::Int8,
            Type::FLOAT4 => Self::Float4,
            Type::FLOAT8 => Self::Float8,
            Type::NUMERIC => Self::Numeric,
            Type::JSON | Type::JSONB => Self::Json,
            Type::TIMESTAMP => Self::Timestamp,
            Type::TIMESTAMPTZ => Self::TimestampTz,
            Type::DATE => Self::Date,
            Type::TIME => Self::Time,
            Type::UUID => Self::Uuid,
            ref other if <String as FromSql>::accepts(other) => Self::Text,
            _ => Self::Unsupported,
        }
    }

    fn decode(
        self,
        row: &tokio_postgres::Row,
        idx: usize,
        column: &str,
    ) -> Result<Value, tokio_postgres::Error> {
        let value = match self {
            Self::Bool => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
            Self::Int2 => row.try_get::<_, Option<i16>>(idx)?.map(Value::from),
            Self::Int4 => row.try_get::<_, Option<i32>>(idx)?.map(Value::from),
            Self::Int8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::from),
            Self::Float4 => row
                .try_get::<_, Option<f32>>(idx)?
                .map(|v| Value::from(v as f64)),
            Self::Float8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::from),
            // NaN and values beyond 28 significant digits do not fit a Decimal.
            Self::Numeric => match row.try_get::<_, Option<Decimal>>(idx) {
                Ok(v) => v.map(|d| Value::String(d.to_string())),
                Err(err) => {
                    tracing::warn!(column, error = %err, "numeric value not representable; emitting null");
                    None
                }
            },
            Self::Json => row.try_get::<_, Option<Value>>(idx)?,
            Self::Text => row.try_get::<_, Option<String>>(idx)?.map(Value::String),
            Self::Timestamp => row
                .try_get::<_, Option<NaiveDateTime>>(idx)?
                .map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.3f").to_string())),
            Self::TimestampTz => row
                .try_get::<_, Option<DateTime<Utc>>>(idx)?
                .map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::Millis, true))),
            Self::Date => row
                .try_get::<_, Option<NaiveDate>>(idx)?
                .map(|d| Value::String(d.to_string())),
            Self::Time => row
                .try_get::<_, Option<NaiveTime>>(idx)?
                .map(|t| Value::String(t.to_string())),
            Self::Uuid => row
                .try_get::<_, Option<uuid::Uuid>>(idx)?
                .map(|u| Value::String(u.to_string())),
            Self::Unsupported => {
                let ty = row.columns()[idx].type_();
                tracing::warn!(column, pg_type = %ty, "unsupported column type; emitting null");
                None
            }
        };
        Ok(value.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use layers::{BindArg, ExecutionError, LayerExecutor, Statement};
    use pretty_assertions::assert_eq;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
    use rust_decimal::Decimal;
    use tokio_postgres::types::{FromSql, Kind, Type};

    use super::{bind_param, ColumnDecoder, PgPool, PoolConfig, PoolError, PostgresExecutor};

    fn config(max_size: usize) -> PoolConfig {
        PoolConfig {
            max_size,
            acquire_timeout: Duration::from_millis(50),
            statement_timeout: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn permit_wait_is_bounded_and_released() {
        let pool = PgPool::new("postgres://localhost/unused", config(1));
        let held = pool.permit().await.unwrap();
        assert_eq!(pool.available(), 0);

        let err = pool.permit().await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout { waited } if waited == Duration::from_millis(50)));

        drop(held);
        assert_eq!(pool.available(), 1);
        pool.permit().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_fails_layer_with_pool_timeout() {
        let exec = PostgresExecutor::new("postgres://localhost/unused", config(1));
        let _held = exec.pool().permit().await.unwrap();

        let stmt = Statement::new("SELECT 1", vec![]);
        let err = exec.execute(&stmt).await.unwrap_err();
        assert!(matches!(err, ExecutionError::PoolTimeout { .. }));
        assert_eq!(exec.identity(), "postgres://localhost/unused");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_leaves_permits_intact() {
        let exec = Arc::new(PostgresExecutor::new("postgres://localhost/unused", config(2)));
        let held = exec.pool().permit().await.unwrap();
        let _other = exec.pool().permit().await.unwrap();

        let waiting = exec.clone();
        let task = tokio::spawn(async move {
            let stmt = Statement::new("SELECT 1", vec![]);
            let _ = waiting.execute(&stmt).await;
        });
        tokio::task::yield_now().await;
        task.abort();
        let _ = task.await;

        drop(held);
        assert_eq!(exec.pool().available(), 1);
    }

    #[test]
    fn bind_arguments_are_typed() {
        let types: Vec<Type> = [
            BindArg::Null,
            BindArg::Int(7),
            BindArg::Float(0.5),
            BindArg::Text("a".into()),
        ]
        .iter()
        .map(|arg| bind_param(arg).1)
        .collect();
        assert_eq!(types, vec![Type::TEXT, Type::INT8, Type::FLOAT8, Type::TEXT]);
    }

    #[test]
    fn common_column_types_have_decoders() {
        let cases = [
            (Type::NUMERIC, ColumnDecoder::Numeric),
            (Type::TIMESTAMPTZ, ColumnDecoder::TimestampTz),
            (Type::TIMESTAMP, ColumnDecoder::Timestamp),
            (Type::DATE, ColumnDecoder::Date),
            (Type::TIME, ColumnDecoder::Time),
            (Type::UUID, ColumnDecoder::Uuid),
            (Type::JSONB, ColumnDecoder::Json),
            (Type::INT8, ColumnDecoder::Int8),
            (Type::VARCHAR, ColumnDecoder::Text),
            (Type::NAME, ColumnDecoder::Text),
        ];
        for (ty, decoder) in cases {
            assert_eq!(ColumnDecoder::for_type(&ty), decoder, "{ty}");
        }
    }

    #[test]
    fn decoders_read_with_types_that_accept_the_column() {
        assert!(<Decimal as FromSql>::accepts(&Type::NUMERIC));
        assert!(<DateTime<Utc> as FromSql>::accepts(&Type::TIMESTAMPTZ));
        assert!(<NaiveDateTime as FromSql>::accepts(&Type::TIMESTAMP));
        assert!(<NaiveDate as FromSql>::accepts(&Type::DATE));
        assert!(<NaiveTime as FromSql>::accepts(&Type::TIME));
        assert!(<uuid::Uuid as FromSql>::accepts(&Type::UUID));
    }

    #[test]
    fn unknown_types_decode_to_null_instead_of_failing() {
        let geometry = Type::new(
            "geometry".to_string(),
            90_001,
            Kind::Simple,
            "public".to_string(),
        );
        assert_eq!(ColumnDecoder::for_type(&geometry), ColumnDecoder::Unsupported);
        assert_eq!(ColumnDecoder::for_type(&Type::BYTEA), ColumnDecoder::Unsupported);
        assert_eq!(ColumnDecoder::for_type(&Type::INT4_ARRAY), ColumnDecoder::Unsupported);
    }
}
