//! PostgreSQL backend implementation.
//!
//! This module provides a relational backend using PostgreSQL through
//! `tokio-postgres`, with connection pooling from `deadpool-postgres`.
//!
//! # Example
//!
//! ```ignore
//! use rowkeep::config::Config;
//! use rowkeep::driver::backends::postgres::PostgresDriver;
//! use rowkeep::driver::Driver;
//!
//! let config = Config::load()?;
//! let driver = PostgresDriver::connect(&config.postgres).await?;
//!
//! let runner = driver.create_query_runner().await?;
//! let rows = runner.query("SELECT id, name FROM users WHERE id = $1", &[json!(1)]).await?;
//! runner.release().await?;
//! ```

use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::NoTls;

use crate::config::PostgresConfig;
use crate::driver::row::Row;
use crate::driver::traits::{Driver, QueryRunner};
use crate::error::AppError;

type BoxError = Box<dyn Error + Sync + Send>;

// ----------------------------------------------------------------------------
// Parameter binding
// ----------------------------------------------------------------------------

/// Wrapper binding a JSON value as a statement parameter.
///
/// tokio-postgres always sends parameters in binary format, typed by what the
/// server inferred for each `$n` placeholder. This wrapper picks the binary
/// encoding from that inferred type rather than from the JSON value, so
/// `json!(5)` can fill an `int2`, `int4` or `int8` column alike.
///
/// # Security
///
/// Values are sent as typed binary data via the extended query protocol and
/// are never interpolated into the statement text.
#[derive(Debug)]
struct SqlParam<'a>(&'a JsonValue);

impl ToSql for SqlParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self.0 {
            JsonValue::Null => Ok(IsNull::Yes),
            JsonValue::Bool(b) => b.to_sql(ty, out),
            JsonValue::Number(n) => number_to_sql(n, ty, out),
            JsonValue::String(s) => string_to_sql(s, ty, out),
            JsonValue::Array(_) | JsonValue::Object(_) => self.0.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Every JSON value is accepted here; mismatches surface from to_sql.
        true
    }

    to_sql_checked!();
}

fn is_text(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN
    )
}

fn number_to_sql(n: &serde_json::Number, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    let as_i64 = || {
        n.as_i64()
            .ok_or_else(|| BoxError::from(format!("{} is not an integer", n)))
    };
    let as_f64 = || {
        n.as_f64()
            .ok_or_else(|| BoxError::from(format!("{} is not a float", n)))
    };

    match *ty {
        Type::INT2 => i16::try_from(as_i64()?)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(as_i64()?)?.to_sql(ty, out),
        Type::INT8 => as_i64()?.to_sql(ty, out),
        Type::FLOAT4 => (as_f64()? as f32).to_sql(ty, out),
        Type::FLOAT8 => as_f64()?.to_sql(ty, out),
        Type::JSON | Type::JSONB => JsonValue::Number(n.clone()).to_sql(ty, out),
        _ if is_text(ty) => n.to_string().as_str().to_sql(ty, out),
        _ => Err(format!("cannot bind number {} to a {} parameter", n, ty).into()),
    }
}

fn string_to_sql(s: &str, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::TIMESTAMPTZ => DateTime::parse_from_rfc3339(s)?
            .with_timezone(&Utc)
            .to_sql(ty, out),
        Type::TIMESTAMP => s.parse::<NaiveDateTime>()?.to_sql(ty, out),
        Type::DATE => s.parse::<NaiveDate>()?.to_sql(ty, out),
        Type::JSON | Type::JSONB => JsonValue::String(s.to_string()).to_sql(ty, out),
        _ if is_text(ty) => s.to_sql(ty, out),
        _ => Err(format!("cannot bind string to a {} parameter", ty).into()),
    }
}

// ----------------------------------------------------------------------------
// Driver
// ----------------------------------------------------------------------------

/// PostgreSQL driver.
///
/// Provides connection pooling via deadpool-postgres. Every query runner it
/// creates leases one pooled connection until released.
///
/// This type is cheap to clone - the underlying connection pool is `Arc`-based.
#[derive(Clone)]
pub struct PostgresDriver {
    pool: Pool,
}

impl PostgresDriver {
    /// Creates a new PostgreSQL driver with connection pooling.
    ///
    /// Connections are opened lazily, on the first lease.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, AppError> {
        let pg_config: tokio_postgres::Config = config.uri.parse().map_err(|e| {
            AppError::Pool(format!("Invalid PostgreSQL connection string: {}", e))
        })?;

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
        let pool = Pool::builder(mgr)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| AppError::Pool(format!("Failed to create connection pool: {}", e)))?;

        tracing::debug!(pool_size = config.pool_size, "PostgreSQL pool created");
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    async fn create_query_runner(&self) -> Result<Arc<dyn QueryRunner>, AppError> {
        let conn = self.pool.get().await.map_err(|e| {
            AppError::Pool(format!("Failed to get connection from pool: {}", e))
        })?;
        Ok(Arc::new(PostgresQueryRunner::new(conn)))
    }
}

// ----------------------------------------------------------------------------
// Query runner
// ----------------------------------------------------------------------------

/// A query runner owning one pooled PostgreSQL connection.
///
/// Statements issued concurrently through the same runner are serialized on
/// the connection. Dropping a runner with an open transaction logs a warning;
/// [`release`](QueryRunner::release) rolls such a transaction back first.
pub struct PostgresQueryRunner {
    conn: Mutex<Option<Object>>,
    transaction_active: AtomicBool,
}

impl PostgresQueryRunner {
    fn new(conn: Object) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            transaction_active: AtomicBool::new(false),
        }
    }

    async fn batch(&self, sql: &str) -> Result<(), AppError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(AppError::RunnerReleased)?;
        conn.batch_execute(sql)
            .await
            .map_err(|e| query_error(&e, sql))
    }
}

#[async_trait]
impl QueryRunner for PostgresQueryRunner {
    async fn query(&self, sql: &str, params: &[JsonValue]) -> Result<Vec<Row>, AppError> {
        tracing::trace!(sql, ?params, "query");
        let bound: Vec<SqlParam<'_>> = params.iter().map(SqlParam).collect();
        let refs: Vec<&(dyn ToSql + Sync)> =
            bound.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(AppError::RunnerReleased)?;
        let rows = conn
            .query(sql, &refs)
            .await
            .map_err(|e| query_error(&e, sql))?;

        rows.iter().map(|row| parse_pg_row(row, sql)).collect()
    }

    async fn execute(&self, sql: &str, params: &[JsonValue]) -> Result<u64, AppError> {
        tracing::trace!(sql, ?params, "execute");
        let bound: Vec<SqlParam<'_>> = params.iter().map(SqlParam).collect();
        let refs: Vec<&(dyn ToSql + Sync)> =
            bound.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(AppError::RunnerReleased)?;
        conn.execute(sql, &refs)
            .await
            .map_err(|e| query_error(&e, sql))
    }

    async fn start_transaction(&self) -> Result<(), AppError> {
        if self.transaction_active.load(Ordering::SeqCst) {
            return Err(AppError::TransactionAlreadyStarted);
        }
        self.batch("BEGIN").await?;
        self.transaction_active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<(), AppError> {
        if !self.transaction_active.load(Ordering::SeqCst) {
            return Err(AppError::TransactionNotActive);
        }
        self.batch("COMMIT").await?;
        self.transaction_active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<(), AppError> {
        if !self.transaction_active.load(Ordering::SeqCst) {
            return Err(AppError::TransactionNotActive);
        }
        self.batch("ROLLBACK").await?;
        self.transaction_active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_transaction_active(&self) -> bool {
        self.transaction_active.load(Ordering::SeqCst)
    }

    async fn release(&self) -> Result<(), AppError> {
        let conn = self.conn.lock().await.take().ok_or(AppError::RunnerReleased)?;

        if self.transaction_active.swap(false, Ordering::SeqCst) {
            tracing::warn!("Query runner released with an open transaction - rolling back");
            conn.batch_execute("ROLLBACK")
                .await
                .map_err(|e| query_error(&e, "ROLLBACK"))?;
        }

        // Dropping the object returns the connection to the pool.
        drop(conn);
        Ok(())
    }
}

impl Drop for PostgresQueryRunner {
    fn drop(&mut self) {
        if !*self.transaction_active.get_mut() {
            return;
        }
        if let Some(conn) = self.conn.get_mut().take() {
            tracing::warn!(
                "PostgresQueryRunner dropped with an open transaction - discarding its connection"
            );
            // Detached from the pool; closing the client aborts the transaction.
            drop(Object::take(conn));
        }
    }
}

/// Converts a driver error into a query error with PostgreSQL detail.
fn query_error(e: &tokio_postgres::Error, sql: &str) -> AppError {
    let detail = e
        .as_db_error()
        .map(|db_err| {
            format!(
                "{}: {} [{}] (detail: {:?}, hint: {:?})",
                db_err.severity(),
                db_err.message(),
                db_err.code().code(),
                db_err.detail(),
                db_err.hint()
            )
        })
        .unwrap_or_else(|| e.to_string());
    AppError::Query {
        message: format!("SQL execution failed: {}", detail),
        query: sql.to_string(),
    }
}

/// How a result column is decoded into JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Bool,
    Json,
    TimestampTz,
    Timestamp,
    Date,
    TextArray,
    Text,
}

/// The decoding for a column type, or `None` if the type has no JSON mapping.
fn column_kind(ty: &Type) -> Option<ColumnKind> {
    let kind = match ty.name() {
        "int2" => ColumnKind::Int2,
        "int4" => ColumnKind::Int4,
        "int8" => ColumnKind::Int8,
        "float4" => ColumnKind::Float4,
        "float8" => ColumnKind::Float8,
        "bool" => ColumnKind::Bool,
        "json" | "jsonb" => ColumnKind::Json,
        "timestamptz" => ColumnKind::TimestampTz,
        "timestamp" => ColumnKind::Timestamp,
        "date" => ColumnKind::Date,
        "_text" | "_varchar" => ColumnKind::TextArray,
        "text" | "varchar" | "bpchar" | "name" | "unknown" => ColumnKind::Text,
        _ => return None,
    };
    Some(kind)
}

fn float_to_json(value: f64) -> JsonValue {
    // NaN and the infinities have no JSON number form.
    serde_json::Number::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(value.to_string()))
}

/// Parses a PostgreSQL row into our generic Row type.
///
/// Standard PostgreSQL types are converted to their JSON equivalents;
/// timestamps become RFC 3339 strings. A column of any other type (numeric,
/// uuid, bytea, ...) is an error; cast it to text in the statement.
fn parse_pg_row(pg_row: &tokio_postgres::Row, sql: &str) -> Result<Row, AppError> {
    let mut data = HashMap::new();

    for (idx, column) in pg_row.columns().iter().enumerate() {
        let name = column.name();
        let ty = column.type_();

        let kind = column_kind(ty).ok_or_else(|| AppError::Query {
            message: format!(
                "Column '{}' has unsupported type {}; cast it with ::text",
                name, ty
            ),
            query: sql.to_string(),
        })?;

        let decoded = match kind {
            ColumnKind::Int2 => pg_row
                .try_get::<_, Option<i16>>(idx)
                .map(|v| v.map(JsonValue::from)),
            ColumnKind::Int4 => pg_row
                .try_get::<_, Option<i32>>(idx)
                .map(|v| v.map(JsonValue::from)),
            ColumnKind::Int8 => pg_row
                .try_get::<_, Option<i64>>(idx)
                .map(|v| v.map(JsonValue::from)),
            ColumnKind::Float4 => pg_row
                .try_get::<_, Option<f32>>(idx)
                .map(|v| v.map(|f| float_to_json(f as f64))),
            ColumnKind::Float8 => pg_row
                .try_get::<_, Option<f64>>(idx)
                .map(|v| v.map(float_to_json)),
            ColumnKind::Bool => pg_row
                .try_get::<_, Option<bool>>(idx)
                .map(|v| v.map(JsonValue::Bool)),
            ColumnKind::Json => pg_row.try_get::<_, Option<JsonValue>>(idx),
            ColumnKind::TimestampTz => pg_row
                .try_get::<_, Option<DateTime<Utc>>>(idx)
                .map(|v| v.map(|t| JsonValue::String(t.to_rfc3339()))),
            ColumnKind::Timestamp => pg_row
                .try_get::<_, Option<NaiveDateTime>>(idx)
                .map(|v| v.map(|t| JsonValue::String(t.to_string()))),
            ColumnKind::Date => pg_row
                .try_get::<_, Option<NaiveDate>>(idx)
                .map(|v| v.map(|d| JsonValue::String(d.to_string()))),
            ColumnKind::TextArray => pg_row.try_get::<_, Option<Vec<String>>>(idx).map(|v| {
                v.map(|items| JsonValue::Array(items.into_iter().map(JsonValue::String).collect()))
            }),
            ColumnKind::Text => pg_row
                .try_get::<_, Option<String>>(idx)
                .map(|v| v.map(JsonValue::String)),
        };

        let value = decoded.map_err(|e| AppError::Query {
            message: format!("Failed to decode column '{}' ({}): {}", name, ty, e),
            query: sql.to_string(),
        })?;
        data.insert(name.to_string(), value.unwrap_or(JsonValue::Null));
    }

    Ok(Row::new(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(value: &JsonValue, ty: &Type) -> Result<(bool, Vec<u8>), BoxError> {
        let mut out = BytesMut::new();
        let is_null = SqlParam(value).to_sql(ty, &mut out)?;
        Ok((matches!(is_null, IsNull::Yes), out.to_vec()))
    }

    #[test]
    fn test_null_binds_as_sql_null() {
        let (is_null, bytes) = encode(&JsonValue::Null, &Type::INT4).unwrap();
        assert!(is_null);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_number_follows_parameter_type() {
        let (_, int4) = encode(&json!(5), &Type::INT4).unwrap();
        assert_eq!(int4, vec![0, 0, 0, 5]);

        let (_, int8) = encode(&json!(5), &Type::INT8).unwrap();
        assert_eq!(int8, vec![0, 0, 0, 0, 0, 0, 0, 5]);
    }

    #[test]
    fn test_number_out_of_range_for_int2() {
        assert!(encode(&json!(70000), &Type::INT2).is_err());
    }

    #[test]
    fn test_number_into_numeric_is_rejected() {
        assert!(encode(&json!(1.5), &Type::NUMERIC).is_err());
    }

    #[test]
    fn test_string_binds_as_text() {
        let (is_null, bytes) = encode(&json!("alice"), &Type::VARCHAR).unwrap();
        assert!(!is_null);
        assert_eq!(bytes, b"alice".to_vec());
    }

    #[test]
    fn test_string_parses_timestamptz() {
        assert!(encode(&json!("2024-05-01T10:00:00Z"), &Type::TIMESTAMPTZ).is_ok());
        assert!(encode(&json!("yesterday"), &Type::TIMESTAMPTZ).is_err());
    }

    #[test]
    fn test_bool_binds() {
        let (_, bytes) = encode(&json!(true), &Type::BOOL).unwrap();
        assert_eq!(bytes, vec![1]);
    }

    #[test]
    fn test_supported_column_types() {
        assert_eq!(column_kind(&Type::INT8), Some(ColumnKind::Int8));
        assert_eq!(column_kind(&Type::JSONB), Some(ColumnKind::Json));
        assert_eq!(column_kind(&Type::VARCHAR), Some(ColumnKind::Text));
        assert_eq!(column_kind(&Type::TEXT_ARRAY), Some(ColumnKind::TextArray));
    }

    #[test]
    fn test_unsupported_column_types_have_no_decoding() {
        for ty in [Type::NUMERIC, Type::UUID, Type::BYTEA, Type::TIME, Type::INTERVAL, Type::INT4_ARRAY] {
            assert_eq!(column_kind(&ty), None, "{} should not decode", ty);
        }
    }

    #[test]
    fn test_non_finite_float_keeps_its_value() {
        assert_eq!(float_to_json(1.5), json!(1.5));
        assert_eq!(float_to_json(f64::NAN), json!("NaN"));
    }
}
