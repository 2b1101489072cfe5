//! Tabular store adapter (SQL over sqlx).
//!
//! # Connection handling
//!
//! The pool is created lazily, so a process can start while the database
//! is down. Each [`TabularBackend::run`] call checks out one connection and
//! returns it on every exit path, including cancellation.
//!
//! | Kind | Read-only guard |
//! |------|-----------------|
//! | `sqlite` | connections opened with `SQLITE_OPEN_READONLY` |
//! | `postgres` | query runs in a `READ ONLY` transaction that is rolled back |
//!
//! # Row decoding
//!
//! Rows become JSON objects keyed by column name. SQLite values are decoded
//! by their runtime storage class, since expression columns carry no
//! declared type. Postgres values are decoded by the column's type name;
//! `NUMERIC` is kept as a decimal string so no precision is lost.

use std::str::FromStr;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};
use tracing::debug;

use crate::config::TabularConfig;
use crate::error::TabularQueryError;
use crate::models::Row;

#[async_trait]
pub trait TabularBackend: Send + Sync {
    /// Run one SQL statement and return its rows.
    async fn run(&self, query: &str) -> Result<Vec<Row>, TabularQueryError>;

    /// Connectivity check.
    async fn ping(&self) -> Result<(), TabularQueryError> {
        self.run("SELECT 1").await.map(|_| ())
    }
}

pub enum SqlTabularBackend {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl SqlTabularBackend {
    /// Build a lazily-connecting pool for the configured database.
    pub fn connect_lazy(config: &TabularConfig) -> anyhow::Result<Self> {
        match config.kind.as_str() {
            "sqlite" => {
                let options = SqliteConnectOptions::from_str(&config.url)?.read_only(true);
                let pool = SqlitePoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect_lazy_with(options);
                Ok(SqlTabularBackend::Sqlite(pool))
            }
            "postgres" => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect_lazy(&config.url)?;
                Ok(SqlTabularBackend::Postgres(pool))
            }
            other => anyhow::bail!("Unknown tabular kind: {}", other),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SqlTabularBackend::Sqlite(_) => "sqlite",
            SqlTabularBackend::Postgres(_) => "postgres",
        }
    }
}

#[async_trait]
impl TabularBackend for SqlTabularBackend {
    async fn run(&self, query: &str) -> Result<Vec<Row>, TabularQueryError> {
        debug!(kind = self.kind(), "running tabular query");
        match self {
            SqlTabularBackend::Sqlite(pool) => {
                let mut conn = pool.acquire().await?;
                let rows = sqlx::query(query).fetch_all(&mut *conn).await?;
                Ok(rows.iter().map(sqlite_row_to_json).collect())
            }
            SqlTabularBackend::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                sqlx::query("SET TRANSACTION READ ONLY")
                    .execute(&mut *tx)
                    .await?;
                let rows = sqlx::query(query).fetch_all(&mut *tx).await;
                tx.rollback().await?;
                Ok(rows?.iter().map(pg_row_to_json).collect())
            }
        }
    }
}

fn sqlite_row_to_json(row: &SqliteRow) -> Row {
    let mut map = Row::new();
    for (idx, col) in row.columns().iter().enumerate() {
        let val = match row.try_get_raw(idx) {
            Ok(raw) if raw.is_null() => Value::Null,
            Ok(raw) => {
                let type_name = raw.type_info().name().to_string();
                match type_name.as_str() {
                    "INTEGER" | "BIGINT" | "INT8" | "BOOLEAN" => {
                        json!(row.try_get::<Option<i64>, _>(idx).unwrap_or(None))
                    }
                    "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
                        json!(row.try_get::<Option<f64>, _>(idx).unwrap_or(None))
                    }
                    "BLOB" => {
                        let bytes: Option<Vec<u8>> = row.try_get(idx).unwrap_or(None);
                        json!(bytes.map(|b| format!("<{} bytes>", b.len())))
                    }
                    _ => json!(row.try_get::<Option<String>, _>(idx).unwrap_or(None)),
                }
            }
            Err(_) => Value::Null,
        };
        map.insert(col.name().to_string(), val);
    }
    map
}

fn pg_row_to_json(row: &PgRow) -> Row {
    let mut map = Row::new();
    for col in row.columns() {
        let name = col.name();
        let idx = col.ordinal();
        let type_name = col.type_info().name();

        let val = match type_name {
            "INT2" => json!(row.try_get::<Option<i16>, _>(idx).unwrap_or(None)),
            "INT4" => json!(row.try_get::<Option<i32>, _>(idx).unwrap_or(None)),
            "INT8" => json!(row.try_get::<Option<i64>, _>(idx).unwrap_or(None)),
            "FLOAT4" => json!(row.try_get::<Option<f32>, _>(idx).unwrap_or(None)),
            "FLOAT8" => json!(row.try_get::<Option<f64>, _>(idx).unwrap_or(None)),
            "NUMERIC" => {
                let v: Option<rust_decimal::Decimal> = row.try_get(idx).unwrap_or(None);
                json!(v.map(|d| d.normalize().to_string()))
            }
            "BOOL" => json!(row.try_get::<Option<bool>, _>(idx).unwrap_or(None)),
            "DATE" => json!(row
                .try_get::<Option<chrono::NaiveDate>, _>(idx)
                .unwrap_or(None)
                .map(|d| d.to_string())),
            "TIMESTAMP" => json!(row
                .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
                .unwrap_or(None)
                .map(|d| d.to_string())),
            "TIMESTAMPTZ" => json!(row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
                .unwrap_or(None)
                .map(|d| d.to_rfc3339())),
            "UUID" => json!(row
                .try_get::<Option<uuid::Uuid>, _>(idx)
                .unwrap_or(None)
                .map(|u| u.to_string())),
            "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(idx).unwrap_or(None).unwrap_or(Value::Null),
            _ => json!(row.try_get::<Option<String>, _>(idx).unwrap_or(None)),
        };
        map.insert(name.to_string(), val);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_backend() -> (tempfile::TempDir, SqlTabularBackend) {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("shop.db");

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(&path)
                    .create_if_missing(true),
            )
            .await
            .unwrap();
        sqlx::query("CREATE TABLE products (id INTEGER PRIMARY KEY, title TEXT, price_actual REAL, shop_id INTEGER, image BLOB)")
            .execute(&writer)
            .await
            .unwrap();
        sqlx::query("INSERT INTO products VALUES (1, 'Phone', 999.5, 1, x'0102'), (2, 'Case', NULL, 1, NULL)")
            .execute(&writer)
            .await
            .unwrap();
        writer.close().await;

        let config = TabularConfig {
            kind: "sqlite".into(),
            url: format!("sqlite:{}", path.display()),
            max_connections: 2,
            query_timeout_secs: 5,
        };
        (tmp, SqlTabularBackend::connect_lazy(&config).unwrap())
    }

    #[tokio::test]
    async fn test_sqlite_rows_as_json() {
        let (_tmp, backend) = seeded_backend().await;
        let rows = backend
            .run("SELECT id, title, price_actual, image FROM products ORDER BY id")
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(rows[0]["title"], json!("Phone"));
        assert_eq!(rows[0]["price_actual"], json!(999.5));
        assert_eq!(rows[0]["image"], json!("<2 bytes>"));
        assert_eq!(rows[1]["price_actual"], Value::Null);
    }

    #[tokio::test]
    async fn test_sqlite_expression_columns() {
        let (_tmp, backend) = seeded_backend().await;
        let rows = backend
            .run("SELECT shop_id, COUNT(*) AS product_count, AVG(price_actual) AS avg_price FROM products GROUP BY shop_id")
            .await
            .unwrap();
        assert_eq!(rows[0]["product_count"], json!(2));
        assert_eq!(rows[0]["avg_price"], json!(999.5));
    }

    #[tokio::test]
    async fn test_sqlite_is_read_only() {
        let (_tmp, backend) = seeded_backend().await;
        let err = backend
            .run("DELETE FROM products")
            .await
            .unwrap_err();
        assert!(!err.message.is_empty());

        let rows = backend.run("SELECT COUNT(*) AS n FROM products").await.unwrap();
        assert_eq!(rows[0]["n"], json!(2));
    }

    #[tokio::test]
    async fn test_syntax_error_is_reported() {
        let (_tmp, backend) = seeded_backend().await;
        let err = backend.run("SELEC * FROM products").await.unwrap_err();
        assert!(err.message.contains("syntax"));
        assert!(backend.ping().await.is_ok());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let config = TabularConfig {
            kind: "duckdb".into(),
            url: "duckdb::memory:".into(),
            max_connections: 1,
            query_timeout_secs: 1,
        };
        assert!(SqlTabularBackend::connect_lazy(&config).is_err());
    }
}
