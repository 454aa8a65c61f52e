// Database abstraction layer for multi-backend support
pub mod postgres;
pub mod snowflake;

pub use postgres::PostgresOps;
pub use snowflake::SnowflakeOps;

use std::any::Any;
use std::sync::Arc;

use pyo3::prelude::*;
use serde_json::Value;

use crate::config::Credentials;
use crate::error::{ExecutorError, Result};

/// Spatial reference applied when the catalog reports none (or zero).
pub const DEFAULT_SRID: i32 = 4326;

/// Database backend enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbBackend {
    Postgres,
    Snowflake,
}

impl DbBackend {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DbBackend::Postgres),
            "snowflake" => Ok(DbBackend::Snowflake),
            _ => Err(ExecutorError::UnsupportedBackend {
                requested: s.to_string(),
                supported: supported_backends(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DbBackend::Postgres => "postgres",
            DbBackend::Snowflake => "snowflake",
        }
    }
}

pub fn supported_backends() -> Vec<String> {
    vec!["postgres".to_string(), "snowflake".to_string()]
}

/// Per-backend database primitives: identifier quoting, catalog queries,
/// literal formatting, statement execution. Implementations are swappable
/// without touching readers, writers, or the executor.
#[async_trait::async_trait]
pub trait DatabaseOps: Send + Sync + std::fmt::Debug {
    fn backend(&self) -> DbBackend;

    /// Connection descriptor, for logging and validation surfaces.
    fn connection_string(&self) -> String;

    /// Backend-specific identifier quoting/casing.
    fn format_identifier(&self, name: &str) -> String;

    /// Full-table SELECT with backend-correct identifier formatting.
    fn build_select_query(&self, schema: &str, table: &str) -> String;

    /// Column names ordered by ordinal position. The ordering is load-bearing:
    /// geometry-column substitution on read must preserve it.
    async fn get_all_columns(&self, schema: &str, table: &str) -> Result<Vec<String>>;

    /// Geometry/geography columns with their spatial reference ids, in catalog
    /// order. Missing or zero SRIDs are substituted with [`DEFAULT_SRID`].
    async fn get_geometry_columns(&self, schema: &str, table: &str) -> Result<Vec<(String, i32)>>;

    async fn drop_table(&self, schema: &str, table: &str) -> Result<()>;

    /// Execute a single statement, returning affected rows where the backend
    /// reports them.
    async fn execute(&self, sql: &str) -> Result<u64>;

    async fn test_connection(&self) -> Result<()>;

    /// Render list values as the backend's array literal.
    fn format_array(&self, values: &[Value]) -> String;

    /// Backend array type name for post-write casts.
    fn array_type(&self, is_integer: bool) -> &'static str;

    /// ALTER statement re-establishing a column type the bulk-write path could
    /// not express directly.
    fn post_write_sql(&self, schema: &str, table: &str, col: &str, dtype: &str) -> String;

    /// Render a geometry object as the backend's load-time literal form.
    fn geometry_to_db(&self, geom: &Bound<'_, PyAny>, srid: i32) -> Result<String>;

    /// Downcast hook for backend-specific readers and writers.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a backend's operations, created once per executor and
/// passed read-only to every reader and writer call.
#[derive(Clone)]
#[derive(Debug)]
pub struct DbContext {
    pub ops: Arc<dyn DatabaseOps>,
}

impl DbContext {
    pub fn new(ops: Arc<dyn DatabaseOps>) -> Self {
        Self { ops }
    }
}

/// Factory selecting database operations by backend type string.
pub fn get_db_ops(backend_type: &str, creds: &Credentials) -> Result<Arc<dyn DatabaseOps>> {
    match (DbBackend::from_str(backend_type)?, creds) {
        (DbBackend::Postgres, Credentials::Postgres(pg)) => Ok(Arc::new(PostgresOps::new(pg)?)),
        (DbBackend::Snowflake, Credentials::Snowflake(sf)) => {
            Ok(Arc::new(SnowflakeOps::new(sf.clone())))
        }
        (backend, creds) => Err(ExecutorError::UnsupportedBackend {
            requested: format!(
                "{} (credentials are for {})",
                backend.as_str(),
                creds.backend_type()
            ),
            supported: supported_backends(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str() {
        assert_eq!(DbBackend::from_str("postgres").unwrap(), DbBackend::Postgres);
        assert_eq!(DbBackend::from_str("PostgreSQL").unwrap(), DbBackend::Postgres);
        assert_eq!(DbBackend::from_str("snowflake").unwrap(), DbBackend::Snowflake);
        assert!(matches!(
            DbBackend::from_str("mysql"),
            Err(ExecutorError::UnsupportedBackend { .. })
        ));
    }

    #[test]
    fn test_get_db_ops_rejects_mismatched_credentials() {
        let creds: Credentials = serde_json::from_value(serde_json::json!({
            "type": "postgres",
            "host": "localhost",
            "user": "u",
            "password": "p",
            "database": "d",
        }))
        .unwrap();
        let err = get_db_ops("snowflake", &creds).unwrap_err();
        assert!(matches!(err, ExecutorError::UnsupportedBackend { .. }));
    }
}
