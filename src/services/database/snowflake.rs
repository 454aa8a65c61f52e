// Snowflake operations bridged through the Python connector SDK
use std::any::Any;

use pyo3::prelude::*;
use pyo3::types::PyDict;
use serde_json::Value;

use crate::config::SnowflakeCredentials;
use crate::error::Result;
use crate::models::ArrowTable;
use crate::services::database::{DatabaseOps, DbBackend, DEFAULT_SRID};
use crate::services::python::pyarrow_to_table;

/// Snowflake database operations.
///
/// There is no native Rust driver with bulk Arrow I/O, so every call opens a
/// `snowflake.connector` connection through the embedded interpreter and
/// closes it before returning. Calls are blocking and hold the GIL for their
/// duration.
#[derive(Debug)]
pub struct SnowflakeOps {
    creds: SnowflakeCredentials,
}

impl SnowflakeOps {
    pub fn new(creds: SnowflakeCredentials) -> Self {
        Self { creds }
    }

    fn connect<'py>(&self, py: Python<'py>, schema: Option<&str>) -> Result<Bound<'py, PyAny>> {
        let connector = py.import("snowflake.connector")?;
        let kwargs = PyDict::new(py);
        kwargs.set_item("account", &self.creds.account)?;
        kwargs.set_item("user", &self.creds.user)?;
        kwargs.set_item("password", &self.creds.password)?;
        kwargs.set_item("warehouse", &self.creds.warehouse)?;
        kwargs.set_item("database", &self.creds.database)?;
        kwargs.set_item("schema", schema.unwrap_or(&self.creds.schema))?;
        if let Some(role) = &self.creds.role {
            kwargs.set_item("role", role)?;
        }
        Ok(connector.call_method("connect", (), Some(&kwargs))?)
    }

    /// Execute a query and return the full result as an Arrow table.
    pub fn read_arrow_table(&self, schema: &str, query: &str) -> Result<ArrowTable> {
        Python::with_gil(|py| {
            let conn = self.connect(py, Some(schema))?;
            let result = (|| -> Result<ArrowTable> {
                let cursor = conn.call_method0("cursor")?;
                cursor.call_method1("execute", (query,))?;
                let kwargs = PyDict::new(py);
                kwargs.set_item("force_return_table", true)?;
                let table = cursor.call_method("fetch_arrow_all", (), Some(&kwargs))?;
                pyarrow_to_table(&table)
            })();
            conn.call_method0("close")?;
            result
        })
    }

    /// Uppercase column names and bulk-write a pandas frame via
    /// `write_pandas`, replacing the destination table. Returns row count.
    pub fn write_from_pandas(
        &self,
        py: Python<'_>,
        df: &Bound<'_, PyAny>,
        schema: &str,
        table: &str,
    ) -> Result<u64> {
        let upper = df.getattr("columns")?.getattr("str")?.call_method0("upper")?;
        df.setattr("columns", upper)?;

        let conn = self.connect(py, Some(schema))?;
        let result = (|| -> Result<u64> {
            let tools = py.import("snowflake.connector.pandas_tools")?;
            let kwargs = PyDict::new(py);
            kwargs.set_item("table_name", self.format_identifier(table))?;
            kwargs.set_item("schema", self.format_identifier(schema))?;
            kwargs.set_item("auto_create_table", true)?;
            kwargs.set_item("overwrite", true)?;
            tools.call_method("write_pandas", (conn.clone(), df.clone()), Some(&kwargs))?;
            Ok(df.len()? as u64)
        })();
        conn.call_method0("close")?;
        result
    }

    /// Run a catalog query and collect lowercased first-column values.
    fn query_column_names(&self, schema: &str, query: &str) -> Result<Vec<String>> {
        Python::with_gil(|py| {
            let conn = self.connect(py, Some(schema))?;
            let result = (|| -> Result<Vec<String>> {
                let cursor = conn.call_method0("cursor")?;
                cursor.call_method1("execute", (query,))?;
                let rows = cursor.call_method0("fetchall")?;
                let mut names = Vec::new();
                for row in rows.try_iter()? {
                    let name: String = row?.get_item(0)?.extract()?;
                    names.push(name.to_lowercase());
                }
                Ok(names)
            })();
            conn.call_method0("close")?;
            result
        })
    }
}

#[async_trait::async_trait]
impl DatabaseOps for SnowflakeOps {
    fn backend(&self) -> DbBackend {
        DbBackend::Snowflake
    }

    fn connection_string(&self) -> String {
        format!(
            "snowflake://{}:***@{}/{}/{}?warehouse={}",
            self.creds.user,
            self.creds.account,
            self.creds.database,
            self.creds.schema,
            self.creds.warehouse
        )
    }

    /// Uppercase, unquoted.
    fn format_identifier(&self, name: &str) -> String {
        name.to_uppercase()
    }

    fn build_select_query(&self, schema: &str, table: &str) -> String {
        format!(
            "SELECT * FROM {}.{}",
            self.format_identifier(schema),
            self.format_identifier(table)
        )
    }

    async fn get_all_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        self.query_column_names(
            schema,
            &format!(
                concat!(
                    "SELECT column_name FROM information_schema.columns ",
                    "WHERE table_schema = '{}' AND table_name = '{}' ",
                    "ORDER BY ordinal_position"
                ),
                schema.to_uppercase(),
                table.to_uppercase()
            ),
        )
    }

    async fn get_geometry_columns(&self, schema: &str, table: &str) -> Result<Vec<(String, i32)>> {
        let names = self.query_column_names(
            schema,
            &format!(
                concat!(
                    "SELECT column_name FROM information_schema.columns ",
                    "WHERE table_schema = '{}' AND table_name = '{}' ",
                    "AND data_type = 'GEOGRAPHY' ORDER BY ordinal_position"
                ),
                schema.to_uppercase(),
                table.to_uppercase()
            ),
        )?;
        // Snowflake GEOGRAPHY is always WGS 84
        Ok(names.into_iter().map(|n| (n, DEFAULT_SRID)).collect())
    }

    /// `write_pandas(overwrite=True)` replaces the table; nothing to drop.
    async fn drop_table(&self, _schema: &str, _table: &str) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        Python::with_gil(|py| {
            let conn = self.connect(py, None)?;
            let result = (|| -> Result<u64> {
                let cursor = conn.call_method0("cursor")?;
                cursor.call_method1("execute", (sql,))?;
                let rowcount: i64 = cursor.getattr("rowcount")?.extract().unwrap_or(0);
                Ok(rowcount.max(0) as u64)
            })();
            conn.call_method0("close")?;
            result
        })
    }

    async fn test_connection(&self) -> Result<()> {
        self.execute("SELECT 1").await.map(|_| ())
    }

    /// JSON literal; parsed into VARIANT-compatible text on the way in.
    fn format_array(&self, values: &[Value]) -> String {
        serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
    }

    fn array_type(&self, _is_integer: bool) -> &'static str {
        "ARRAY"
    }

    fn post_write_sql(&self, schema: &str, table: &str, col: &str, dtype: &str) -> String {
        format!(
            "ALTER TABLE {}.{} ALTER COLUMN {} SET DATA TYPE {}",
            self.format_identifier(schema),
            self.format_identifier(table),
            self.format_identifier(col),
            dtype
        )
    }

    /// GeoJSON string from the geometry's `__geo_interface__`; converted to
    /// GEOGRAPHY after the load.
    fn geometry_to_db(&self, geom: &Bound<'_, PyAny>, _srid: i32) -> Result<String> {
        let py = geom.py();
        let json_mod = py.import("json")?;
        let geo = geom.getattr("__geo_interface__")?;
        Ok(json_mod.call_method1("dumps", (geo,))?.extract()?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl SnowflakeOps {
    /// Column-swap sequence converting a text column to GEOGRAPHY in place.
    /// The bulk-write path cannot target GEOGRAPHY columns directly.
    pub fn geography_swap_sql(&self, schema: &str, table: &str, col: &str) -> Vec<String> {
        let s = self.format_identifier(schema);
        let t = self.format_identifier(table);
        let c = self.format_identifier(col);
        let tmp = format!("{}_GEO_TMP", c);
        vec![
            format!("ALTER TABLE {s}.{t} ADD COLUMN {tmp} GEOGRAPHY"),
            format!("UPDATE {s}.{t} SET {tmp} = TRY_TO_GEOGRAPHY({c})"),
            format!("ALTER TABLE {s}.{t} DROP COLUMN {c}"),
            format!("ALTER TABLE {s}.{t} RENAME COLUMN {tmp} TO {c}"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_ops() -> SnowflakeOps {
        SnowflakeOps::new(SnowflakeCredentials {
            account: "acme-xy123".to_string(),
            user: "loader".to_string(),
            password: "secret".to_string(),
            database: "raw".to_string(),
            schema: "public".to_string(),
            warehouse: "transforming".to_string(),
            role: None,
        })
    }

    #[test]
    fn test_format_identifier_uppercases() {
        let ops = test_ops();
        assert_eq!(ops.format_identifier("orders"), "ORDERS");
    }

    #[test]
    fn test_build_select_query() {
        let ops = test_ops();
        assert_eq!(
            ops.build_select_query("public", "orders"),
            "SELECT * FROM PUBLIC.ORDERS"
        );
    }

    #[test]
    fn test_format_array_is_json() {
        let ops = test_ops();
        assert_eq!(ops.format_array(&[json!(1), json!("a")]), "[1,\"a\"]");
    }

    #[test]
    fn test_connection_string_masks_password() {
        let ops = test_ops();
        let conn = ops.connection_string();
        assert!(conn.contains("***"));
        assert!(!conn.contains("secret"));
    }

    #[test]
    fn test_geography_swap_sequence() {
        let ops = test_ops();
        let stmts = ops.geography_swap_sql("public", "places", "geom");
        assert_eq!(stmts.len(), 4);
        assert!(stmts[0].contains("ADD COLUMN GEOM_GEO_TMP GEOGRAPHY"));
        assert!(stmts[1].contains("TRY_TO_GEOGRAPHY(GEOM)"));
        assert!(stmts[2].contains("DROP COLUMN GEOM"));
        assert!(stmts[3].contains("RENAME COLUMN GEOM_GEO_TMP TO GEOM"));
    }
}
