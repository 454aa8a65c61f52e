//! Backend writers. Every writer replaces the destination table wholesale;
//! incremental strategies are the host's responsibility.

use async_trait::async_trait;
use pyo3::prelude::*;
use tracing::{debug, info};

use crate::error::{ExecutorError, Result};
use crate::models::{ExecutionResult, SourceInfo};
use crate::services::database::postgres::PostgresOps;
use crate::services::database::snowflake::SnowflakeOps;
use crate::services::database::DbContext;

use super::converters::{dataframe_srid, geometry_columns, stringify_geometry};
use super::{Converter, Writer};

#[derive(Debug)]
pub struct PostgresWriter;

/// PostGIS writer. Geometry travels as EWKT text through the binary copy,
/// then the columns are cast to `geometry` in place before the replacement
/// commits.
#[derive(Debug)]
pub struct PostgresGeoWriter;

#[derive(Debug)]
pub struct SnowflakeWriter;

/// Snowflake GEOGRAPHY writer. Geometry is loaded as GeoJSON text and then
/// swapped into a GEOGRAPHY column via `TRY_TO_GEOGRAPHY`.
#[derive(Debug)]
pub struct SnowflakeGeoWriter;

fn postgres_ops(ctx: &DbContext) -> Result<&PostgresOps> {
    ctx.ops
        .as_any()
        .downcast_ref::<PostgresOps>()
        .ok_or_else(|| ExecutorError::Internal("postgres writer bound to non-postgres ops".into()))
}

fn snowflake_ops(ctx: &DbContext) -> Result<&SnowflakeOps> {
    ctx.ops
        .as_any()
        .downcast_ref::<SnowflakeOps>()
        .ok_or_else(|| {
            ExecutorError::Internal("snowflake writer bound to non-snowflake ops".into())
        })
}

/// Statements run inside the replacement transaction after the COPY: one
/// array cast per detected list column, then one geometry cast per geometry
/// column.
fn postgres_post_sql(
    ctx: &DbContext,
    source: &SourceInfo,
    array_columns: &[(String, bool)],
    geo_columns: &[String],
) -> Vec<String> {
    let mut statements = Vec::with_capacity(array_columns.len() + geo_columns.len());
    for (column, is_integer) in array_columns {
        statements.push(ctx.ops.post_write_sql(
            &source.schema,
            &source.table,
            column,
            ctx.ops.array_type(*is_integer),
        ));
    }
    for column in geo_columns {
        statements.push(
            ctx.ops
                .post_write_sql(&source.schema, &source.table, column, "geometry"),
        );
    }
    statements
}

#[async_trait]
impl Writer for PostgresWriter {
    async fn write(
        &self,
        ctx: &DbContext,
        df: Py<PyAny>,
        source: &SourceInfo,
        converter: &dyn Converter,
    ) -> Result<ExecutionResult> {
        let ops = postgres_ops(ctx)?;
        let (table, array_columns) = Python::with_gil(|py| {
            let df = df.into_bound(py);
            let (df, array_columns) =
                converter.prepare_array_columns(py, df, ctx.ops.as_ref())?;
            Ok::<_, ExecutorError>((converter.to_arrow(py, &df)?, array_columns))
        })?;

        let post_sql = postgres_post_sql(ctx, source, &array_columns, &[]);
        let rows = ops
            .replace_table(&source.schema, &source.table, &table, &post_sql)
            .await?;

        info!(table = %source.full_name, rows, "Wrote table");
        Ok(ExecutionResult::new(
            rows,
            source.schema.clone(),
            source.table.clone(),
        ))
    }
}

#[async_trait]
impl Writer for PostgresGeoWriter {
    async fn write(
        &self,
        ctx: &DbContext,
        df: Py<PyAny>,
        source: &SourceInfo,
        converter: &dyn Converter,
    ) -> Result<ExecutionResult> {
        let ops = postgres_ops(ctx)?;
        let (table, array_columns, geo_columns) = Python::with_gil(|py| {
            let df = df.into_bound(py);
            let geo_columns = geometry_columns(&df)?;
            let srid = dataframe_srid(&df);
            stringify_geometry(&df, &geo_columns, srid, ctx.ops.as_ref())?;
            let (df, array_columns) =
                converter.prepare_array_columns(py, df, ctx.ops.as_ref())?;
            Ok::<_, ExecutorError>((converter.to_arrow(py, &df)?, array_columns, geo_columns))
        })?;

        let post_sql = postgres_post_sql(ctx, source, &array_columns, &geo_columns);
        let rows = ops
            .replace_table(&source.schema, &source.table, &table, &post_sql)
            .await?;

        info!(
            table = %source.full_name,
            rows,
            geometry_columns = geo_columns.len(),
            "Wrote geo table"
        );
        Ok(ExecutionResult::new(
            rows,
            source.schema.clone(),
            source.table.clone(),
        ))
    }
}

#[async_trait]
impl Writer for SnowflakeWriter {
    async fn write(
        &self,
        ctx: &DbContext,
        df: Py<PyAny>,
        source: &SourceInfo,
        converter: &dyn Converter,
    ) -> Result<ExecutionResult> {
        let ops = snowflake_ops(ctx)?;
        ctx.ops.drop_table(&source.schema, &source.table).await?;
        let rows = Python::with_gil(|py| {
            let df = df.into_bound(py);
            let (df, _array_columns) =
                converter.prepare_array_columns(py, df, ctx.ops.as_ref())?;
            let pandas = converter.to_pandas(py, &df)?;
            ops.write_from_pandas(py, &pandas, &source.schema, &source.table)
        })?;

        info!(table = %source.full_name, rows, "Wrote table");
        Ok(ExecutionResult::new(
            rows,
            source.schema.clone(),
            source.table.clone(),
        ))
    }
}

#[async_trait]
impl Writer for SnowflakeGeoWriter {
    async fn write(
        &self,
        ctx: &DbContext,
        df: Py<PyAny>,
        source: &SourceInfo,
        converter: &dyn Converter,
    ) -> Result<ExecutionResult> {
        let ops = snowflake_ops(ctx)?;
        ctx.ops.drop_table(&source.schema, &source.table).await?;
        let (rows, geo_columns) = Python::with_gil(|py| {
            let df = df.into_bound(py);
            let geo_columns = geometry_columns(&df)?;
            let srid = dataframe_srid(&df);
            stringify_geometry(&df, &geo_columns, srid, ctx.ops.as_ref())?;
            let (df, _array_columns) =
                converter.prepare_array_columns(py, df, ctx.ops.as_ref())?;
            let pandas = converter.to_pandas(py, &df)?;
            let rows = ops.write_from_pandas(py, &pandas, &source.schema, &source.table)?;
            Ok::<_, ExecutorError>((rows, geo_columns))
        })?;

        for column in &geo_columns {
            for sql in ops.geography_swap_sql(&source.schema, &source.table, column) {
                debug!(statement = %sql, "Geography column swap");
                ctx.ops.execute(&sql).await?;
            }
        }

        info!(
            table = %source.full_name,
            rows,
            geometry_columns = geo_columns.len(),
            "Wrote geo table"
        );
        Ok(ExecutionResult::new(
            rows,
            source.schema.clone(),
            source.table.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, PostgresCredentials};
    use crate::services::database::get_db_ops;

    fn test_ctx() -> DbContext {
        let creds = Credentials::Postgres(PostgresCredentials {
            host: "localhost".to_string(),
            port: 5432,
            user: "u".to_string(),
            password: "p".to_string(),
            database: "analytics".to_string(),
            schema: "public".to_string(),
        });
        DbContext::new(get_db_ops("postgres", &creds).unwrap())
    }

    #[test]
    fn test_post_load_casts_arrays_before_geometry() {
        let ctx = test_ctx();
        let source = SourceInfo::parse("public.places").unwrap();
        let statements = postgres_post_sql(
            &ctx,
            &source,
            &[("tags".to_string(), false), ("ids".to_string(), true)],
            &["geom".to_string()],
        );
        assert_eq!(statements.len(), 3);
        assert!(statements[0].contains("tags TYPE TEXT[]"));
        assert!(statements[1].contains("ids TYPE INTEGER[]"));
        assert!(statements[2].contains("geom TYPE geometry"));
    }
}
