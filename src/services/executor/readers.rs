//! Backend readers. Plain readers pull a table straight into Arrow;
//! geo readers additionally negotiate geometry encoding with the backend.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ExecutorError, Result};
use crate::models::{GeoArrowResult, GeoFormat, ReadData, SourceInfo};
use crate::services::database::postgres::PostgresOps;
use crate::services::database::snowflake::SnowflakeOps;
use crate::services::database::{DbContext, DEFAULT_SRID};

use super::Reader;

#[derive(Debug)]
pub struct PostgresReader;

/// Reads PostGIS tables, shipping each geometry column as a WKB sidecar
/// (`<col>_wkb`) so the Arrow surface stays typeless about geometry.
#[derive(Debug)]
pub struct PostgresGeoReader;

#[derive(Debug)]
pub struct SnowflakeReader;

/// Reads Snowflake tables with GEOGRAPHY columns. Snowflake's Arrow
/// results already render GEOGRAPHY as GeoJSON text, so the plain query
/// suffices; only the sidecar metadata differs.
#[derive(Debug)]
pub struct SnowflakeGeoReader;

fn postgres_ops(ctx: &DbContext) -> Result<&PostgresOps> {
    ctx.ops
        .as_any()
        .downcast_ref::<PostgresOps>()
        .ok_or_else(|| ExecutorError::Internal("postgres reader bound to non-postgres ops".into()))
}

fn snowflake_ops(ctx: &DbContext) -> Result<&SnowflakeOps> {
    ctx.ops
        .as_any()
        .downcast_ref::<SnowflakeOps>()
        .ok_or_else(|| {
            ExecutorError::Internal("snowflake reader bound to non-snowflake ops".into())
        })
}

#[async_trait]
impl Reader for PostgresReader {
    async fn read_arrow(&self, ctx: &DbContext, source: &SourceInfo) -> Result<ReadData> {
        let ops = postgres_ops(ctx)?;
        let query = ctx.ops.build_select_query(&source.schema, &source.table);
        let table = ops.query_arrow(&query).await?;
        debug!(table = %source.full_name, rows = table.num_rows(), "Read table");
        Ok(ReadData::Table(table))
    }
}

#[async_trait]
impl Reader for PostgresGeoReader {
    async fn read_arrow(&self, ctx: &DbContext, source: &SourceInfo) -> Result<ReadData> {
        let ops = postgres_ops(ctx)?;
        let geometry = ctx
            .ops
            .get_geometry_columns(&source.schema, &source.table)
            .await?;
        if geometry.is_empty() {
            let query = ctx.ops.build_select_query(&source.schema, &source.table);
            let table = ops.query_arrow(&query).await?;
            return Ok(ReadData::Geo(GeoArrowResult {
                table,
                geometry_columns: Vec::new(),
                srid: DEFAULT_SRID,
                format: GeoFormat::Wkb,
            }));
        }

        let all_columns = ctx
            .ops
            .get_all_columns(&source.schema, &source.table)
            .await?;
        // Substitute geometry columns in place so column order survives.
        let select_list: Vec<String> = all_columns
            .iter()
            .map(|column| {
                if geometry.iter().any(|(name, _)| name == column) {
                    format!(
                        "ST_AsBinary({ident}) AS {alias}",
                        ident = ctx.ops.format_identifier(column),
                        alias = ctx.ops.format_identifier(&format!("{column}_wkb")),
                    )
                } else {
                    ctx.ops.format_identifier(column)
                }
            })
            .collect();
        let query = format!(
            "SELECT {} FROM {}.{}",
            select_list.join(", "),
            ctx.ops.format_identifier(&source.schema),
            ctx.ops.format_identifier(&source.table),
        );

        let table = ops.query_arrow(&query).await?;
        let srid = geometry.first().map(|(_, srid)| *srid).unwrap_or(DEFAULT_SRID);
        debug!(
            table = %source.full_name,
            geometry_columns = geometry.len(),
            srid,
            "Read geo table"
        );
        Ok(ReadData::Geo(GeoArrowResult {
            table,
            geometry_columns: geometry.into_iter().map(|(name, _)| name).collect(),
            srid,
            format: GeoFormat::Wkb,
        }))
    }
}

#[async_trait]
impl Reader for SnowflakeReader {
    async fn read_arrow(&self, ctx: &DbContext, source: &SourceInfo) -> Result<ReadData> {
        let ops = snowflake_ops(ctx)?;
        let query = ctx.ops.build_select_query(&source.schema, &source.table);
        let table = ops.read_arrow_table(&source.schema, &query)?;
        debug!(table = %source.full_name, rows = table.num_rows(), "Read table");
        Ok(ReadData::Table(table))
    }
}

#[async_trait]
impl Reader for SnowflakeGeoReader {
    async fn read_arrow(&self, ctx: &DbContext, source: &SourceInfo) -> Result<ReadData> {
        let ops = snowflake_ops(ctx)?;
        let geometry = ctx
            .ops
            .get_geometry_columns(&source.schema, &source.table)
            .await?;
        let query = ctx.ops.build_select_query(&source.schema, &source.table);
        let table = ops.read_arrow_table(&source.schema, &query)?;
        let srid = geometry.first().map(|(_, srid)| *srid).unwrap_or(DEFAULT_SRID);
        Ok(ReadData::Geo(GeoArrowResult {
            table,
            geometry_columns: geometry.into_iter().map(|(name, _)| name).collect(),
            srid,
            format: GeoFormat::GeoJson,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::services::database::get_db_ops;

    #[test]
    fn test_reader_rejects_mismatched_ops() {
        let creds: Credentials = serde_json::from_value(serde_json::json!({
            "type": "postgres",
            "host": "localhost",
            "user": "u",
            "password": "p",
            "database": "d",
        }))
        .unwrap();
        let ctx = DbContext::new(get_db_ops("postgres", &creds).unwrap());
        assert!(postgres_ops(&ctx).is_ok());
        assert!(snowflake_ops(&ctx).is_err());
    }
}
