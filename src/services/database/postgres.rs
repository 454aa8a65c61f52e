// PostgreSQL operations using connection pooling for catalog queries and bulk I/O
use std::any::Any;

use arrow::array::{
    Array, ArrayRef, BinaryArray, BinaryBuilder, BooleanArray, BooleanBuilder, Date32Array,
    Date32Builder, Float32Array, Float32Builder, Float64Array, Float64Builder, Int16Array,
    Int16Builder, Int32Array, Int32Builder, Int64Array, Int64Builder, StringArray, StringBuilder,
    TimestampMicrosecondArray, TimestampMicrosecondBuilder,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod};
use pyo3::prelude::*;
use serde_json::Value;
use std::sync::Arc;
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::NoTls;

use crate::config::{mask_credentials, PostgresCredentials};
use crate::error::{ExecutorError, Result};
use crate::models::ArrowTable;
use crate::services::database::{DatabaseOps, DbBackend, DEFAULT_SRID};

/// PostgreSQL database operations.
///
/// Owns a connection pool sized for one executor; every read, catalog lookup,
/// and bulk write goes through it.
#[derive(Debug)]
pub struct PostgresOps {
    pool: Pool,
    connection_url: String,
}

impl PostgresOps {
    pub fn new(creds: &PostgresCredentials) -> Result<Self> {
        let connection_url = format!(
            "postgresql://{}:{}@{}:{}/{}",
            creds.user, creds.password, creds.host, creds.port, creds.database
        );

        let mut cfg = PoolConfig::new();
        cfg.url = Some(connection_url.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = cfg.create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)?;
        pool.resize(16);

        tracing::debug!(
            "Created connection pool for: {}",
            mask_credentials(&connection_url)
        );

        Ok(Self {
            pool,
            connection_url,
        })
    }

    /// Execute a query and return the full result as an Arrow table.
    ///
    /// The schema is derived from the prepared statement, so empty tables
    /// still produce correctly typed (zero-row) results. Columns whose type
    /// has no native Arrow mapping (arrays, NUMERIC, geometry, ...) are
    /// re-projected as `::text` so their values survive as text instead of
    /// failing to decode.
    pub async fn query_arrow(&self, sql: &str) -> Result<ArrowTable> {
        let client = self.pool.get().await?;
        let mut stmt = client.prepare(sql).await?;

        let casts: Vec<(String, bool)> = stmt
            .columns()
            .iter()
            .map(|col| {
                (
                    col.name().to_string(),
                    postgres_type_to_arrow(col.type_()).is_none(),
                )
            })
            .collect();
        if casts.iter().any(|(_, cast)| *cast) {
            stmt = client.prepare(&text_cast_query(sql, &casts)).await?;
        }

        let fields: Vec<Field> = stmt
            .columns()
            .iter()
            .map(|col| {
                Field::new(
                    col.name(),
                    postgres_type_to_arrow(col.type_()).unwrap_or(DataType::Utf8),
                    true,
                )
            })
            .collect();
        let schema = Arc::new(Schema::new(fields));

        let rows = client.query(&stmt, &[]).await?;
        tracing::debug!(rows = rows.len(), "Fetched result set from PostgreSQL");

        if rows.is_empty() {
            return Ok(ArrowTable::new(schema, vec![]));
        }
        let batch = rows_to_record_batch(&rows, schema.clone())?;
        Ok(ArrowTable::new(schema, vec![batch]))
    }

    /// Replace `schema.table` with the given batches inside one transaction:
    /// drop, create from the Arrow schema, binary COPY, then any post-load
    /// statements. Readers see the old table until commit, and a failure at
    /// any step rolls the whole replacement back. Returns the number of rows
    /// copied.
    pub async fn replace_table(
        &self,
        schema: &str,
        table: &str,
        data: &ArrowTable,
        post_sql: &[String],
    ) -> Result<u64> {
        let (batches, columns) = normalize_for_copy(&data.batches, &data.schema)?;

        let qualified = format!(
            "{}.{}",
            self.format_identifier(schema),
            self.format_identifier(table)
        );
        let col_defs: Vec<String> = columns
            .iter()
            .map(|c| format!("{} {}", self.format_identifier(&c.name), c.ddl))
            .collect();
        let col_names: Vec<String> = columns
            .iter()
            .map(|c| self.format_identifier(&c.name))
            .collect();

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        tx.execute(self.drop_table_sql(schema, table).as_str(), &[])
            .await?;
        tx.execute(
            format!("CREATE TABLE {} ({})", qualified, col_defs.join(", ")).as_str(),
            &[],
        )
        .await?;

        let copy_sql = format!(
            "COPY {} ({}) FROM STDIN BINARY",
            qualified,
            col_names.join(", ")
        );
        let types: Vec<Type> = columns.iter().map(|c| c.pg_type.clone()).collect();
        let sink = tx.copy_in(copy_sql.as_str()).await?;
        let writer = BinaryCopyInWriter::new(sink, &types);
        futures::pin_mut!(writer);

        for batch in &batches {
            for row in 0..batch.num_rows() {
                let values = copy_row_values(batch, row)?;
                let refs: Vec<&(dyn ToSql + Sync)> = values.iter().map(|v| v.as_sql()).collect();
                writer.as_mut().write(&refs).await?;
            }
        }
        let rows = writer.finish().await?;

        for sql in post_sql {
            tx.execute(sql.as_str(), &[]).await?;
        }
        tx.commit().await?;
        tracing::info!(rows, table = %qualified, "Replaced table via COPY");
        Ok(rows)
    }

    fn drop_table_sql(&self, schema: &str, table: &str) -> String {
        format!(
            "DROP TABLE IF EXISTS {}.{} CASCADE",
            self.format_identifier(schema),
            self.format_identifier(table)
        )
    }
}

#[async_trait::async_trait]
impl DatabaseOps for PostgresOps {
    fn backend(&self) -> DbBackend {
        DbBackend::Postgres
    }

    fn connection_string(&self) -> String {
        mask_credentials(&self.connection_url)
    }

    /// Double-quote, preserving case.
    fn format_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name)
    }

    fn build_select_query(&self, schema: &str, table: &str) -> String {
        format!(
            "SELECT * FROM {}.{}",
            self.format_identifier(schema),
            self.format_identifier(table)
        )
    }

    async fn get_all_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT column_name
                FROM information_schema.columns
                WHERE table_schema = $1 AND table_name = $2
                ORDER BY ordinal_position
                "#,
                &[&schema, &table],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    async fn get_geometry_columns(&self, schema: &str, table: &str) -> Result<Vec<(String, i32)>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT f_geometry_column, srid
                FROM geometry_columns
                WHERE f_table_schema = $1 AND f_table_name = $2
                "#,
                &[&schema, &table],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let col: String = row.get(0);
                let srid: i32 = row.try_get(1).unwrap_or(DEFAULT_SRID);
                (col, if srid == 0 { DEFAULT_SRID } else { srid })
            })
            .collect())
    }

    async fn drop_table(&self, schema: &str, table: &str) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(self.drop_table_sql(schema, table).as_str(), &[])
            .await?;
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let client = self.pool.get().await?;
        Ok(client.execute(sql, &[]).await?)
    }

    async fn test_connection(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    /// `{a,b,c}` literal; elements rendered bare, as the array cast expects.
    fn format_array(&self, values: &[Value]) -> String {
        let parts: Vec<String> = values.iter().map(json_scalar_to_string).collect();
        format!("{{{}}}", parts.join(","))
    }

    fn array_type(&self, is_integer: bool) -> &'static str {
        if is_integer {
            "INTEGER[]"
        } else {
            "TEXT[]"
        }
    }

    fn post_write_sql(&self, schema: &str, table: &str, col: &str, dtype: &str) -> String {
        format!(
            "ALTER TABLE {}.{} ALTER COLUMN {} TYPE {} USING {}::{}",
            schema, table, col, dtype, col, dtype
        )
    }

    /// EWKT, so the text load path carries the spatial reference.
    fn geometry_to_db(&self, geom: &Bound<'_, PyAny>, srid: i32) -> Result<String> {
        let wkt: String = geom.getattr("wkt")?.extract()?;
        Ok(format!("SRID={srid};{wkt}"))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn json_scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

/// Convert a PostgreSQL column type to an Arrow DataType.
///
/// Returns `None` for types outside the canonical set; callers re-project
/// those as `::text` before fetching.
fn postgres_type_to_arrow(pg_type: &Type) -> Option<DataType> {
    match *pg_type {
        Type::BOOL => Some(DataType::Boolean),
        Type::INT2 => Some(DataType::Int16),
        Type::INT4 => Some(DataType::Int32),
        Type::INT8 => Some(DataType::Int64),
        Type::FLOAT4 => Some(DataType::Float32),
        Type::FLOAT8 => Some(DataType::Float64),
        Type::TEXT | Type::VARCHAR | Type::CHAR | Type::BPCHAR | Type::NAME => {
            Some(DataType::Utf8)
        }
        Type::BYTEA => Some(DataType::Binary),
        Type::DATE => Some(DataType::Date32),
        Type::TIMESTAMP => Some(DataType::Timestamp(TimeUnit::Microsecond, None)),
        Type::TIMESTAMPTZ => Some(DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))),
        _ => None,
    }
}

/// Re-project a query so the flagged columns come back as `text`.
///
/// The original statement runs unchanged as a subquery; columns marked for
/// casting keep their name through an alias.
fn text_cast_query(sql: &str, columns: &[(String, bool)]) -> String {
    let projection: Vec<String> = columns
        .iter()
        .map(|(name, cast)| {
            let ident = format!("\"{}\"", name);
            if *cast {
                format!("{ident}::text AS {ident}")
            } else {
                ident
            }
        })
        .collect();
    format!("SELECT {} FROM ({}) AS _q", projection.join(", "), sql)
}

/// Convert query rows to an Arrow RecordBatch following the column schema.
fn rows_to_record_batch(
    rows: &[tokio_postgres::Row],
    schema: Arc<Schema>,
) -> Result<RecordBatch> {
    let num_rows = rows.len();
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());

    for (col_idx, field) in schema.fields().iter().enumerate() {
        let array: ArrayRef = match field.data_type() {
            DataType::Boolean => {
                let mut builder = BooleanBuilder::with_capacity(num_rows);
                for row in rows {
                    builder.append_option(row.try_get::<_, Option<bool>>(col_idx)?);
                }
                Arc::new(builder.finish())
            }
            DataType::Int16 => {
                let mut builder = Int16Builder::with_capacity(num_rows);
                for row in rows {
                    builder.append_option(row.try_get::<_, Option<i16>>(col_idx)?);
                }
                Arc::new(builder.finish())
            }
            DataType::Int32 => {
                let mut builder = Int32Builder::with_capacity(num_rows);
                for row in rows {
                    builder.append_option(row.try_get::<_, Option<i32>>(col_idx)?);
                }
                Arc::new(builder.finish())
            }
            DataType::Int64 => {
                let mut builder = Int64Builder::with_capacity(num_rows);
                for row in rows {
                    builder.append_option(row.try_get::<_, Option<i64>>(col_idx)?);
                }
                Arc::new(builder.finish())
            }
            DataType::Float32 => {
                let mut builder = Float32Builder::with_capacity(num_rows);
                for row in rows {
                    builder.append_option(row.try_get::<_, Option<f32>>(col_idx)?);
                }
                Arc::new(builder.finish())
            }
            DataType::Float64 => {
                let mut builder = Float64Builder::with_capacity(num_rows);
                for row in rows {
                    builder.append_option(row.try_get::<_, Option<f64>>(col_idx)?);
                }
                Arc::new(builder.finish())
            }
            DataType::Binary => {
                let mut builder = BinaryBuilder::new();
                for row in rows {
                    builder.append_option(row.try_get::<_, Option<Vec<u8>>>(col_idx)?);
                }
                Arc::new(builder.finish())
            }
            DataType::Date32 => {
                let mut builder = Date32Builder::with_capacity(num_rows);
                let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)
                    .ok_or_else(|| ExecutorError::Internal("invalid epoch date".to_string()))?;
                for row in rows {
                    let value = row.try_get::<_, Option<NaiveDate>>(col_idx)?;
                    builder.append_option(value.map(|d| (d - epoch).num_days() as i32));
                }
                Arc::new(builder.finish())
            }
            DataType::Timestamp(TimeUnit::Microsecond, None) => {
                let mut builder = TimestampMicrosecondBuilder::with_capacity(num_rows);
                for row in rows {
                    let value = row.try_get::<_, Option<NaiveDateTime>>(col_idx)?;
                    builder.append_option(value.map(|ts| ts.and_utc().timestamp_micros()));
                }
                Arc::new(builder.finish())
            }
            DataType::Timestamp(TimeUnit::Microsecond, Some(_)) => {
                let mut builder =
                    TimestampMicrosecondBuilder::with_capacity(num_rows).with_timezone("UTC");
                for row in rows {
                    let value = row.try_get::<_, Option<DateTime<Utc>>>(col_idx)?;
                    builder.append_option(value.map(|ts| ts.timestamp_micros()));
                }
                Arc::new(builder.finish())
            }
            _ => {
                // Reached only for columns already projected as ::text
                let mut builder = StringBuilder::new();
                for row in rows {
                    let value = row.try_get::<_, Option<String>>(col_idx)?;
                    builder.append_option(value.as_deref());
                }
                Arc::new(builder.finish())
            }
        };
        arrays.push(array);
    }

    Ok(RecordBatch::try_new(schema, arrays)?)
}

/// One destination column of a COPY: wire type plus CREATE TABLE type name.
struct CopyColumn {
    name: String,
    pg_type: Type,
    ddl: &'static str,
}

fn copy_target(data_type: &DataType) -> Option<(Type, &'static str)> {
    match data_type {
        DataType::Boolean => Some((Type::BOOL, "BOOLEAN")),
        DataType::Int16 => Some((Type::INT2, "SMALLINT")),
        DataType::Int32 => Some((Type::INT4, "INTEGER")),
        DataType::Int64 => Some((Type::INT8, "BIGINT")),
        DataType::Float32 => Some((Type::FLOAT4, "REAL")),
        DataType::Float64 => Some((Type::FLOAT8, "DOUBLE PRECISION")),
        DataType::Utf8 => Some((Type::TEXT, "TEXT")),
        DataType::Binary => Some((Type::BYTEA, "BYTEA")),
        DataType::Date32 => Some((Type::DATE, "DATE")),
        DataType::Timestamp(TimeUnit::Microsecond, None) => Some((Type::TIMESTAMP, "TIMESTAMP")),
        DataType::Timestamp(TimeUnit::Microsecond, Some(_)) => {
            Some((Type::TIMESTAMPTZ, "TIMESTAMPTZ"))
        }
        _ => None,
    }
}

/// Widening cast applied before COPY so the row extractor only sees the
/// canonical type set; everything unsupported degrades to text.
fn copy_cast_type(data_type: &DataType) -> Option<DataType> {
    match data_type {
        DataType::Int8 => Some(DataType::Int16),
        DataType::UInt8 | DataType::UInt16 => Some(DataType::Int32),
        DataType::UInt32 | DataType::UInt64 => Some(DataType::Int64),
        DataType::Float16 => Some(DataType::Float32),
        DataType::LargeUtf8 => Some(DataType::Utf8),
        DataType::LargeBinary => Some(DataType::Binary),
        DataType::Timestamp(unit, tz) if *unit != TimeUnit::Microsecond => {
            Some(DataType::Timestamp(TimeUnit::Microsecond, tz.clone()))
        }
        other if copy_target(other).is_none() => Some(DataType::Utf8),
        _ => None,
    }
}

fn normalize_for_copy(
    batches: &[RecordBatch],
    schema: &Arc<Schema>,
) -> Result<(Vec<RecordBatch>, Vec<CopyColumn>)> {
    let mut fields: Vec<Field> = Vec::with_capacity(schema.fields().len());
    let mut casts: Vec<Option<DataType>> = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let target = copy_cast_type(field.data_type());
        let data_type = target.clone().unwrap_or_else(|| field.data_type().clone());
        fields.push(Field::new(field.name(), data_type, true));
        casts.push(target);
    }
    let normalized_schema = Arc::new(Schema::new(fields));

    let mut columns = Vec::with_capacity(normalized_schema.fields().len());
    for field in normalized_schema.fields() {
        let (pg_type, ddl) = copy_target(field.data_type()).ok_or_else(|| {
            ExecutorError::Database(format!(
                "Cannot bulk-load column {} of type {}",
                field.name(),
                field.data_type()
            ))
        })?;
        columns.push(CopyColumn {
            name: field.name().clone(),
            pg_type,
            ddl,
        });
    }

    let mut normalized = Vec::with_capacity(batches.len());
    for batch in batches {
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(batch.num_columns());
        for (idx, array) in batch.columns().iter().enumerate() {
            match &casts[idx] {
                Some(target) => arrays.push(cast(array, target)?),
                None => arrays.push(array.clone()),
            }
        }
        normalized.push(RecordBatch::try_new(normalized_schema.clone(), arrays)?);
    }

    Ok((normalized, columns))
}

/// Owned row values for binary COPY; each variant borrows out as `ToSql`.
enum PgValue {
    Bool(Option<bool>),
    I16(Option<i16>),
    I32(Option<i32>),
    I64(Option<i64>),
    F32(Option<f32>),
    F64(Option<f64>),
    Text(Option<String>),
    Bytes(Option<Vec<u8>>),
    Date(Option<NaiveDate>),
    Timestamp(Option<NaiveDateTime>),
    TimestampTz(Option<DateTime<Utc>>),
}

impl PgValue {
    fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            PgValue::Bool(v) => v,
            PgValue::I16(v) => v,
            PgValue::I32(v) => v,
            PgValue::I64(v) => v,
            PgValue::F32(v) => v,
            PgValue::F64(v) => v,
            PgValue::Text(v) => v,
            PgValue::Bytes(v) => v,
            PgValue::Date(v) => v,
            PgValue::Timestamp(v) => v,
            PgValue::TimestampTz(v) => v,
        }
    }
}

fn copy_row_values(batch: &RecordBatch, row: usize) -> Result<Vec<PgValue>> {
    let mut values = Vec::with_capacity(batch.num_columns());
    for (idx, array) in batch.columns().iter().enumerate() {
        let field = batch.schema_ref().field(idx).clone();
        let value = match field.data_type() {
            DataType::Boolean => PgValue::Bool(typed_value::<BooleanArray, _>(array, row, |a, i| a.value(i))),
            DataType::Int16 => PgValue::I16(typed_value::<Int16Array, _>(array, row, |a, i| a.value(i))),
            DataType::Int32 => PgValue::I32(typed_value::<Int32Array, _>(array, row, |a, i| a.value(i))),
            DataType::Int64 => PgValue::I64(typed_value::<Int64Array, _>(array, row, |a, i| a.value(i))),
            DataType::Float32 => PgValue::F32(typed_value::<Float32Array, _>(array, row, |a, i| a.value(i))),
            DataType::Float64 => PgValue::F64(typed_value::<Float64Array, _>(array, row, |a, i| a.value(i))),
            DataType::Utf8 => PgValue::Text(typed_value::<StringArray, _>(array, row, |a, i| {
                a.value(i).to_string()
            })),
            DataType::Binary => PgValue::Bytes(typed_value::<BinaryArray, _>(array, row, |a, i| {
                a.value(i).to_vec()
            })),
            DataType::Date32 => PgValue::Date(
                typed_value::<Date32Array, _>(array, row, |a, i| a.value_as_date(i)).flatten(),
            ),
            DataType::Timestamp(TimeUnit::Microsecond, None) => PgValue::Timestamp(
                typed_value::<TimestampMicrosecondArray, _>(array, row, |a, i| {
                    a.value_as_datetime(i)
                })
                .flatten(),
            ),
            DataType::Timestamp(TimeUnit::Microsecond, Some(_)) => PgValue::TimestampTz(
                typed_value::<TimestampMicrosecondArray, _>(array, row, |a, i| {
                    DateTime::from_timestamp_micros(a.value(i))
                })
                .flatten(),
            ),
            other => {
                return Err(ExecutorError::Database(format!(
                    "Unexpected column type after COPY normalization: {}",
                    other
                )))
            }
        };
        values.push(value);
    }
    Ok(values)
}

fn typed_value<A: 'static, T>(
    array: &ArrayRef,
    row: usize,
    get: impl Fn(&A, usize) -> T,
) -> Option<T> {
    let typed = array.as_any().downcast_ref::<A>()?;
    let generic = array.as_ref();
    if generic.is_null(row) {
        None
    } else {
        Some(get(typed, row))
    }
}
