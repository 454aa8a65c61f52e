// Executor orchestration: one reader + one writer + one converter per
// (library, backend) pair, composed behind a process-wide registry.
pub mod converters;
pub mod readers;
pub mod writers;

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::{Arc, LazyLock, Mutex, RwLock};
use std::time::{Duration, Instant};

use pyo3::prelude::*;
use pyo3::types::{PyCFunction, PyDict, PyTuple};
use tracing::{debug, info};

use crate::config::Credentials;
use crate::error::{ExecutorError, Result};
use crate::models::{ExecutionResult, ReadData, SourceInfo};
use crate::services::database::{get_db_ops, DatabaseOps, DbContext};

/// Strategy for reading a table into Arrow format.
#[async_trait::async_trait]
pub trait Reader: Send + Sync + std::fmt::Debug {
    async fn read_arrow(&self, ctx: &DbContext, source: &SourceInfo) -> Result<ReadData>;
}

/// Strategy for persisting a dataframe. Full-replace semantics only.
#[async_trait::async_trait]
pub trait Writer: Send + Sync + std::fmt::Debug {
    async fn write(
        &self,
        ctx: &DbContext,
        df: Py<PyAny>,
        source: &SourceInfo,
        converter: &dyn Converter,
    ) -> Result<ExecutionResult>;
}

/// Strategy for converting between Arrow and one dataframe library.
pub trait Converter: Send + Sync + std::fmt::Debug {
    /// Turn a read result into the library's dataframe type, decoding any
    /// geometry sidecar.
    fn from_arrow(&self, py: Python<'_>, data: ReadData) -> Result<Py<PyAny>>;

    /// Detect list-like columns and stringify them to the backend's array
    /// literal form. Returns the rewritten frame and, per rewritten column,
    /// whether its sampled element type is integral.
    fn prepare_array_columns<'py>(
        &self,
        py: Python<'py>,
        df: Bound<'py, PyAny>,
        ops: &dyn DatabaseOps,
    ) -> Result<(Bound<'py, PyAny>, Vec<(String, bool)>)>;

    /// Lossless conversion to a Polars frame.
    fn to_polars<'py>(&self, py: Python<'py>, df: &Bound<'py, PyAny>)
        -> Result<Bound<'py, PyAny>>;

    /// Lossless conversion to a pandas frame.
    fn to_pandas<'py>(&self, py: Python<'py>, df: &Bound<'py, PyAny>)
        -> Result<Bound<'py, PyAny>>;

    /// Decompose the frame into Rust record batches for native bulk loading.
    fn to_arrow(&self, py: Python<'_>, df: &Bound<'_, PyAny>) -> Result<crate::models::ArrowTable>;
}

/// Bundle a reader, writer, and converter for a library+backend combo.
#[derive(Clone)]
#[derive(Debug)]
pub struct ExecutorConfig {
    pub reader: Arc<dyn Reader>,
    pub writer: Arc<dyn Writer>,
    pub converter: Arc<dyn Converter>,
}

impl ExecutorConfig {
    pub fn new(
        reader: Arc<dyn Reader>,
        writer: Arc<dyn Writer>,
        converter: Arc<dyn Converter>,
    ) -> Self {
        Self {
            reader,
            writer,
            converter,
        }
    }
}

type RegistryKey = (String, String);

/// Seeded with the builtin bundles on first access; `register` overwrites
/// entries thereafter. Read-only once startup registration completes.
static REGISTRY: LazyLock<RwLock<HashMap<RegistryKey, ExecutorConfig>>> =
    LazyLock::new(|| RwLock::new(builtin_registry()));

/// First-parameter annotation name -> library name, for type inference.
static TYPE_MAPPING: LazyLock<RwLock<HashMap<String, String>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

fn builtin_registry() -> HashMap<RegistryKey, ExecutorConfig> {
    use converters::{GeoPandasConverter, PandasConverter, PolarsConverter};
    use readers::{PostgresGeoReader, PostgresReader, SnowflakeGeoReader, SnowflakeReader};
    use writers::{PostgresGeoWriter, PostgresWriter, SnowflakeGeoWriter, SnowflakeWriter};

    let mut map = HashMap::new();
    let polars = Arc::new(PolarsConverter);
    let pandas = Arc::new(PandasConverter);
    let geopandas = Arc::new(GeoPandasConverter);

    let mut mapping = TYPE_MAPPING
        .write()
        .unwrap_or_else(|e| e.into_inner());
    for (library, handled_type, converter) in [
        ("polars", "PolarsDbt", polars.clone() as Arc<dyn Converter>),
        ("pandas", "PandasDbt", pandas.clone() as Arc<dyn Converter>),
        (
            "geopandas",
            "GeoPandasDbt",
            geopandas.clone() as Arc<dyn Converter>,
        ),
    ] {
        mapping.insert(handled_type.to_string(), library.to_string());
        let geo = library == "geopandas";
        let pg_reader: Arc<dyn Reader> = if geo {
            Arc::new(PostgresGeoReader)
        } else {
            Arc::new(PostgresReader)
        };
        let pg_writer: Arc<dyn Writer> = if geo {
            Arc::new(PostgresGeoWriter)
        } else {
            Arc::new(PostgresWriter)
        };
        let sf_reader: Arc<dyn Reader> = if geo {
            Arc::new(SnowflakeGeoReader)
        } else {
            Arc::new(SnowflakeReader)
        };
        let sf_writer: Arc<dyn Writer> = if geo {
            Arc::new(SnowflakeGeoWriter)
        } else {
            Arc::new(SnowflakeWriter)
        };
        map.insert(
            (library.to_string(), "postgres".to_string()),
            ExecutorConfig::new(pg_reader, pg_writer, converter.clone()),
        );
        map.insert(
            (library.to_string(), "snowflake".to_string()),
            ExecutorConfig::new(sf_reader, sf_writer, converter),
        );
    }
    map
}

/// Register an executor config for a library+backend pair, overwriting any
/// previous entry, and map the handled annotation types to the library.
pub fn register(library: &str, backend: &str, handled_types: &[&str], config: ExecutorConfig) {
    REGISTRY
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert((library.to_string(), backend.to_string()), config);
    let mut mapping = TYPE_MAPPING.write().unwrap_or_else(|e| e.into_inner());
    for t in handled_types {
        mapping.insert((*t).to_string(), library.to_string());
    }
}

/// Library name registered for a first-parameter annotation name.
pub fn library_for_type(type_hint: &str) -> Option<String> {
    // Touch the registry first so builtin mappings are seeded.
    let _ = REGISTRY.read().unwrap_or_else(|e| e.into_inner()).len();
    TYPE_MAPPING
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(type_hint)
        .cloned()
}

#[derive(Debug)]
struct ExecutorInner {
    config: ExecutorConfig,
    ctx: DbContext,
    runtime: tokio::runtime::Runtime,
    read_time: Mutex<Duration>,
    write_time: Mutex<Duration>,
}

/// Compose reader, writer, and converter to execute Python models.
///
/// One executor serves one model submission at a time; the host runs
/// concurrent models by creating one executor per model.
#[derive(Debug)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    /// Create an executor from the registry.
    pub fn create(library: &str, backend_type: &str, creds: &Credentials) -> Result<Executor> {
        let config = {
            let registry = REGISTRY.read().unwrap_or_else(|e| e.into_inner());
            match registry.get(&(library.to_string(), backend_type.to_string())) {
                Some(config) => config.clone(),
                None => {
                    let mut available: Vec<RegistryKey> = registry.keys().cloned().collect();
                    available.sort();
                    return Err(ExecutorError::UnsupportedCombination {
                        library: library.to_string(),
                        backend: backend_type.to_string(),
                        available,
                    });
                }
            }
        };

        let ops = get_db_ops(backend_type, creds)?;
        let ctx = DbContext::new(ops);
        // Database I/O is driven synchronously from the model's read/write
        // calls, so a current-thread runtime is all the bridging needs.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        debug!(library, backend = backend_type, "Created executor");
        Ok(Executor {
            inner: Arc::new(ExecutorInner {
                config,
                ctx,
                runtime,
                read_time: Mutex::new(Duration::ZERO),
                write_time: Mutex::new(Duration::ZERO),
            }),
        })
    }

    /// Read a table into a DataFrame via reader and converter.
    pub fn read_df(&self, py: Python<'_>, table_name: &str) -> Result<Py<PyAny>> {
        self.inner.read_df(py, table_name)
    }

    /// Write a DataFrame to a table via writer.
    pub fn write_df(
        &self,
        py: Python<'_>,
        table_name: &str,
        df: Py<PyAny>,
    ) -> Result<ExecutionResult> {
        self.inner.write_df(py, table_name, df)
    }

    /// Execute compiled Python model code.
    ///
    /// Runs the code in a fresh namespace, requires it to define `main`, and
    /// invokes `main(read, write)`. Per-phase timings are attributed by
    /// wrapping the two IO entry points; everything else is transform time.
    pub fn submit(&self, compiled_code: &str) -> Result<ExecutionResult> {
        *self.inner.read_time.lock().unwrap_or_else(|e| e.into_inner()) = Duration::ZERO;
        *self.inner.write_time.lock().unwrap_or_else(|e| e.into_inner()) = Duration::ZERO;

        Python::with_gil(|py| {
            let namespace = PyDict::new(py);
            let code = CString::new(compiled_code)?;
            py.run(code.as_c_str(), Some(&namespace), None)?;

            let main = namespace
                .get_item("main")?
                .filter(|obj| obj.is_callable())
                .ok_or(ExecutorError::MissingEntryPoint)?;

            let read_inner = Arc::clone(&self.inner);
            let read_fn = PyCFunction::new_closure(
                py,
                Some(c"read"),
                None,
                move |args: &Bound<'_, PyTuple>, _kwargs: Option<&Bound<'_, PyDict>>| {
                    let py = args.py();
                    let table_name: String = args.get_item(0)?.extract()?;
                    read_inner.read_df(py, &table_name).map_err(PyErr::from)
                },
            )?;

            let write_inner = Arc::clone(&self.inner);
            let write_fn = PyCFunction::new_closure(
                py,
                Some(c"write"),
                None,
                move |args: &Bound<'_, PyTuple>, _kwargs: Option<&Bound<'_, PyDict>>| {
                    let py = args.py();
                    let table_name: String = args.get_item(0)?.extract()?;
                    let df = args.get_item(1)?.unbind();
                    let result = write_inner
                        .write_df(py, &table_name, df)
                        .map_err(PyErr::from)?;
                    Ok::<_, PyErr>(result.to_py_dict(py)?.unbind())
                },
            )?;

            let start = Instant::now();
            let returned = main.call1((read_fn, write_fn))?;
            let total = start.elapsed();

            let mut result = interpret_result(&returned)?;
            let read_time = *self.inner.read_time.lock().unwrap_or_else(|e| e.into_inner());
            let write_time = *self.inner.write_time.lock().unwrap_or_else(|e| e.into_inner());
            result.read_time = read_time.as_secs_f64();
            result.write_time = write_time.as_secs_f64();
            result.transform_time = total
                .saturating_sub(read_time)
                .saturating_sub(write_time)
                .as_secs_f64();

            info!(
                rows = result.rows_affected,
                table = %result.table,
                read_s = result.read_time,
                write_s = result.write_time,
                transform_s = result.transform_time,
                "Model execution finished"
            );
            Ok(result)
        })
    }
}

impl ExecutorInner {
    fn read_df(&self, py: Python<'_>, table_name: &str) -> Result<Py<PyAny>> {
        let source = SourceInfo::parse(table_name)?;
        debug!(table = %source.full_name, "Reading table for model");
        let start = Instant::now();
        let data = py.allow_threads(|| {
            self.runtime
                .block_on(self.config.reader.read_arrow(&self.ctx, &source))
        })?;
        *self.read_time.lock().unwrap_or_else(|e| e.into_inner()) += start.elapsed();
        self.config.converter.from_arrow(py, data)
    }

    fn write_df(&self, py: Python<'_>, table_name: &str, df: Py<PyAny>) -> Result<ExecutionResult> {
        let source = SourceInfo::parse(table_name)?;
        debug!(table = %source.full_name, "Writing model result");
        let start = Instant::now();
        let result = py.allow_threads(|| {
            self.runtime.block_on(self.config.writer.write(
                &self.ctx,
                df,
                &source,
                self.config.converter.as_ref(),
            ))
        })?;
        *self.write_time.lock().unwrap_or_else(|e| e.into_inner()) += start.elapsed();
        Ok(result)
    }
}

/// Interpret a model's return value: a mapping with the result keys, or an
/// object exposing them as attributes. A bare dataframe is deliberately not
/// accepted here. It carries no row count or destination, both of which come
/// from the `write` callback, so models return what `write` hands back (or a
/// mapping of their own with the same keys).
fn interpret_result(value: &Bound<'_, PyAny>) -> Result<ExecutionResult> {
    if let Ok(dict) = value.downcast::<PyDict>() {
        let rows = dict.get_item("rows_affected")?;
        let schema = dict.get_item("schema")?;
        let table = dict.get_item("table")?;
        return match (rows, schema, table) {
            (Some(rows), Some(schema), Some(table)) => Ok(ExecutionResult::new(
                rows.extract::<u64>()
                    .map_err(|_| malformed(value))?,
                schema.extract::<String>().map_err(|_| malformed(value))?,
                table.extract::<String>().map_err(|_| malformed(value))?,
            )),
            _ => Err(malformed(value)),
        };
    }

    let has_fields = value.hasattr("rows_affected")?
        && value.hasattr("schema")?
        && value.hasattr("table")?;
    if has_fields {
        return Ok(ExecutionResult::new(
            value
                .getattr("rows_affected")?
                .extract::<u64>()
                .map_err(|_| malformed(value))?,
            value.getattr("schema")?.extract::<String>().map_err(|_| malformed(value))?,
            value.getattr("table")?.extract::<String>().map_err(|_| malformed(value))?,
        ));
    }
    Err(malformed(value))
}

fn malformed(value: &Bound<'_, PyAny>) -> ExecutorError {
    let repr = value
        .repr()
        .map(|r| r.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "<unprintable>".to_string());
    ExecutorError::MalformedResult(repr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn postgres_creds() -> Credentials {
        serde_json::from_value(serde_json::json!({
            "type": "postgres",
            "host": "localhost",
            "user": "u",
            "password": "p",
            "database": "analytics",
        }))
        .unwrap()
    }

    #[test]
    fn test_create_unregistered_combination() {
        let err = Executor::create("rust_frame", "postgres", &postgres_creds()).unwrap_err();
        match err {
            ExecutorError::UnsupportedCombination { available, .. } => {
                assert!(available.contains(&("polars".to_string(), "postgres".to_string())));
                assert!(available.contains(&("geopandas".to_string(), "snowflake".to_string())));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_builtin_registry_covers_all_pairs() {
        let registry = REGISTRY.read().unwrap();
        for library in ["polars", "pandas", "geopandas"] {
            for backend in ["postgres", "snowflake"] {
                assert!(
                    registry.contains_key(&(library.to_string(), backend.to_string())),
                    "missing bundle for {library}+{backend}"
                );
            }
        }
    }

    #[test]
    fn test_register_overwrites_existing_entry() {
        let config = {
            let registry = REGISTRY.read().unwrap();
            registry[&("polars".to_string(), "postgres".to_string())].clone()
        };
        register("polars", "postgres", &["PolarsDbt"], config.clone());
        register("polars", "postgres", &["PolarsDbt"], config);
        let registry = REGISTRY.read().unwrap();
        assert_eq!(
            registry
                .keys()
                .filter(|(l, b)| l == "polars" && b == "postgres")
                .count(),
            1
        );
    }

    #[test]
    fn test_library_for_type_builtins() {
        assert_eq!(library_for_type("PolarsDbt").as_deref(), Some("polars"));
        assert_eq!(library_for_type("PandasDbt").as_deref(), Some("pandas"));
        assert_eq!(
            library_for_type("GeoPandasDbt").as_deref(),
            Some("geopandas")
        );
        assert_eq!(library_for_type("SparkDbt"), None);
    }

    #[test]
    fn test_submit_missing_entry_point() {
        let executor = Executor::create("polars", "postgres", &postgres_creds()).unwrap();
        let err = executor.submit("x = 1\n").unwrap_err();
        assert!(matches!(err, ExecutorError::MissingEntryPoint));
    }

    #[test]
    fn test_submit_result_mapping_is_authoritative() {
        let executor = Executor::create("polars", "postgres", &postgres_creds()).unwrap();
        let code = concat!(
            "def main(read, write):\n",
            "    return {\"rows_affected\": 42, \"schema\": \"public\", \"table\": \"orders\"}\n",
        );
        let result = executor.submit(code).unwrap();
        assert_eq!(result.rows_affected, 42);
        assert_eq!(result.schema, "public");
        assert_eq!(result.table, "orders");
    }

    #[test]
    fn test_submit_malformed_result() {
        let executor = Executor::create("polars", "postgres", &postgres_creds()).unwrap();
        let err = executor.submit("def main(read, write):\n    return 7\n").unwrap_err();
        assert!(matches!(err, ExecutorError::MalformedResult(_)));
    }

    #[test]
    fn test_submit_timing_invariant() {
        let executor = Executor::create("polars", "postgres", &postgres_creds()).unwrap();
        let code = concat!(
            "import time\n",
            "def main(read, write):\n",
            "    time.sleep(0.01)\n",
            "    return {\"rows_affected\": 0, \"schema\": \"s\", \"table\": \"t\"}\n",
        );
        let result = executor.submit(code).unwrap();
        assert_eq!(result.read_time, 0.0);
        assert_eq!(result.write_time, 0.0);
        assert!(result.transform_time >= 0.01);
    }
}
