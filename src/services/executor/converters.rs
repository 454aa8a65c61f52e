//! Dataframe library adapters. Each converter owns the traffic between
//! Arrow data and one Python dataframe library, plus the array-column
//! rewriting the writers need before load.

use pyo3::prelude::*;
use pyo3::types::{IntoPyDict, PyDict, PyList};
use serde_json::Value;

use crate::error::{ExecutorError, Result};
use crate::models::{ArrowTable, GeoArrowResult, GeoFormat, ReadData};
use crate::services::database::DatabaseOps;
use crate::services::python::{is_array_like, py_sequence_to_json, pyarrow_to_table, table_to_pyarrow};

use super::Converter;

/// Polars-backed converter. Arrow-native on both sides.
#[derive(Debug)]
pub struct PolarsConverter;

/// Pandas-backed converter via pyarrow's pandas bridge.
#[derive(Debug)]
pub struct PandasConverter;

/// GeoPandas-backed converter; decodes geometry sidecars into a GeoSeries.
#[derive(Debug)]
pub struct GeoPandasConverter;

impl Converter for PolarsConverter {
    fn from_arrow(&self, py: Python<'_>, data: ReadData) -> Result<Py<PyAny>> {
        let table = table_to_pyarrow(py, data.table())?;
        let polars = py.import("polars")?;
        let df = polars.call_method1("from_arrow", (table,))?;
        Ok(df.unbind())
    }

    fn prepare_array_columns<'py>(
        &self,
        py: Python<'py>,
        df: Bound<'py, PyAny>,
        ops: &dyn DatabaseOps,
    ) -> Result<(Bound<'py, PyAny>, Vec<(String, bool)>)> {
        let polars = py.import("polars")?;
        let list_type = polars.getattr("List")?;
        let schema = df.getattr("schema")?;
        let items = schema.call_method0("items")?;

        let mut array_columns = Vec::new();
        for item in items.try_iter()? {
            let item = item?;
            let name: String = item.get_item(0)?.extract()?;
            let dtype = item.get_item(1)?;
            if dtype.is_instance(&list_type)? {
                let inner = dtype.getattr("inner")?;
                let is_integer = inner
                    .call_method0("is_integer")
                    .and_then(|v| v.extract::<bool>())
                    .unwrap_or(false);
                array_columns.push((name, is_integer));
            }
        }
        if array_columns.is_empty() {
            return Ok((df, array_columns));
        }

        // Stringify list columns row by row into the backend's literal form.
        let mut out = df;
        for (name, _) in &array_columns {
            let column = out.call_method1("get_column", (name.as_str(),))?;
            let mut rendered: Vec<Option<String>> = Vec::new();
            for cell in column.try_iter()? {
                let cell = cell?;
                if cell.is_none() {
                    rendered.push(None);
                } else {
                    let values: Vec<Value> = py_sequence_to_json(&cell)?;
                    rendered.push(Some(ops.format_array(&values)));
                }
            }
            let series = polars
                .getattr("Series")?
                .call1((name.as_str(), rendered))?;
            out = out.call_method1("with_columns", (series,))?;
        }
        Ok((out, array_columns))
    }

    fn to_polars<'py>(
        &self,
        _py: Python<'py>,
        df: &Bound<'py, PyAny>,
    ) -> Result<Bound<'py, PyAny>> {
        Ok(df.clone())
    }

    fn to_pandas<'py>(
        &self,
        _py: Python<'py>,
        df: &Bound<'py, PyAny>,
    ) -> Result<Bound<'py, PyAny>> {
        Ok(df.call_method0("to_pandas")?)
    }

    fn to_arrow(&self, _py: Python<'_>, df: &Bound<'_, PyAny>) -> Result<ArrowTable> {
        let table = df.call_method0("to_arrow")?;
        pyarrow_to_table(&table)
    }
}

impl Converter for PandasConverter {
    fn from_arrow(&self, py: Python<'_>, data: ReadData) -> Result<Py<PyAny>> {
        let table = table_to_pyarrow(py, data.table())?;
        let df = table.call_method0("to_pandas")?;
        Ok(df.unbind())
    }

    fn prepare_array_columns<'py>(
        &self,
        py: Python<'py>,
        df: Bound<'py, PyAny>,
        ops: &dyn DatabaseOps,
    ) -> Result<(Bound<'py, PyAny>, Vec<(String, bool)>)> {
        prepare_pandas_array_columns(py, df, ops)
    }

    fn to_polars<'py>(
        &self,
        py: Python<'py>,
        df: &Bound<'py, PyAny>,
    ) -> Result<Bound<'py, PyAny>> {
        let polars = py.import("polars")?;
        Ok(polars.call_method1("from_pandas", (df,))?)
    }

    fn to_pandas<'py>(
        &self,
        _py: Python<'py>,
        df: &Bound<'py, PyAny>,
    ) -> Result<Bound<'py, PyAny>> {
        Ok(df.clone())
    }

    fn to_arrow(&self, py: Python<'_>, df: &Bound<'_, PyAny>) -> Result<ArrowTable> {
        pandas_to_arrow(py, df)
    }
}

impl Converter for GeoPandasConverter {
    fn from_arrow(&self, py: Python<'_>, data: ReadData) -> Result<Py<PyAny>> {
        let geo = match data {
            ReadData::Geo(geo) => geo,
            ReadData::Table(table) => GeoArrowResult {
                table,
                geometry_columns: Vec::new(),
                srid: crate::services::database::DEFAULT_SRID,
                format: GeoFormat::Wkb,
            },
        };

        let table = table_to_pyarrow(py, &geo.table)?;
        let df = table.call_method0("to_pandas")?;
        let gpd = py.import("geopandas")?;
        if geo.geometry_columns.is_empty() {
            // Models annotated with GeoDataFrame still get one, geometry or not.
            let gdf = gpd.getattr("GeoDataFrame")?.call1((df,))?;
            return Ok(gdf.unbind());
        }

        let crs = format!("EPSG:{}", geo.srid);
        let mut first_geometry: Option<String> = None;
        for column in &geo.geometry_columns {
            match geo.format {
                GeoFormat::Wkb => {
                    // Readers ship geometry as a `<col>_wkb` sidecar column.
                    let wkb_name = format!("{column}_wkb");
                    let encoded = df.get_item(wkb_name.as_str())?;
                    let series = gpd
                        .getattr("GeoSeries")?
                        .call_method1("from_wkb", (encoded,))?;
                    let series = series.call_method1("set_crs", (crs.as_str(),))?;
                    df.set_item(column.as_str(), series)?;
                    let kwargs = PyDict::new(py);
                    kwargs.set_item("columns", PyList::new(py, [wkb_name.as_str()])?)?;
                    kwargs.set_item("inplace", true)?;
                    df.call_method("drop", (), Some(&kwargs))?;
                }
                GeoFormat::GeoJson => {
                    let shapely = py.import("shapely")?;
                    let encoded = df.get_item(column.as_str())?;
                    let mut shapes: Vec<Option<Py<PyAny>>> = Vec::new();
                    for cell in encoded.try_iter()? {
                        let cell = cell?;
                        if cell.is_none() {
                            shapes.push(None);
                        } else {
                            let geom = shapely.call_method1("from_geojson", (cell,))?;
                            shapes.push(Some(geom.unbind()));
                        }
                    }
                    let series = gpd.getattr("GeoSeries")?.call(
                        (shapes,),
                        Some(&[("crs", crs.as_str())].into_py_dict(py)?),
                    )?;
                    df.set_item(column.as_str(), series)?;
                }
            }
            first_geometry.get_or_insert_with(|| column.clone());
        }

        let geometry = first_geometry.ok_or_else(|| {
            ExecutorError::Internal("geometry columns listed but none decoded".to_string())
        })?;
        let gdf = gpd.getattr("GeoDataFrame")?.call(
            (df,),
            Some(&[("geometry", geometry.as_str())].into_py_dict(py)?),
        )?;
        Ok(gdf.unbind())
    }

    fn prepare_array_columns<'py>(
        &self,
        py: Python<'py>,
        df: Bound<'py, PyAny>,
        ops: &dyn DatabaseOps,
    ) -> Result<(Bound<'py, PyAny>, Vec<(String, bool)>)> {
        prepare_pandas_array_columns(py, df, ops)
    }

    fn to_polars<'py>(
        &self,
        py: Python<'py>,
        df: &Bound<'py, PyAny>,
    ) -> Result<Bound<'py, PyAny>> {
        let polars = py.import("polars")?;
        Ok(polars.call_method1("from_pandas", (df,))?)
    }

    fn to_pandas<'py>(
        &self,
        _py: Python<'py>,
        df: &Bound<'py, PyAny>,
    ) -> Result<Bound<'py, PyAny>> {
        Ok(df.clone())
    }

    fn to_arrow(&self, py: Python<'_>, df: &Bound<'_, PyAny>) -> Result<ArrowTable> {
        pandas_to_arrow(py, df)
    }
}

/// Names of `geometry`-dtyped columns in a (Geo)pandas frame.
pub fn geometry_columns(df: &Bound<'_, PyAny>) -> Result<Vec<String>> {
    let dtypes = df.getattr("dtypes")?;
    let items = dtypes.call_method0("items")?;
    let mut columns = Vec::new();
    for item in items.try_iter()? {
        let item = item?;
        let name: String = item.get_item(0)?.extract()?;
        let dtype = item.get_item(1)?.str()?;
        if dtype.to_string_lossy() == "geometry" {
            columns.push(name);
        }
    }
    Ok(columns)
}

fn pandas_to_arrow(py: Python<'_>, df: &Bound<'_, PyAny>) -> Result<ArrowTable> {
    let pyarrow = py.import("pyarrow")?;
    let kwargs = [("preserve_index", false)].into_py_dict(py)?;
    let table = pyarrow
        .getattr("Table")?
        .call_method("from_pandas", (df,), Some(&kwargs))?;
    pyarrow_to_table(&table)
}

/// Pandas stores lists as objects, so every cell of each object column is
/// checked: one list-like cell makes it an array column, and non-list cells
/// in such a column are written as NULL. The integer flag holds only when
/// every element of every list cell is an integer.
fn prepare_pandas_array_columns<'py>(
    py: Python<'py>,
    df: Bound<'py, PyAny>,
    ops: &dyn DatabaseOps,
) -> Result<(Bound<'py, PyAny>, Vec<(String, bool)>)> {
    let object_columns: Vec<String> = {
        let kwargs = [("include", "object")].into_py_dict(py)?;
        let selected = df.call_method("select_dtypes", (), Some(&kwargs))?;
        let mut names = Vec::new();
        for column in selected.getattr("columns")?.try_iter()? {
            names.push(column?.extract()?);
        }
        names
    };

    let mut array_columns = Vec::new();
    for name in object_columns {
        let series = df.get_item(name.as_str())?;
        let mut rendered: Vec<Option<String>> = Vec::new();
        let mut found_array = false;
        let mut element_seen = false;
        let mut all_integer = true;
        for cell in series.try_iter()? {
            let cell = cell?;
            if !is_array_like(&cell) {
                rendered.push(None);
                continue;
            }
            found_array = true;
            let values: Vec<Value> = py_sequence_to_json(&cell)?;
            for value in &values {
                element_seen = true;
                if !(value.is_i64() || value.is_u64()) {
                    all_integer = false;
                }
            }
            rendered.push(Some(ops.format_array(&values)));
        }
        if !found_array {
            continue;
        }
        df.set_item(name.as_str(), rendered)?;
        array_columns.push((name, element_seen && all_integer));
    }
    Ok((df, array_columns))
}

/// Stringify geometry columns in place using the backend's load-time
/// literal form. Runs before array preparation so geometry objects are not
/// mistaken for sequences.
pub fn stringify_geometry(
    df: &Bound<'_, PyAny>,
    columns: &[String],
    srid: i32,
    ops: &dyn DatabaseOps,
) -> Result<()> {
    for column in columns {
        let series = df.get_item(column.as_str())?;
        let mut rendered: Vec<Option<String>> = Vec::new();
        for cell in series.try_iter()? {
            let cell = cell?;
            if cell.is_none() {
                rendered.push(None);
            } else {
                rendered.push(Some(ops.geometry_to_db(&cell, srid)?));
            }
        }
        df.set_item(column.as_str(), rendered)?;
    }
    Ok(())
}

/// Best-effort EPSG code from a GeoDataFrame's CRS, defaulting when unset.
pub fn dataframe_srid(df: &Bound<'_, PyAny>) -> i32 {
    let epsg = (|| -> PyResult<Option<i32>> {
        let crs = df.getattr("crs")?;
        if crs.is_none() {
            return Ok(None);
        }
        crs.call_method0("to_epsg")?.extract()
    })();
    match epsg {
        Ok(Some(code)) => code,
        _ => crate::services::database::DEFAULT_SRID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::services::database::get_db_ops;

    fn pg_ops() -> std::sync::Arc<dyn DatabaseOps> {
        let creds: Credentials = serde_json::from_value(serde_json::json!({
            "type": "postgres",
            "host": "localhost",
            "user": "u",
            "password": "p",
            "database": "d",
        }))
        .unwrap();
        get_db_ops("postgres", &creds).unwrap()
    }

    #[test]
    fn test_polars_round_trip_preserves_rows() {
        Python::with_gil(|py| {
            let polars = py.import("polars").unwrap();
            let data = PyDict::new(py);
            data.set_item("id", vec![1i64, 2, 3]).unwrap();
            data.set_item("name", vec!["a", "b", "c"]).unwrap();
            let df = polars.call_method1("DataFrame", (data,)).unwrap();

            let converter = PolarsConverter;
            let table = converter.to_arrow(py, &df).unwrap();
            assert_eq!(table.num_rows(), 3);

            let back = converter
                .from_arrow(py, ReadData::Table(table))
                .unwrap()
                .into_bound(py);
            let height: usize = back.getattr("height").unwrap().extract().unwrap();
            assert_eq!(height, 3);
        });
    }

    #[test]
    fn test_pandas_array_column_detection() {
        Python::with_gil(|py| {
            let pandas = py.import("pandas").unwrap();
            let data = PyDict::new(py);
            data.set_item("id", vec![1i64, 2]).unwrap();
            let tags = PyList::new(
                py,
                [
                    PyList::new(py, ["x", "y"]).unwrap(),
                    PyList::new(py, ["z"]).unwrap(),
                ],
            )
            .unwrap();
            data.set_item("tags", tags).unwrap();
            let df = pandas.call_method1("DataFrame", (data,)).unwrap();

            let (df, columns) =
                prepare_pandas_array_columns(py, df, pg_ops().as_ref()).unwrap();
            assert_eq!(columns, vec![("tags".to_string(), false)]);
            let cell = df
                .get_item("tags")
                .unwrap()
                .getattr("iloc")
                .unwrap()
                .get_item(0)
                .unwrap();
            let rendered: String = cell.extract().unwrap();
            assert_eq!(rendered, "{x,y}");
        });
    }

    #[test]
    fn test_pandas_mixed_column_nulls_non_list_cells() {
        Python::with_gil(|py| {
            let pandas = py.import("pandas").unwrap();
            let data = PyDict::new(py);
            let vals = PyList::empty(py);
            vals.append("stray").unwrap();
            vals.append(PyList::new(py, [1i64, 2]).unwrap()).unwrap();
            data.set_item("vals", vals).unwrap();
            let df = pandas.call_method1("DataFrame", (data,)).unwrap();

            let (df, columns) =
                prepare_pandas_array_columns(py, df, pg_ops().as_ref()).unwrap();
            assert_eq!(columns, vec![("vals".to_string(), true)]);
            let iloc = df.get_item("vals").unwrap().getattr("iloc").unwrap();
            assert!(iloc.get_item(0).unwrap().is_none());
            assert_eq!(
                iloc.get_item(1).unwrap().extract::<String>().unwrap(),
                "{1,2}"
            );
        });
    }

    #[test]
    fn test_pandas_integer_flag_requires_all_elements_integral() {
        Python::with_gil(|py| {
            let pandas = py.import("pandas").unwrap();
            let data = PyDict::new(py);
            let vals = PyList::new(
                py,
                [
                    PyList::new(py, [1i64, 2]).unwrap(),
                    PyList::new(py, ["a"]).unwrap(),
                ],
            )
            .unwrap();
            data.set_item("vals", vals).unwrap();
            let df = pandas.call_method1("DataFrame", (data,)).unwrap();

            let (_, columns) =
                prepare_pandas_array_columns(py, df, pg_ops().as_ref()).unwrap();
            assert_eq!(columns, vec![("vals".to_string(), false)]);
        });
    }

    #[test]
    fn test_geopandas_frame_without_geometry_keeps_library_type() {
        Python::with_gil(|py| {
            let pandas = py.import("pandas").unwrap();
            let data = PyDict::new(py);
            data.set_item("id", vec![1i64, 2]).unwrap();
            let df = pandas.call_method1("DataFrame", (data,)).unwrap();
            let table = pandas_to_arrow(py, &df).unwrap();

            let converter = GeoPandasConverter;
            let out = converter
                .from_arrow(
                    py,
                    ReadData::Geo(GeoArrowResult {
                        table,
                        geometry_columns: Vec::new(),
                        srid: crate::services::database::DEFAULT_SRID,
                        format: GeoFormat::Wkb,
                    }),
                )
                .unwrap()
                .into_bound(py);
            let type_name = out.get_type().name().unwrap().to_string();
            assert_eq!(type_name, "GeoDataFrame");
        });
    }

    #[test]
    fn test_pandas_plain_string_columns_left_alone() {
        Python::with_gil(|py| {
            let pandas = py.import("pandas").unwrap();
            let data = PyDict::new(py);
            data.set_item("name", vec!["a", "b"]).unwrap();
            let df = pandas.call_method1("DataFrame", (data,)).unwrap();

            let (df, columns) =
                prepare_pandas_array_columns(py, df, pg_ops().as_ref()).unwrap();
            assert!(columns.is_empty());
            let cell = df
                .get_item("name")
                .unwrap()
                .getattr("iloc")
                .unwrap()
                .get_item(0)
                .unwrap();
            assert_eq!(cell.extract::<String>().unwrap(), "a");
        });
    }

    #[test]
    fn test_polars_integer_array_detection() {
        Python::with_gil(|py| {
            let polars = py.import("polars").unwrap();
            let data = PyDict::new(py);
            let ids = PyList::new(
                py,
                [
                    PyList::new(py, [1i64, 2]).unwrap(),
                    PyList::new(py, [3i64]).unwrap(),
                ],
            )
            .unwrap();
            data.set_item("ids", ids).unwrap();
            let df = polars.call_method1("DataFrame", (data,)).unwrap();

            let converter = PolarsConverter;
            let (_, columns) = converter
                .prepare_array_columns(py, df, pg_ops().as_ref())
                .unwrap();
            assert_eq!(columns, vec![("ids".to_string(), true)]);
        });
    }

    #[test]
    fn test_dataframe_srid_defaults_without_crs() {
        Python::with_gil(|py| {
            let pandas = py.import("pandas").unwrap();
            let df = pandas.call_method1("DataFrame", (PyDict::new(py),)).unwrap();
            assert_eq!(dataframe_srid(&df), 4326);
        });
    }

    #[test]
    fn test_geometry_columns_empty_for_plain_frame() {
        Python::with_gil(|py| {
            let pandas = py.import("pandas").unwrap();
            let data = PyDict::new(py);
            data.set_item("id", vec![1i64]).unwrap();
            let df = pandas.call_method1("DataFrame", (data,)).unwrap();
            assert!(geometry_columns(&df).unwrap().is_empty());
        });
    }
}
