//! Helpers for moving data and code across the embedded-interpreter boundary.

use arrow::datatypes::Schema;
use arrow::pyarrow::{FromPyArrow, ToPyArrow};
use arrow::record_batch::RecordBatch;
use pyo3::prelude::*;
use pyo3::types::{PyList, PyString};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::models::ArrowTable;

/// Build a `pyarrow.Table` from Rust record batches. Zero-row tables keep
/// their schema.
pub fn table_to_pyarrow<'py>(py: Python<'py>, table: &ArrowTable) -> Result<Bound<'py, PyAny>> {
    let pyarrow = py.import("pyarrow")?;
    let schema = table.schema.to_pyarrow(py)?;
    let batches = PyList::empty(py);
    for batch in &table.batches {
        batches.append(batch.to_pyarrow(py)?)?;
    }
    Ok(pyarrow
        .getattr("Table")?
        .call_method1("from_batches", (batches, schema))?)
}

/// Decompose a `pyarrow.Table` into Rust record batches.
pub fn pyarrow_to_table(table: &Bound<'_, PyAny>) -> Result<ArrowTable> {
    let schema = Arc::new(Schema::from_pyarrow_bound(&table.getattr("schema")?)?);
    let mut batches = Vec::new();
    for batch in table.call_method0("to_batches")?.try_iter()? {
        batches.push(RecordBatch::from_pyarrow_bound(&batch?)?);
    }
    Ok(ArrowTable::new(schema, batches))
}

/// Convert a Python scalar to a JSON value for literal formatting. Containers
/// and unknown objects fall back to their string representation.
pub fn py_scalar_to_json(value: &Bound<'_, PyAny>) -> PyResult<Value> {
    if value.is_none() {
        return Ok(Value::Null);
    }
    if let Ok(b) = value.downcast::<pyo3::types::PyBool>() {
        return Ok(Value::Bool(b.is_true()));
    }
    if let Ok(i) = value.extract::<i64>() {
        return Ok(Value::from(i));
    }
    if let Ok(f) = value.extract::<f64>() {
        return Ok(Value::from(f));
    }
    if let Ok(s) = value.downcast::<PyString>() {
        return Ok(Value::String(s.to_string_lossy().into_owned()));
    }
    Ok(Value::String(value.str()?.to_string_lossy().into_owned()))
}

/// Convert a Python sequence to JSON values, element-wise.
pub fn py_sequence_to_json(seq: &Bound<'_, PyAny>) -> PyResult<Vec<Value>> {
    let mut out = Vec::new();
    for item in seq.try_iter()? {
        out.push(py_scalar_to_json(&item?)?);
    }
    Ok(out)
}

/// True when the value is a Python list or a numpy array.
pub fn is_array_like(value: &Bound<'_, PyAny>) -> bool {
    if value.downcast::<PyList>().is_ok() {
        return true;
    }
    value
        .get_type()
        .name()
        .map(|name| name.to_string_lossy() == "ndarray")
        .unwrap_or(false)
}
