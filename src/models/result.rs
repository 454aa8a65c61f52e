use std::fmt;

use pyo3::prelude::*;
use pyo3::types::PyDict;
use serde::{Deserialize, Serialize};

/// Result from executing a Python model.
///
/// Doubles as the model's return contract: a model may return a mapping (or an
/// object) carrying `rows_affected`, `schema` and `table`, which the executor
/// treats as authoritative over the value produced by the write call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub rows_affected: u64,
    pub schema: String,
    pub table: String,
    /// Seconds spent inside `read` calls during the owning submission.
    #[serde(default)]
    pub read_time: f64,
    /// Seconds spent inside `write` calls during the owning submission.
    #[serde(default)]
    pub write_time: f64,
    /// Everything else: total elapsed minus read and write time.
    #[serde(default)]
    pub transform_time: f64,
}

impl ExecutionResult {
    pub fn new(rows_affected: u64, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            rows_affected,
            schema: schema.into(),
            table: table.into(),
            read_time: 0.0,
            write_time: 0.0,
            transform_time: 0.0,
        }
    }

    /// Render as a mapping for model code; a model returning this dict
    /// unchanged satisfies the result contract.
    pub fn to_py_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("rows_affected", self.rows_affected)?;
        dict.set_item("schema", &self.schema)?;
        dict.set_item("table", &self.table)?;
        Ok(dict)
    }
}

/// Mirrors a SQL engine's row-count echo for the host tool's response surface.
impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT {}", format_thousands(self.rows_affected))
    }
}

fn format_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_mirrors_row_count_echo() {
        let result = ExecutionResult::new(1234567, "public", "orders");
        assert_eq!(result.to_string(), "SELECT 1,234,567");
    }

    #[test]
    fn test_display_small_counts() {
        assert_eq!(ExecutionResult::new(0, "s", "t").to_string(), "SELECT 0");
        assert_eq!(ExecutionResult::new(999, "s", "t").to_string(), "SELECT 999");
        assert_eq!(ExecutionResult::new(1000, "s", "t").to_string(), "SELECT 1,000");
    }
}
