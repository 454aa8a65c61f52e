//! Host-facing entry point: take a parsed model node plus compiled code,
//! resolve the dataframe library, and run the model against the target
//! warehouse.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Credentials;
use crate::error::Result;
use crate::services::executor::Executor;
use crate::services::inference::infer_library;

const DEFAULT_LIBRARY: &str = "polars";

/// Outcome of a model submission, shaped for the host's result channel.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterResponse {
    pub message: String,
    pub rows_affected: u64,
}

/// Explicit `library` config on the model node wins; otherwise the `model`
/// function's annotation decides; otherwise the default applies.
fn resolve_library(parsed_model: &Value, compiled_code: &str) -> Result<String> {
    if let Some(library) = parsed_model
        .pointer("/config/library")
        .and_then(Value::as_str)
    {
        return Ok(library.to_string());
    }
    if let Some(library) = infer_library(compiled_code)? {
        return Ok(library);
    }
    debug!(default = DEFAULT_LIBRARY, "No library configured or inferred");
    Ok(DEFAULT_LIBRARY.to_string())
}

/// Execute a Python model and report the affected row count.
pub fn submit_python_job(
    parsed_model: &Value,
    compiled_code: &str,
    creds: &Credentials,
) -> Result<AdapterResponse> {
    let library = resolve_library(parsed_model, compiled_code)?;
    info!(library, backend = creds.backend_type(), "Submitting model");

    let executor = Executor::create(&library, creds.backend_type(), creds)?;
    let result = executor.submit(compiled_code)?;

    Ok(AdapterResponse {
        message: result.to_string(),
        rows_affected: result.rows_affected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn creds() -> Credentials {
        serde_json::from_value(json!({
            "type": "postgres",
            "host": "localhost",
            "user": "u",
            "password": "p",
            "database": "d",
        }))
        .unwrap()
    }

    #[test]
    fn test_explicit_library_wins_over_annotation() {
        let model = json!({"config": {"library": "pandas"}});
        let code = "def model(dbt: PolarsDbt, session):\n    pass\n";
        assert_eq!(resolve_library(&model, code).unwrap(), "pandas");
    }

    #[test]
    fn test_annotation_used_without_config() {
        let model = json!({"config": {}});
        let code = "def model(dbt: GeoPandasDbt, session):\n    pass\n";
        assert_eq!(resolve_library(&model, code).unwrap(), "geopandas");
    }

    #[test]
    fn test_default_library() {
        let model = json!({});
        assert_eq!(
            resolve_library(&model, "def model(dbt, session):\n    pass\n").unwrap(),
            DEFAULT_LIBRARY
        );
    }

    #[test]
    fn test_submit_reports_formatted_message() {
        let model = json!({"config": {"library": "polars"}});
        let code = concat!(
            "def model(dbt, session):\n    pass\n",
            "def main(read, write):\n",
            "    return {\"rows_affected\": 1234, \"schema\": \"public\", \"table\": \"t\"}\n",
        );
        let response = submit_python_job(&model, code, &creds()).unwrap();
        assert_eq!(response.message, "SELECT 1,234");
        assert_eq!(response.rows_affected, 1234);
    }
}
