//! Pre-flight checks run before a model is submitted. Each check reports a
//! pass/fail outcome instead of erroring so the host can show all findings
//! at once.

use pyo3::prelude::*;
use serde::Serialize;
use tracing::warn;

use crate::config::Credentials;
use crate::error::Result;
use crate::services::database::get_db_ops;

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

impl ValidationResult {
    fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: "ok".to_string(),
        }
    }

    fn fail(name: &str, message: String) -> Self {
        warn!(check = name, %message, "Validation failed");
        Self {
            name: name.to_string(),
            passed: false,
            message,
        }
    }
}

/// Check that the model source parses as Python.
pub fn validate_python_syntax(code: &str) -> Result<ValidationResult> {
    let name = "python_syntax";
    Python::with_gil(|py| {
        let ast = py.import("ast")?;
        Ok(match ast.call_method1("parse", (code,)) {
            Ok(_) => ValidationResult::pass(name),
            Err(err) => ValidationResult::fail(name, err.to_string()),
        })
    })
}

/// Check that the `model` function annotates all parameters and its return
/// type. Unannotated signatures defeat library inference.
pub fn validate_type_hints(code: &str) -> Result<ValidationResult> {
    let name = "type_hints";
    Python::with_gil(|py| {
        let ast = py.import("ast")?;
        let tree = match ast.call_method1("parse", (code,)) {
            Ok(tree) => tree,
            Err(err) => return Ok(ValidationResult::fail(name, err.to_string())),
        };

        let function_def = ast.getattr("FunctionDef")?;
        for node in ast.call_method1("walk", (tree,))?.try_iter()? {
            let node = node?;
            if !node.is_instance(&function_def)? {
                continue;
            }
            let fn_name: String = node.getattr("name")?.extract()?;
            if fn_name != "model" {
                continue;
            }
            let mut missing = Vec::new();
            for arg in node.getattr("args")?.getattr("args")?.try_iter()? {
                let arg = arg?;
                if arg.getattr("annotation")?.is_none() {
                    missing.push(arg.getattr("arg")?.extract::<String>()?);
                }
            }
            if node.getattr("returns")?.is_none() {
                missing.push("return".to_string());
            }
            return Ok(if missing.is_empty() {
                ValidationResult::pass(name)
            } else {
                ValidationResult::fail(
                    name,
                    format!("model() is missing annotations for: {}", missing.join(", ")),
                )
            });
        }
        Ok(ValidationResult::fail(
            name,
            "no model() function found".to_string(),
        ))
    })
}

/// Check that the target database accepts connections with the given
/// credentials.
pub async fn validate_db_connection(creds: &Credentials) -> Result<ValidationResult> {
    let name = "db_connection";
    let ops = match get_db_ops(creds.backend_type(), creds) {
        Ok(ops) => ops,
        Err(err) => return Ok(ValidationResult::fail(name, err.to_string())),
    };
    Ok(match ops.test_connection().await {
        Ok(()) => ValidationResult {
            name: name.to_string(),
            passed: true,
            message: format!(
                "connected to {} at {}",
                ops.backend().as_str(),
                ops.connection_string()
            ),
        },
        Err(err) => ValidationResult::fail(name, err.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_syntax_passes() {
        let result = validate_python_syntax("x = 1\n").unwrap();
        assert!(result.passed);
    }

    #[test]
    fn test_invalid_syntax_fails_with_message() {
        let result = validate_python_syntax("def broken(:\n").unwrap();
        assert!(!result.passed);
        assert!(!result.message.is_empty());
    }

    #[test]
    fn test_fully_annotated_model_passes() {
        let code = concat!(
            "def model(dbt: PolarsDbt, session: Session) -> DataFrame:\n",
            "    pass\n",
        );
        assert!(validate_type_hints(code).unwrap().passed);
    }

    #[test]
    fn test_missing_annotations_named_in_message() {
        let code = "def model(dbt, session: Session):\n    pass\n";
        let result = validate_type_hints(code).unwrap();
        assert!(!result.passed);
        assert!(result.message.contains("dbt"));
        assert!(result.message.contains("return"));
    }

    #[test]
    fn test_missing_model_function_fails() {
        let result = validate_type_hints("def other():\n    pass\n").unwrap();
        assert!(!result.passed);
    }

    #[test]
    fn test_unreachable_database_reported_not_raised() {
        let creds: Credentials = serde_json::from_value(serde_json::json!({
            "type": "postgres",
            "host": "127.0.0.1",
            "port": 1,
            "user": "u",
            "password": "p",
            "database": "d",
        }))
        .unwrap();
        let result = tokio_test::block_on(validate_db_connection(&creds)).unwrap();
        assert!(!result.passed);
        assert_eq!(result.name, "db_connection");
    }
}
