//! Library inference from model source code.
//!
//! The model's `def model(dbt: <Type>, ...)` annotation names the dataframe
//! library it expects. Parsing goes through Python's own `ast` module so the
//! answer matches what the interpreter will see; a regex scan only covers
//! source the parser rejects.

use std::sync::LazyLock;

use pyo3::prelude::*;
use regex::Regex;
use tracing::debug;

use crate::error::Result;
use crate::services::executor::library_for_type;

static MODEL_SIGNATURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"def\s+model\s*\(\s*\w+\s*:\s*([A-Za-z_][\w\.]*)")
        .unwrap_or_else(|e| panic!("invalid model signature pattern: {e}"))
});

/// Infer the dataframe library a model targets from its `model` function's
/// first-parameter annotation. Returns `None` when the annotation is absent
/// or not registered.
pub fn infer_library(code: &str) -> Result<Option<String>> {
    let type_hint = match annotation_from_ast(code)? {
        Some(hint) => Some(hint),
        None => annotation_from_regex(code),
    };
    let library = type_hint.as_deref().and_then(library_for_type);
    debug!(?type_hint, ?library, "Inferred model library");
    Ok(library)
}

fn annotation_from_ast(code: &str) -> Result<Option<String>> {
    Python::with_gil(|py| {
        let ast = py.import("ast")?;
        let tree = match ast.call_method1("parse", (code,)) {
            Ok(tree) => tree,
            // Unparseable source falls back to the regex scan.
            Err(_) => return Ok(None),
        };

        let function_def = ast.getattr("FunctionDef")?;
        for node in ast.call_method1("walk", (tree,))?.try_iter()? {
            let node = node?;
            if !node.is_instance(&function_def)? {
                continue;
            }
            let name: String = node.getattr("name")?.extract()?;
            if name != "model" {
                continue;
            }
            let args = node.getattr("args")?.getattr("args")?;
            let Ok(first) = args.get_item(0) else {
                return Ok(None);
            };
            let annotation = first.getattr("annotation")?;
            if annotation.is_none() {
                return Ok(None);
            }
            let rendered: String = ast
                .call_method1("unparse", (annotation,))?
                .extract()?;
            return Ok(Some(simple_name(&rendered)));
        }
        Ok(None)
    })
}

fn annotation_from_regex(code: &str) -> Option<String> {
    MODEL_SIGNATURE
        .captures(code)
        .and_then(|caps| caps.get(1))
        .map(|m| simple_name(m.as_str()))
}

/// Strip a dotted path down to its final segment.
fn simple_name(annotation: &str) -> String {
    annotation
        .rsplit('.')
        .next()
        .unwrap_or(annotation)
        .to_string()
}
