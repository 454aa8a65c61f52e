//! End-to-end submission protocol tests that need no live database: models
//! that never call read/write still exercise namespace setup, entry-point
//! lookup, result interpretation, and timing attribution.

use pymodel_executor::config::Credentials;
use pymodel_executor::error::ExecutorError;
use pymodel_executor::services::executor::Executor;

fn executor() -> Executor {
    let creds: Credentials = serde_json::from_value(serde_json::json!({
        "type": "postgres",
        "host": "localhost",
        "user": "runner",
        "password": "secret",
        "database": "analytics",
    }))
    .unwrap();
    Executor::create("pandas", "postgres", &creds).unwrap()
}

#[test]
fn model_result_round_trips_through_submit() {
    let code = concat!(
        "def main(read, write):\n",
        "    return {\"rows_affected\": 10, \"schema\": \"mart\", \"table\": \"orders\"}\n",
    );
    let result = executor().submit(code).unwrap();
    assert_eq!(result.rows_affected, 10);
    assert_eq!(result.schema, "mart");
    assert_eq!(result.table, "orders");
    assert_eq!(result.to_string(), "SELECT 10");
}

#[test]
fn result_object_with_attributes_accepted() {
    let code = concat!(
        "class Outcome:\n",
        "    rows_affected = 5\n",
        "    schema = \"public\"\n",
        "    table = \"t\"\n",
        "def main(read, write):\n",
        "    return Outcome()\n",
    );
    let result = executor().submit(code).unwrap();
    assert_eq!(result.rows_affected, 5);
}

#[test]
fn module_without_main_is_rejected() {
    let err = executor().submit("helper = lambda: 1\n").unwrap_err();
    assert!(matches!(err, ExecutorError::MissingEntryPoint));
}

#[test]
fn non_callable_main_is_rejected() {
    let err = executor().submit("main = 42\n").unwrap_err();
    assert!(matches!(err, ExecutorError::MissingEntryPoint));
}

#[test]
fn scalar_return_is_malformed() {
    let code = "def main(read, write):\n    return \"done\"\n";
    let err = executor().submit(code).unwrap_err();
    assert!(matches!(err, ExecutorError::MalformedResult(_)));
}

#[test]
fn partial_mapping_is_malformed() {
    let code = "def main(read, write):\n    return {\"rows_affected\": 1}\n";
    let err = executor().submit(code).unwrap_err();
    assert!(matches!(err, ExecutorError::MalformedResult(_)));
}

#[test]
fn model_exception_surfaces_as_python_error() {
    let code = "def main(read, write):\n    raise ValueError(\"bad model\")\n";
    let err = executor().submit(code).unwrap_err();
    match err {
        ExecutorError::Python(message) => assert!(message.contains("bad model")),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn malformed_table_reference_raises_inside_model() {
    // read() rejects single-segment references before touching the database.
    let code = concat!(
        "def main(read, write):\n",
        "    try:\n",
        "        read(\"orders\")\n",
        "    except RuntimeError:\n",
        "        return {\"rows_affected\": 0, \"schema\": \"s\", \"table\": \"t\"}\n",
        "    raise AssertionError(\"expected a failure\")\n",
    );
    let result = executor().submit(code).unwrap();
    assert_eq!(result.rows_affected, 0);
}

#[test]
fn timings_cover_the_whole_run() {
    let code = concat!(
        "import time\n",
        "def main(read, write):\n",
        "    time.sleep(0.02)\n",
        "    return {\"rows_affected\": 0, \"schema\": \"s\", \"table\": \"t\"}\n",
    );
    let result = executor().submit(code).unwrap();
    assert_eq!(result.read_time, 0.0);
    assert_eq!(result.write_time, 0.0);
    assert!(result.transform_time >= 0.02);
}

#[test]
fn submissions_reset_timing_state() {
    let executor = executor();
    let code = concat!(
        "import time\n",
        "def main(read, write):\n",
        "    time.sleep(0.01)\n",
        "    return {\"rows_affected\": 0, \"schema\": \"s\", \"table\": \"t\"}\n",
    );
    let first = executor.submit(code).unwrap();
    let second = executor.submit(code).unwrap();
    assert!(first.transform_time >= 0.01);
    assert!(second.transform_time >= 0.01);
    assert!(second.transform_time < first.transform_time + 1.0);
}
