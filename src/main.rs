use std::fs;
use std::process::ExitCode;

use tracing::{error, info};

use pymodel_executor::adapter::submit_python_job;
use pymodel_executor::config::{load_credentials, Settings};
use pymodel_executor::validation::{validate_python_syntax, validate_type_hints};

#[tokio::main]
async fn main() -> ExitCode {
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.logging.level)),
        )
        .init();

    let Some(model_path) = std::env::args().nth(1) else {
        eprintln!("Usage: pymodel-executor <compiled_model.py>");
        return ExitCode::FAILURE;
    };

    match run(&settings, &model_path).await {
        Ok(message) => {
            println!("{message}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Model execution failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: &Settings, model_path: &str) -> anyhow::Result<String> {
    let code = fs::read_to_string(model_path)?;

    for check in [
        validate_python_syntax(&code)?,
        validate_type_hints(&code)?,
    ] {
        if check.passed {
            info!(check = %check.name, "Validation passed");
        } else {
            anyhow::bail!("validation {} failed: {}", check.name, check.message);
        }
    }

    let creds = load_credentials(
        &settings.profiles.path,
        &settings.profiles.profile,
        settings.profiles.target.as_deref(),
    )?;
    info!(backend = creds.backend_type(), "Loaded target credentials");

    // Executor drives its own runtime; keep it off the async threads.
    let parsed_model = serde_json::json!({});
    let response = tokio::task::spawn_blocking(move || {
        submit_python_job(&parsed_model, &code, &creds)
    })
    .await??;

    info!(rows = response.rows_affected, "Model complete");
    Ok(response.message)
}
