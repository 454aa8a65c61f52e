pub mod adapter;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod validation;

pub use adapter::*;
pub use error::{ExecutorError, Result};
pub use models::*;
pub use services::*;
pub use validation::*;
