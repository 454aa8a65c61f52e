pub mod database;
pub mod executor;
pub mod inference;
pub mod python;

pub use database::*;
pub use executor::*;
pub use inference::*;
