pub mod arrow;
pub mod result;
pub mod source;

pub use arrow::*;
pub use result::*;
pub use source::*;
