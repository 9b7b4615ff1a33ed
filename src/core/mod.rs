// Core infrastructure shared across the crate

pub mod errors;

// Re-export commonly used types
pub use errors::{BatchError, Result};
