/// Core Module for Sprocket
///
/// Shared infrastructure: the error taxonomy and the connection/execution
/// runtime every other component goes through.

pub mod db;
pub mod error;

// Re-export commonly used types for convenience
pub use error::{Result, SprocketError};
