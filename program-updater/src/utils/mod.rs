//! Utility modules for the update engine.

pub mod errors;
pub mod logger;

pub use errors::{Result, UpdateError};
