//! Program Updater Library
//!
//! Transactional self-update engine: downloads every file a manifest lists,
//! verifies it, swaps it in with a backup, and rolls the whole batch back if
//! anything goes wrong.

pub mod config;
pub mod manifest;
pub mod orchestrator;
pub mod process;
pub mod report;
pub mod shutdown;
pub mod transaction;
pub mod transport;
pub mod utils;
pub mod verify;

// Re-export commonly used types
pub use config::Config;
pub use manifest::{FileTarget, Manifest};
pub use orchestrator::{OrchestratorOptions, RunState, RunSummary, UpdateOrchestrator};
pub use utils::errors::{Result, UpdateError};
