pub mod config;
pub mod error;
pub mod log_sanitize;
pub mod orchestrator;
pub mod pm;
pub mod recipe;
pub mod repoindex;
pub mod resolver;

pub use error::{Error, Result};
