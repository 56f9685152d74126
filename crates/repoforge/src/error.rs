use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Fatal error taxonomy. Every variant except the one-shot install conflict
/// retry (handled by the orchestrator) aborts the whole run at the point of
/// detection; there is no partial-batch continuation.
#[derive(Error, Debug)]
pub enum Error {
    /// A required configuration setting is missing or malformed.
    #[error("config error: {0}")]
    Config(String),

    /// The recipe descriptor is missing, unreadable, or lacks a required field.
    #[error("metadata error in {path}: {msg}")]
    Metadata { path: PathBuf, msg: String },

    /// A dependency artifact that should already exist is absent; the batch
    /// order does not respect the true dependency order.
    #[error("build order violation: {0}")]
    BuildOrder(String),

    /// Package-manager invocation failed. Carries the conflicting package
    /// names observed in the prompt stream so the caller can run its single
    /// uninstall-then-reinstall cycle.
    #[error("install failed: {msg}")]
    Install { msg: String, conflicts: Vec<String> },

    /// The build child exited non-zero.
    #[error("build failed: {0}")]
    BuildExecution(String),

    /// Expected artifact absent or empty, verification hook rejected it, or
    /// a required detached signature is missing.
    #[error("verification failed: {0}")]
    BuildVerification(String),

    /// Repository index archive could not be read or rewritten.
    #[error("repository index error: {0}")]
    Index(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn install<M: Into<String>>(msg: M) -> Self {
        Error::Install {
            msg: msg.into(),
            conflicts: Vec::new(),
        }
    }
}
