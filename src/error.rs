//! Error types for taskflow
//!
//! Exit codes:
//! - 0: Success
//! - 2: User error (bad args, bad config, unknown task)
//! - 3: Blocked (readonly task, lock contention)
//! - 4: Operation failed (io, fetch, rebuild)

use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the taskflow CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const BLOCKED: i32 = 3;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Main error type for taskflow operations
#[derive(Error, Debug)]
pub enum Error {
    // User errors (exit code 2)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Parent task not found: {0}")]
    ParentNotFound(String),

    // Blocked operations (exit code 3)
    #[error("Task is readonly: {0}")]
    ReadonlyTask(String),

    #[error("Lock acquisition failed: {0}")]
    LockFailed(PathBuf),

    // Operation failures (exit code 4)
    #[error("Parse error in {file}: {message}")]
    Parse { file: String, message: String },

    #[error("Fetch failed for calendar source {source_id}: {message}")]
    Fetch { source_id: String, message: String },

    #[error("Storage integrity error: {0}")]
    StorageIntegrity(String),

    #[error("Rebuild failed: {0}")]
    RebuildFailed(String),

    #[error("Index worker is not running")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl Error {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            // User errors
            Error::InvalidConfig(_)
            | Error::InvalidArgument(_)
            | Error::TaskNotFound(_)
            | Error::FileNotFound(_)
            | Error::ParentNotFound(_) => exit_codes::USER_ERROR,

            // Blocked
            Error::ReadonlyTask(_) | Error::LockFailed(_) => exit_codes::BLOCKED,

            // Operation failures
            Error::Parse { .. }
            | Error::Fetch { .. }
            | Error::StorageIntegrity(_)
            | Error::RebuildFailed(_)
            | Error::ChannelClosed
            | Error::Io(_)
            | Error::Json(_)
            | Error::Yaml(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::Http(_)
            | Error::Watch(_)
            | Error::Walk(_)
            | Error::Pattern(_)
            | Error::Regex(_)
            | Error::OperationFailed(_) => exit_codes::OPERATION_FAILED,
        }
    }

    /// Short machine-readable kind used in JSON output and diagnostics
    pub fn kind(&self) -> &'static str {
        match self.exit_code() {
            exit_codes::USER_ERROR => "user_error",
            exit_codes::BLOCKED => "blocked",
            _ => "operation_failed",
        }
    }
}

/// Result type alias for taskflow operations
pub type Result<T> = std::result::Result<T, Error>;

