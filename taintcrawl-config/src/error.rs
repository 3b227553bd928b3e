use std::path::PathBuf;

use thiserror::Error;

/// Failures while resolving configuration inputs from the environment.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read secret file {path}: {source}")]
    SecretFileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database url is invalid: {source}")]
    InvalidDatabaseUrl {
        #[source]
        source: url::ParseError,
    },
    #[error("database username `{username}` cannot be encoded into a url")]
    InvalidDatabaseUsername { username: String },
    #[error("database password cannot be encoded into a url")]
    InvalidDatabasePassword,
}

/// Settings that would make the scheduler misbehave.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error("scheduler.batch_limit must be at least 1")]
    ZeroBatchLimit,
    #[error("max_time.{field} must be greater than zero")]
    ZeroBudget { field: &'static str },
}
