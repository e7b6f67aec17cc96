//! Crate-wide error types.

use thiserror::Error;

use crate::job::JobId;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to spawn {command}: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no such job: {0}")]
    NotFound(JobId),

    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
