use thiserror::Error;

use crate::writer::WriterId;

/// Invalid startup parameters. Always fatal, raised before any writer exists.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("value of 'concurrency' ({0}) must be greater than or equal to 1")]
    Concurrency(usize),

    #[error("value of 'max_block_bytes' ({max}) must be greater than value of 'min_block_bytes' ({min})")]
    BlockSize { min: usize, max: usize },

    #[error("'db_url' is required")]
    MissingTarget,

    #[error("unsupported 'db_url' scheme in '{0}', expected postgres://, postgresql:// or memory://")]
    UnsupportedTarget(String),

    #[error("invalid in-memory storage option '{0}', expected latency_ms=<u64> or fail_every=<u64>")]
    MemoryOption(String),

    #[error("'report_interval' must be greater than zero")]
    ReportInterval,

    #[error("'error_buffer' must be greater than or equal to 1")]
    ErrorBuffer,

    #[error(transparent)]
    Load(#[from] ::config::ConfigError),
}

/// Failure during the one-time database and schema setup.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid connection url: {0}")]
    Url(#[source] sqlx::Error),

    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to prepare schema: {0}")]
    Schema(#[source] sqlx::Error),
}

/// A single failed insertion, carried from a writer to the supervisor.
#[derive(Debug, Error)]
#[error("error running block writer {writer}: {cause:#}")]
pub struct ErrorEvent {
    pub writer: WriterId,
    #[source]
    pub cause: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Insertion(#[from] ErrorEvent),

    #[error("writer task failed: {0}")]
    Writer(#[from] tokio::task::JoinError),
}
