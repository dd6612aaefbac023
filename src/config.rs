use std::time::Duration;

use crate::block::BlockSize;
use crate::error::ConfigError;

const ENV_PREFIX: &str = "BLOCK_WRITER";

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    // Connection target; `memory://` runs against the in-memory store.
    pub db_url: Option<String>,
    pub database: String,
    pub concurrency: usize,
    pub tolerate_errors: bool,
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
    pub min_block_bytes: usize,
    pub max_block_bytes: usize,
    // Capacity of the error channel. A full channel blocks the writer that is sending.
    pub error_buffer: usize,
    pub blocks_per_writer: Option<u64>,
    #[serde(with = "humantime_serde")]
    pub run_for: Option<Duration>,
}

impl Config {
    /// Loads the config from an optional TOML file, overridden by `BLOCK_WRITER_*` variables.
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let config = ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Checks every startup precondition. Each failure maps to its own error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency < 1 {
            return Err(ConfigError::Concurrency(self.concurrency));
        }
        self.block_size()?;
        self.target()?;
        if self.report_interval.is_zero() {
            return Err(ConfigError::ReportInterval);
        }
        if self.error_buffer < 1 {
            return Err(ConfigError::ErrorBuffer);
        }
        Ok(())
    }

    pub fn block_size(&self) -> Result<BlockSize, ConfigError> {
        BlockSize::new(self.min_block_bytes, self.max_block_bytes)
    }

    pub fn target(&self) -> Result<Target<'_>, ConfigError> {
        let url = self
            .db_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingTarget)?;
        Target::parse(url)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            db_url: None,
            database: "datablocks".to_string(),
            concurrency: 3,
            tolerate_errors: false,
            report_interval: Duration::from_secs(1),
            min_block_bytes: 256,
            max_block_bytes: 1024,
            error_buffer: 1,
            blocks_per_writer: None,
            run_for: None,
        }
    }
}

/// The storage backend selected by the `db_url` scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Postgres(&'a str),
    Memory(&'a str),
}

impl<'a> Target<'a> {
    fn parse(url: &'a str) -> Result<Self, ConfigError> {
        match url.split_once("://") {
            Some(("postgres" | "postgresql", _)) => Ok(Target::Postgres(url)),
            Some(("memory", _)) => Ok(Target::Memory(url)),
            _ => Err(ConfigError::UnsupportedTarget(url.to_string())),
        }
    }
}
