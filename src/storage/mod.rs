use std::fmt::Debug;
use std::sync::Arc;

use crate::config::{Config, Target};
use crate::error::Error;

mod memory;
mod postgres;
pub use memory::{FailureMode, MemoryStorage};
pub use postgres::PgStorage;

pub type SharedStorage = Arc<dyn Storage>;

/// The write interface the writers depend on.
///
/// One insertion is in flight per writer at a time; implementations must accept at least
/// `concurrency` concurrent calls without serializing them.
#[async_trait::async_trait]
pub trait Storage: Debug + Send + Sync + 'static {
    async fn insert(
        &self,
        block_id: i64,
        writer_id: &str,
        sequence: u64,
        payload: Vec<u8>,
    ) -> anyhow::Result<()>;
}

/// Connects to the configured target and resets its schema. Runs once, before any writer.
pub async fn bootstrap(config: &Config) -> Result<SharedStorage, Error> {
    let storage: SharedStorage = match config.target()? {
        Target::Postgres(url) => {
            let max_connections = pool_size(config.concurrency);
            Arc::new(PgStorage::bootstrap(url, &config.database, max_connections).await?)
        }
        Target::Memory(url) => {
            let storage = MemoryStorage::from_url(url)?;
            tracing::info!(?storage, "Using in-memory storage, no data will be persisted");
            Arc::new(storage)
        }
    };
    Ok(storage)
}

/// One connection per writer plus one spare, so writers never queue behind each other.
fn pool_size(concurrency: usize) -> u32 {
    u32::try_from(concurrency.saturating_add(1)).unwrap_or(u32::MAX)
}
