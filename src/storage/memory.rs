//! In-memory storage for dry runs and tests.
//!
//! Payloads are discarded after being counted. For every writer only the last accepted
//! sequence number is kept, and a write that does not advance it is rejected the same way
//! the `(block_id, writer_id, block_num)` primary key would reject a duplicate. The store is
//! [`Clone`] so tests can keep a handle for inspection while the writers share another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use hashbrown::HashMap;

use super::Storage;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureMode {
    #[default]
    Never,
    Always,
    /// Fails every n-th attempt, counted across all writers.
    EveryNth(u64),
}

#[derive(Debug, Default)]
struct Store {
    last_sequence: HashMap<String, u64>,
    blocks: u64,
    bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    store: Arc<Mutex<Store>>,
    attempts: Arc<AtomicU64>,
    latency: Duration,
    failures: FailureMode,
}

impl MemoryStorage {
    /// Builds a store from a `memory://` url, e.g. `memory://?latency_ms=5&fail_every=100`.
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let mut storage = Self::default();
        let Some((_, query)) = url.split_once('?') else {
            return Ok(storage);
        };
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let invalid = || ConfigError::MemoryOption(pair.to_string());
            let (key, value) = pair.split_once('=').ok_or_else(invalid)?;
            let value: u64 = value.parse().map_err(|_| invalid())?;
            storage = match key {
                "latency_ms" => storage.with_latency(Duration::from_millis(value)),
                "fail_every" => storage.with_failures(match value {
                    0 => FailureMode::Never,
                    1 => FailureMode::Always,
                    n => FailureMode::EveryNth(n),
                }),
                _ => return Err(invalid()),
            };
        }
        Ok(storage)
    }

    /// Delays every insertion by `latency`, emulating a network round trip.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_failures(mut self, failures: FailureMode) -> Self {
        self.failures = failures;
        self
    }
}

#[cfg(test)]
impl MemoryStorage {
    /// Number of insert calls received, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Number of blocks accepted.
    pub fn blocks(&self) -> u64 {
        self.lock().blocks
    }

    pub fn bytes(&self) -> u64 {
        self.lock().bytes
    }

    /// Number of distinct writers with at least one accepted block.
    pub fn writers(&self) -> usize {
        self.lock().last_sequence.len()
    }

    pub fn last_sequence(&self, writer_id: &str) -> Option<u64> {
        self.lock().last_sequence.get(writer_id).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn insert(
        &self,
        block_id: i64,
        writer_id: &str,
        sequence: u64,
        payload: Vec<u8>,
    ) -> anyhow::Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.failures {
            FailureMode::Never => {}
            FailureMode::Always => bail!("injected failure for block {block_id}"),
            FailureMode::EveryNth(n) if n > 0 && attempt % n == 0 => {
                bail!("injected failure for block {block_id}")
            }
            FailureMode::EveryNth(_) => {}
        }

        let mut store = self
            .store
            .lock()
            .map_err(|_| anyhow!("memory storage lock poisoned"))?;
        let last = store.last_sequence.entry_ref(writer_id).or_insert(0);
        if sequence <= *last {
            bail!("duplicate key: writer {writer_id} already wrote block number {sequence}");
        }
        *last = sequence;
        store.blocks += 1;
        store.bytes += payload.len() as u64;
        tracing::trace!(
            writer = writer_id,
            sequence,
            blocks = store.blocks,
            bytes = store.bytes,
            "Block stored"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_sequences_that_do_not_advance() {
        let storage = MemoryStorage::default();
        storage.insert(1, "a", 1, vec![0; 4]).await.unwrap();
        storage.insert(2, "a", 3, vec![0; 4]).await.unwrap();
        storage.insert(3, "b", 1, vec![0; 2]).await.unwrap();
        assert!(storage.insert(4, "a", 3, vec![]).await.is_err());
        assert!(storage.insert(5, "a", 2, vec![]).await.is_err());

        assert_eq!(storage.attempts(), 5);
        assert_eq!(storage.blocks(), 3);
        assert_eq!(storage.bytes(), 10);
        assert_eq!(storage.writers(), 2);
        assert_eq!(storage.last_sequence("a"), Some(3));
        assert_eq!(storage.last_sequence("c"), None);
    }

    #[tokio::test]
    async fn injected_failures() {
        let storage = MemoryStorage::default().with_failures(FailureMode::Always);
        assert!(storage.insert(1, "a", 1, vec![]).await.is_err());
        assert_eq!(storage.blocks(), 0);

        let storage = MemoryStorage::default().with_failures(FailureMode::EveryNth(2));
        let mut failed = 0;
        for sequence in 1..=10 {
            if storage.insert(0, "a", sequence, vec![]).await.is_err() {
                failed += 1;
            }
        }
        assert_eq!(failed, 5);
        assert_eq!(storage.blocks(), 5);
        assert_eq!(storage.attempts(), 10);
    }

    #[test]
    fn url_options() {
        let storage = MemoryStorage::from_url("memory://").unwrap();
        assert_eq!(storage.latency, Duration::ZERO);
        assert_eq!(storage.failures, FailureMode::Never);

        let storage = MemoryStorage::from_url("memory://?latency_ms=5&fail_every=100").unwrap();
        assert_eq!(storage.latency, Duration::from_millis(5));
        assert_eq!(storage.failures, FailureMode::EveryNth(100));

        let storage = MemoryStorage::from_url("memory://?fail_every=1").unwrap();
        assert_eq!(storage.failures, FailureMode::Always);

        assert!(matches!(
            MemoryStorage::from_url("memory://?latency_ms=fast"),
            Err(ConfigError::MemoryOption(option)) if option == "latency_ms=fast"
        ));
        assert!(MemoryStorage::from_url("memory://?verbose").is_err());
        assert!(MemoryStorage::from_url("memory://?retries=3").is_err());
    }

    #[tokio::test]
    async fn clones_share_the_store() {
        let storage = MemoryStorage::default();
        let handle = storage.clone();
        storage.insert(1, "a", 1, vec![1, 2, 3]).await.unwrap();
        assert_eq!(handle.blocks(), 1);
        assert_eq!(handle.attempts(), 1);
    }
}
