use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::block::BlockGenerator;
use crate::error::ErrorEvent;
use crate::storage::SharedStorage;

/// Globally unique identity of a writer, part of every key it writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WriterId(String);

impl WriterId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WriterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Counters shared by all the writers of one run.
///
/// Writers only ever increment, the supervisor only reads. Each run owns its own instance, so
/// independent runs in the same process never see each other's counts.
#[derive(Debug, Default)]
pub struct Stats {
    blocks: AtomicU64,
}

impl Stats {
    pub fn record_block(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of blocks successfully written so far.
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }
}

/// Writes blocks of random data in a loop until cancelled.
pub struct Writer {
    id: WriterId,
    // Number of insertions attempted so far, also the block number of the last attempt.
    sequence: u64,
    generator: BlockGenerator,
    storage: SharedStorage,
    stats: Arc<Stats>,
    errors: mpsc::Sender<ErrorEvent>,
    limit: Option<u64>,
}

impl Writer {
    pub fn new(
        generator: BlockGenerator,
        storage: SharedStorage,
        stats: Arc<Stats>,
        errors: mpsc::Sender<ErrorEvent>,
    ) -> Self {
        Self {
            id: WriterId::new(),
            sequence: 0,
            generator,
            storage,
            stats,
            errors,
            limit: None,
        }
    }

    /// Stops the writer after `limit` attempts instead of running until cancelled.
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    #[cfg(test)]
    pub fn id(&self) -> &WriterId {
        &self.id
    }

    /// Runs the insertion loop and returns the number of attempts made.
    ///
    /// A failed insertion is never retried: its error goes to the supervisor and the next
    /// attempt uses a fresh block number, so stored block numbers may have gaps but always
    /// increase. The loop stops when `cancel` fires, when the limit is reached, or when the
    /// supervisor has dropped the error channel.
    pub async fn run(mut self, cancel: CancellationToken) -> u64 {
        tracing::debug!(writer = %self.id, "Starting writer");
        loop {
            if cancel.is_cancelled() || self.limit.is_some_and(|limit| self.sequence >= limit) {
                break;
            }

            let block_id = self.generator.block_id();
            let block = self.generator.block();
            // We bump the sequence before the attempt, so a failed insertion leaves a gap
            // but the block numbers sent to storage never repeat.
            self.sequence += 1;
            let result = self
                .storage
                .insert(block_id, self.id.as_str(), self.sequence, block)
                .await;

            // Every attempt ends in exactly one of these two arms: either the shared counter is
            // incremented or an error event is produced, never both.
            match result {
                Ok(()) => self.stats.record_block(),
                Err(cause) => {
                    let event = ErrorEvent {
                        writer: self.id.clone(),
                        cause,
                    };
                    // Waits while the channel is full, this is where errors apply backpressure.
                    // An event that fits in the channel is always sent, even once cancelled.
                    // If we are cancelled while the send is still blocked, the event is dropped:
                    // that attempt is then neither counted nor reported.
                    tokio::select! {
                        biased;
                        sent = self.errors.send(event) => {
                            if sent.is_err() {
                                tracing::debug!(writer = %self.id, "Error channel closed");
                                break;
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }
        tracing::debug!(writer = %self.id, attempts = self.sequence, "Writer stopped");
        self.sequence
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use hashbrown::HashSet;

    use super::*;
    use crate::block::BlockSize;
    use crate::storage::{FailureMode, MemoryStorage, Storage};

    /// Records every call and fails every other one.
    #[derive(Debug, Default)]
    struct RecordingStorage {
        calls: Mutex<Vec<(i64, String, u64, usize)>>,
    }

    #[async_trait::async_trait]
    impl Storage for RecordingStorage {
        async fn insert(
            &self,
            block_id: i64,
            writer_id: &str,
            sequence: u64,
            payload: Vec<u8>,
        ) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push((
                block_id,
                writer_id.to_string(),
                sequence,
                payload.len(),
            ));
            if sequence % 2 == 0 {
                anyhow::bail!("rejected block number {sequence}");
            }
            Ok(())
        }
    }

    fn generator() -> BlockGenerator {
        BlockGenerator::new(BlockSize::new(16, 32).unwrap())
    }

    #[test]
    fn writer_ids_are_distinct() {
        let ids: HashSet<_> = (0..1_000).map(|_| WriterId::new()).collect();
        assert_eq!(ids.len(), 1_000);
    }

    #[tokio::test]
    async fn sequences_increase_across_failures() {
        let storage = Arc::new(RecordingStorage::default());
        let stats = Arc::new(Stats::default());
        let (errors_tx, mut errors_rx) = mpsc::channel(100);
        let writer = Writer::new(generator(), storage.clone(), stats.clone(), errors_tx)
            .with_limit(Some(20));
        let id = writer.id().clone();

        let attempts = writer.run(CancellationToken::new()).await;
        assert_eq!(attempts, 20);

        let calls = storage.calls.lock().unwrap();
        let sequences: Vec<u64> = calls.iter().map(|(_, _, sequence, _)| *sequence).collect();
        assert_eq!(sequences, (1..=20).collect::<Vec<_>>());
        assert!(calls.iter().all(|(_, writer, _, _)| writer == id.as_str()));
        assert!(calls
            .iter()
            .all(|(block_id, _, _, len)| *block_id >= 0 && (16..32).contains(len)));

        // Every attempt is either counted or reported, never both.
        assert_eq!(stats.blocks(), 10);
        let mut failed = 0;
        while let Ok(event) = errors_rx.try_recv() {
            assert_eq!(event.writer, id);
            failed += 1;
        }
        assert_eq!(failed, 10);
    }

    #[tokio::test]
    async fn stops_when_cancelled() {
        let storage = MemoryStorage::default().with_latency(Duration::from_millis(1));
        let stats = Arc::new(Stats::default());
        let (errors_tx, _errors_rx) = mpsc::channel(1);
        let writer = Writer::new(generator(), Arc::new(storage.clone()), stats.clone(), errors_tx);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(writer.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let attempts = task.await.unwrap();
        assert!(attempts > 0);
        assert_eq!(attempts, storage.attempts());
        assert_eq!(stats.blocks(), storage.blocks());
    }

    #[tokio::test]
    async fn cancellation_releases_a_blocked_send() {
        let storage = MemoryStorage::default().with_failures(FailureMode::Always);
        let (errors_tx, mut errors_rx) = mpsc::channel(1);
        let stats = Arc::new(Stats::default());
        let writer = Writer::new(generator(), Arc::new(storage.clone()), stats.clone(), errors_tx);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(writer.run(cancel.clone()));
        // The first error fills the channel, the second send waits for a receiver that never drains.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(storage.attempts(), 2);
        cancel.cancel();

        assert_eq!(task.await.unwrap(), 2);
        // Only the event that fitted in the channel was delivered, the blocked one was dropped.
        assert!(errors_rx.try_recv().is_ok());
        assert!(errors_rx.try_recv().is_err());
        assert_eq!(stats.blocks(), 0);
    }

    #[tokio::test]
    async fn stops_when_the_channel_closes() {
        let storage = MemoryStorage::default().with_failures(FailureMode::Always);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        drop(errors_rx);
        let writer = Writer::new(
            generator(),
            Arc::new(storage),
            Arc::new(Stats::default()),
            errors_tx,
        );

        assert_eq!(writer.run(CancellationToken::new()).await, 1);
    }
}
