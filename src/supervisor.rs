use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::block::{BlockGenerator, BlockSize};
use crate::config::Config;
use crate::error::{Error, ErrorEvent};
use crate::storage::SharedStorage;
use crate::writer::{Stats, Writer};

/// Owns the writer pool, the report baseline and the error policy.
#[derive(Debug)]
pub struct Supervisor {
    concurrency: usize,
    block_size: BlockSize,
    report_interval: Duration,
    error_buffer: usize,
    tolerate_errors: bool,
    blocks_per_writer: Option<u64>,
    storage: SharedStorage,
}

impl Supervisor {
    /// Validates the configuration. Nothing is spawned before this succeeds.
    pub fn new(config: &Config, storage: SharedStorage) -> Result<Self, Error> {
        // `main` already validated before bootstrapping the database. We check again here since
        // a supervisor built from any other caller must not start writers on a bad config.
        config.validate()?;
        Ok(Self {
            concurrency: config.concurrency,
            block_size: config.block_size()?,
            report_interval: config.report_interval,
            error_buffer: config.error_buffer,
            tolerate_errors: config.tolerate_errors,
            blocks_per_writer: config.blocks_per_writer,
            storage,
        })
    }

    /// Runs the writers and reports on every tick until cancelled or until every writer has
    /// finished.
    ///
    /// Under the strict policy the first insertion error drained from the channel cancels the
    /// writers and is returned. Otherwise a final report is emitted and the totals returned.
    pub async fn run(self, cancel: CancellationToken) -> Result<Summary, Error> {
        // The error channel is bounded: when it is full, a failing writer waits on its send
        // until the next tick drains it, so a storm of errors slows the writers down instead
        // of piling up in memory or being silently dropped.
        let (errors_tx, mut errors_rx) = mpsc::channel(self.error_buffer);
        let stats = Arc::new(Stats::default());
        // Cancelled by the caller, or by a fatal error without touching the caller's token.
        let stop = cancel.child_token();

        let mut writers = JoinSet::new();
        for _ in 0..self.concurrency {
            let writer = Writer::new(
                BlockGenerator::new(self.block_size),
                self.storage.clone(),
                stats.clone(),
                errors_tx.clone(),
            )
            .with_limit(self.blocks_per_writer);
            writers.spawn(writer.run(stop.clone()));
        }
        // Only the writers hold senders from here on.
        drop(errors_tx);
        tracing::info!(
            concurrency = self.concurrency,
            min_block_bytes = self.block_size.min(),
            max_block_bytes = self.block_size.max(),
            tolerate_errors = self.tolerate_errors,
            "Writers started"
        );

        let start = Instant::now();
        let mut reporter = Reporter::new(start, self.tolerate_errors);
        // We skip the ticks missed while the supervisor was held up instead of firing them back
        // to back, which would print a burst of empty reports. Skipped ticks cost nothing: the
        // next report covers the whole gap because its rate is computed from the real elapsed
        // time, never from the instant the tick was scheduled for.
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::from_std(start) + self.report_interval,
            self.report_interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks = IntervalStream::new(interval);

        loop {
            tokio::select! {
                Some(_) = ticks.next() => {
                    if let Err(event) = reporter.tick(Instant::now(), stats.blocks(), &mut errors_rx) {
                        stop.cancel();
                        return Err(event.into());
                    }
                }
                joined = writers.join_next() => match joined {
                    Some(joined) => {
                        joined?;
                    }
                    None => {
                        tracing::debug!("All writers finished");
                        break;
                    }
                },
                _ = stop.cancelled() => {
                    tracing::debug!("Run cancelled, waiting for writers");
                    break;
                }
            }
        }

        // We wait for every writer before the final report so the totals include the blocks
        // that were in flight when the run stopped.
        while let Some(joined) = writers.join_next().await {
            joined?;
        }
        if let Err(event) = reporter.tick(Instant::now(), stats.blocks(), &mut errors_rx) {
            return Err(event.into());
        }

        Ok(Summary {
            blocks: stats.blocks(),
            errors: reporter.errors,
            reports: reporter.reports,
            peak_rate: reporter.peak_rate,
            elapsed: start.elapsed(),
        })
    }
}

/// Success count at the time of the last report.
#[derive(Debug, Clone, Copy)]
struct ReportTick {
    at: Instant,
    blocks: u64,
}

/// Computes the periodic reports and applies the error policy.
#[derive(Debug)]
struct Reporter {
    last: ReportTick,
    errors: u64,
    // Number of report lines emitted so far and the highest rate any of them showed.
    reports: u64,
    peak_rate: f64,
    tolerate_errors: bool,
}

impl Reporter {
    fn new(start: Instant, tolerate_errors: bool) -> Self {
        Self {
            last: ReportTick {
                at: start,
                blocks: 0,
            },
            errors: 0,
            reports: 0,
            peak_rate: 0.0,
            tolerate_errors,
        }
    }

    /// Reports the interval ending at `now`, then drains the queued errors.
    ///
    /// The report carries the error count from before this drain.
    fn tick(
        &mut self,
        now: Instant,
        blocks: u64,
        errors_rx: &mut mpsc::Receiver<ErrorEvent>,
    ) -> Result<Report, ErrorEvent> {
        let report = Report::new(self.last, now, blocks, self.errors);
        tracing::info!("{}", report);
        self.reports += 1;
        self.peak_rate = self.peak_rate.max(report.rate);
        self.drain(errors_rx)?;
        self.last = ReportTick { at: now, blocks };
        Ok(report)
    }

    /// Receives every error already queued without waiting for more.
    ///
    /// We drain inside the tick rather than in a dedicated consumer so that the reporting loop
    /// is never blocked longer than one interval, while every error still gets surfaced.
    fn drain(&mut self, errors_rx: &mut mpsc::Receiver<ErrorEvent>) -> Result<(), ErrorEvent> {
        while let Ok(event) = errors_rx.try_recv() {
            self.errors += 1;
            if !self.tolerate_errors {
                tracing::error!("{}", event);
                return Err(event);
            }
            tracing::warn!("{}", event);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Report {
    blocks: u64,
    rate: f64,
    errors: u64,
}

impl Report {
    fn new(last: ReportTick, now: Instant, blocks: u64, errors: u64) -> Self {
        let blocks = blocks.saturating_sub(last.blocks);
        let elapsed = now.saturating_duration_since(last.at).as_secs_f64();
        let rate = if elapsed > 0.0 {
            blocks as f64 / elapsed
        } else {
            0.0
        };
        Self {
            blocks,
            rate,
            errors,
        }
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} blocks were written at {:.1}/second ({} total errors)",
            self.blocks, self.rate, self.errors
        )
    }
}

/// Totals of a run that ended without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub blocks: u64,
    pub errors: u64,
    pub reports: u64,
    /// Highest rate shown by a single report, in blocks per second.
    pub peak_rate: f64,
    pub elapsed: Duration,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let elapsed = self.elapsed.as_secs_f64();
        let rate = if elapsed > 0.0 {
            self.blocks as f64 / elapsed
        } else {
            0.0
        };
        write!(
            f,
            "Wrote {} blocks in {:.1}s ({:.1}/second, peak {:.1}/second, {} total errors)",
            self.blocks, elapsed, rate, self.peak_rate, self.errors
        )
    }
}
