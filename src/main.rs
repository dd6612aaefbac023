//! A write-only workload that inserts blocks of random data into a database as fast as a
//! fixed pool of concurrent writers allows, reporting the throughput at a fixed interval.

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::supervisor::Supervisor;

mod block;
mod config;
mod error;
mod storage;
mod supervisor;
mod writer;

const CONFIG_FILE: &str = "block_writer.toml";

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1);
    let config = Config::new(path.as_deref().unwrap_or(CONFIG_FILE))
        .context("Error loading config")?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Validate everything before touching the database.
    config.validate().context("Invalid configuration")?;
    let storage = storage::bootstrap(&config)
        .await
        .context("Error setting up the database")?;
    let supervisor = Supervisor::new(&config, storage)?;

    let cancel = CancellationToken::new();
    let _exit_signal = {
        // Ctrl-c stops the writers and lets the supervisor print a final report.
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(_) => {
                    tracing::info!("Ctrl-c received, stopping writers");
                    cancel.cancel();
                }
                Err(err) => {
                    // Without the signal handler the run can still be stopped by killing the process.
                    tracing::warn!("Unable to listen for ctrl-c: {}", err);
                }
            }
        })
    };
    if let Some(run_for) = config.run_for {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(run_for).await;
            tracing::debug!("Run duration elapsed");
            cancel.cancel();
        });
    }

    let summary = supervisor.run(cancel).await?;
    tracing::info!("{}", summary);
    Ok(())
}
