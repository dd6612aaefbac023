//! Storage backed by a Postgres-wire database such as CockroachDB.

use std::str::FromStr;

use anyhow::Context;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions};
use sqlx::Connection;

use super::Storage;
use crate::error::BootstrapError;

const INSERT_BLOCK: &str =
    "INSERT INTO blocks (block_id, writer_id, block_num, raw_bytes) VALUES ($1, $2, $3, $4)";

const DATABASE_EXISTS: &str = "SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)";

const DROP_BLOCKS: &str = "DROP TABLE IF EXISTS blocks";

const CREATE_BLOCKS: &str = "
CREATE TABLE IF NOT EXISTS blocks (
    block_id BIGINT NOT NULL,
    writer_id TEXT NOT NULL,
    block_num BIGINT NOT NULL,
    raw_bytes BYTEA NOT NULL,
    PRIMARY KEY (block_id, writer_id, block_num)
)";

#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    /// Creates `database` if missing, then drops and recreates the `blocks` table in it.
    ///
    /// The returned pool holds at most `max_connections` connections, which should be one more
    /// than the number of writers so that independent writers are never serialized on the pool.
    pub async fn bootstrap(
        url: &str,
        database: &str,
        max_connections: u32,
    ) -> Result<Self, BootstrapError> {
        let options = PgConnectOptions::from_str(url).map_err(BootstrapError::Url)?;
        let target = format!("{}:{}", options.get_host(), options.get_port());
        tracing::debug!("Connecting to {}", target);

        let mut conn = PgConnection::connect_with(&options)
            .await
            .map_err(|source| BootstrapError::Connect {
                target: target.clone(),
                source,
            })?;
        let exists: bool = sqlx::query_scalar(DATABASE_EXISTS)
            .bind(database)
            .fetch_one(&mut conn)
            .await
            .map_err(BootstrapError::Schema)?;
        if !exists {
            tracing::info!("Creating database {}", database);
            let create = format!("CREATE DATABASE \"{}\"", database.replace('"', "\"\""));
            sqlx::query(&create)
                .execute(&mut conn)
                .await
                .map_err(BootstrapError::Schema)?;
        }
        // Best effort, the pool below opens its own connections.
        let _ = conn.close().await;

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options.database(database))
            .await
            .map_err(|source| BootstrapError::Connect { target, source })?;

        sqlx::query(DROP_BLOCKS)
            .execute(&pool)
            .await
            .map_err(BootstrapError::Schema)?;
        sqlx::query(CREATE_BLOCKS)
            .execute(&pool)
            .await
            .map_err(BootstrapError::Schema)?;
        tracing::info!(database, max_connections, "Table blocks recreated");

        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl Storage for PgStorage {
    async fn insert(
        &self,
        block_id: i64,
        writer_id: &str,
        sequence: u64,
        payload: Vec<u8>,
    ) -> anyhow::Result<()> {
        let block_num = i64::try_from(sequence).context("block number out of range")?;
        sqlx::query(INSERT_BLOCK)
            .bind(block_id)
            .bind(writer_id)
            .bind(block_num)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_malformed_urls() {
        let result = PgStorage::bootstrap("postgres://localhost:99999999", "datablocks", 2).await;
        assert!(matches!(result, Err(BootstrapError::Url(_))));
    }
}
