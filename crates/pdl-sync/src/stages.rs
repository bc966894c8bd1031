//! Postgres-backed write and read stages.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use pdl_core::TableName;
use pdl_storage::DatasetFetcher;
use tracing::error;
use uuid::Uuid;

use crate::orchestrator::{RunContext, Stage, StageOutput};
use crate::store::{ConnectionParams, PgPromptStore, PromptStore};
use crate::{finish, load_direct, load_downloaded, verify_table, LoadError, PipelineConfig, ReadReport};

/// Download the page to disk, then dedup-insert it into the write table.
pub struct WriteStage {
    connection: ConnectionParams,
    fetcher: DatasetFetcher,
    table: TableName,
    download_path: PathBuf,
}

impl WriteStage {
    pub fn new(
        connection: ConnectionParams,
        fetcher: DatasetFetcher,
        table: TableName,
        download_path: PathBuf,
    ) -> Self {
        Self {
            connection,
            fetcher,
            table,
            download_path,
        }
    }

    pub fn from_config(config: &PipelineConfig, connection: ConnectionParams) -> Result<Self> {
        Ok(Self::new(
            connection,
            config.dataset_fetcher()?,
            config.write_table(),
            config.download_path.clone(),
        ))
    }

    /// Stage body over an open store: download, create, read file, insert,
    /// then commit or roll back. The store is closed on return.
    pub async fn run_with_store<S: PromptStore + ?Sized>(
        &self,
        store: &mut S,
        ctx: &RunContext,
    ) -> Result<StageOutput, LoadError> {
        let result = load_downloaded(
            &self.fetcher,
            store,
            &self.table,
            &self.download_path,
            ctx.run_id,
        )
        .await;
        let write = finish(store, result).await?;
        Ok(StageOutput {
            write: Some(write),
            verified_rows: None,
        })
    }
}

#[async_trait]
impl Stage for WriteStage {
    async fn run(&self, ctx: &RunContext) -> Result<StageOutput> {
        let mut store = PgPromptStore::connect(&self.connection).await?;
        Ok(self.run_with_store(&mut store, ctx).await?)
    }
}

/// Fetch the page in memory, seed the read table, then log its contents.
pub struct ReadStage {
    connection: ConnectionParams,
    fetcher: DatasetFetcher,
    table: TableName,
    preview_rows: usize,
}

impl ReadStage {
    pub fn new(
        connection: ConnectionParams,
        fetcher: DatasetFetcher,
        table: TableName,
        preview_rows: usize,
    ) -> Self {
        Self {
            connection,
            fetcher,
            table,
            preview_rows,
        }
    }

    pub fn from_config(config: &PipelineConfig, connection: ConnectionParams) -> Result<Self> {
        Ok(Self::new(
            connection,
            config.dataset_fetcher()?,
            config.read_table(),
            config.preview_rows,
        ))
    }

    /// Stage body over an open store. A failed verification is logged and
    /// the seeded rows still commit.
    pub async fn run_with_store<S: PromptStore + ?Sized>(
        &self,
        store: &mut S,
        ctx: &RunContext,
    ) -> Result<StageOutput, LoadError> {
        let result = self.seed_and_verify(store, ctx.run_id).await;
        finish(store, result).await
    }

    async fn seed_and_verify<S: PromptStore + ?Sized>(
        &self,
        store: &mut S,
        run_id: Uuid,
    ) -> Result<StageOutput, LoadError> {
        let write = load_direct(&self.fetcher, store, &self.table, run_id).await?;
        let verified = verify_or_log(store, &self.table, self.preview_rows).await;
        Ok(StageOutput {
            write: Some(write),
            verified_rows: verified.map(|r| r.row_count),
        })
    }
}

#[async_trait]
impl Stage for ReadStage {
    async fn run(&self, ctx: &RunContext) -> Result<StageOutput> {
        let mut store = PgPromptStore::connect(&self.connection).await?;
        Ok(self.run_with_store(&mut store, ctx).await?)
    }
}

/// Verification never fails its caller; errors are logged and dropped.
async fn verify_or_log<S: PromptStore + ?Sized>(
    store: &mut S,
    table: &TableName,
    preview_rows: usize,
) -> Option<ReadReport> {
    match verify_table(store, table, preview_rows).await {
        Ok(report) => Some(report),
        Err(err) => {
            error!(%table, error = %err, "error while reading from postgres table");
            None
        }
    }
}

/// Read-only verification of an arbitrary table.
///
/// Only a failed connection is an error; query failures are logged.
pub async fn verify_only(
    connection: &ConnectionParams,
    table: &TableName,
    preview_rows: usize,
) -> Result<Option<ReadReport>> {
    let mut store = PgPromptStore::connect(connection).await?;
    let report = verify_or_log(&mut store, table, preview_rows).await;
    store.close().await;
    Ok(report)
}
