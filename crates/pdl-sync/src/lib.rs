//! Prompt load pipeline: dedup writer, verifier, stages and daily orchestration.

mod orchestrator;
mod stages;
mod store;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use pdl_core::{DatasetRow, PromptRecord, TableName};
use pdl_storage::{read_rows_file, DatasetFetcher, DatasetSource, FetchError, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

pub use orchestrator::{
    run_scheduler_until_ctrl_c, Alert, AlertKind, AlertSink, LogAlertSink, Pipeline,
    PipelineRunSummary, RunContext, Stage, StageId, StageOutput, StageReport,
};
pub use stages::{verify_only, ReadStage, WriteStage};
pub use store::{ConnectionParams, PgPromptStore, PromptStore, StoreError};

pub const CRATE_NAME: &str = "pdl-sync";

pub const DEFAULT_CONFIG_FILE: &str = "pipeline.yaml";
pub const DEFAULT_DOWNLOAD_PATH: &str = "/tmp/awesome_chatgpt_prompts.json";
pub const DEFAULT_PREVIEW_ROWS: usize = 10;
/// Retry policy a stage gets unless its config block says otherwise.
pub const STAGE_RETRY: RetryPolicy = RetryPolicy::new(1, 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay_secs: u64,
}

impl RetryPolicy {
    pub const fn new(retries: u32, delay_secs: u64) -> Self {
        Self {
            retries,
            delay_secs,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Per-stage overrides. A block that omits `retry` keeps [`STAGE_RETRY`];
/// `retry: null` hands the stage to the pipeline's `default_retry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub table: Option<TableName>,
    pub retry: Option<RetryPolicy>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            table: None,
            retry: Some(STAGE_RETRY),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub dag_id: String,
    pub owner: String,
    /// Six-field cron expression (seconds first).
    pub schedule: String,
    pub email_on_failure: bool,
    pub email_on_retry: bool,
    pub alert_emails: Vec<String>,
    pub default_retry: RetryPolicy,
    pub write_stage: StageConfig,
    pub read_stage: StageConfig,
    pub dataset: DatasetSource,
    pub download_path: PathBuf,
    pub preview_rows: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dag_id: "chatgpt_prompts_to_postgres".to_string(),
            owner: "airflow".to_string(),
            schedule: "0 0 0 * * *".to_string(),
            email_on_failure: true,
            email_on_retry: false,
            alert_emails: vec!["alert@airflow.com".to_string()],
            default_retry: RetryPolicy::new(3, 300),
            write_stage: StageConfig {
                table: Some(TableName::awesome_chatgpt_prompts()),
                ..Default::default()
            },
            read_stage: StageConfig {
                table: Some(TableName::chatgpt_prompts()),
                ..Default::default()
            },
            dataset: DatasetSource::default(),
            download_path: PathBuf::from(DEFAULT_DOWNLOAD_PATH),
            preview_rows: DEFAULT_PREVIEW_ROWS,
            http_timeout_secs: 20,
            user_agent: "pdl-bot/0.1".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing pipeline config")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Explicit path, then `PDL_CONFIG`, then `./pipeline.yaml` if present, then defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Ok(path) = std::env::var("PDL_CONFIG") {
            return Self::from_file(Path::new(&path));
        }
        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Self::from_file(local);
        }
        Ok(Self::default())
    }

    pub fn write_table(&self) -> TableName {
        self.write_stage
            .table
            .clone()
            .unwrap_or_else(TableName::awesome_chatgpt_prompts)
    }

    pub fn read_table(&self) -> TableName {
        self.read_stage
            .table
            .clone()
            .unwrap_or_else(TableName::chatgpt_prompts)
    }

    pub fn dataset_fetcher(&self) -> Result<DatasetFetcher> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        })?;
        Ok(DatasetFetcher::new(http, self.dataset.clone()))
    }
}

/// Fatal outcome of a load. Warn-and-continue conditions never surface here.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub fetched: usize,
    pub inserted: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadReport {
    pub row_count: usize,
    pub preview: Vec<PromptRecord>,
}

/// Insert each row whose exact prompt text is not yet in `table`.
///
/// One count query and at most one insert per row. Any store error stops the
/// loop; the caller decides whether to roll back.
pub async fn dedup_insert<S: PromptStore + ?Sized>(
    store: &mut S,
    table: &TableName,
    rows: &[DatasetRow],
) -> Result<WriteReport, StoreError> {
    let mut report = WriteReport {
        fetched: rows.len(),
        ..Default::default()
    };

    for row in rows {
        if store.count_prompt(table, &row.prompt).await? == 0 {
            store.insert_prompt(table, row).await?;
            report.inserted += 1;
        } else {
            report.skipped += 1;
        }
    }

    info!(
        %table,
        fetched = report.fetched,
        skipped = report.skipped,
        "{} rows inserted into {table}",
        report.inserted
    );
    Ok(report)
}

pub async fn verify_table<S: PromptStore + ?Sized>(
    store: &mut S,
    table: &TableName,
    preview_rows: usize,
) -> Result<ReadReport, StoreError> {
    let rows = store.fetch_all(table).await?;
    let row_count = rows.len();
    info!(%table, "row data count: {row_count}");

    let preview: Vec<PromptRecord> = rows.into_iter().take(preview_rows).collect();
    for (idx, record) in preview.iter().enumerate() {
        info!(
            %table,
            "row {}: ({}, {}, {})",
            idx + 1,
            record.id,
            column_text(record.prompt.as_deref()),
            column_text(record.category.as_deref())
        );
    }
    Ok(ReadReport { row_count, preview })
}

fn column_text(value: Option<&str>) -> String {
    match value {
        Some(text) => format!("{text:?}"),
        None => "NULL".to_string(),
    }
}

/// Direct variant: a failed fetch ends the load before the table is touched.
pub async fn load_direct<S: PromptStore + ?Sized>(
    fetcher: &DatasetFetcher,
    store: &mut S,
    table: &TableName,
    run_id: Uuid,
) -> Result<WriteReport, LoadError> {
    let rows = match fetcher.fetch_rows(run_id).await {
        Ok(rows) => rows,
        Err(err) => {
            error!(%run_id, error = %err, "cannot load dataset");
            return Err(err.into());
        }
    };

    if let Err(err) = store.create_table(table).await {
        warn!(%run_id, %table, error = %err, "table creation failed, continuing");
    }

    Ok(dedup_insert(store, table, &rows).await?)
}

/// Download variant: a failed download is logged and the previously written
/// file, if any, is loaded instead. A missing or unreadable file is fatal.
pub async fn load_downloaded<S: PromptStore + ?Sized>(
    fetcher: &DatasetFetcher,
    store: &mut S,
    table: &TableName,
    path: &Path,
    run_id: Uuid,
) -> Result<WriteReport, LoadError> {
    if let Err(err) = fetcher.download_to(run_id, path).await {
        error!(%run_id, path = %path.display(), error = %err, "error while downloading the dataset file");
    }

    if let Err(err) = store.create_table(table).await {
        warn!(%run_id, %table, error = %err, "table creation failed, continuing");
    }

    let rows = read_rows_file(path).await?;
    Ok(dedup_insert(store, table, &rows).await?)
}

/// Commit on success, roll back on failure, and release the store either way.
pub async fn finish<S, T>(store: &mut S, result: Result<T, LoadError>) -> Result<T, LoadError>
where
    S: PromptStore + ?Sized,
{
    match result {
        Ok(value) => {
            let committed = store.commit().await;
            store.close().await;
            committed?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = store.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            store.close().await;
            Err(err)
        }
    }
}
