//! Start → Write → Read → End orchestration with per-stage retries, failure
//! alerts and the daily cron trigger.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::stages::{ReadStage, WriteStage};
use crate::store::ConnectionParams;
use crate::{PipelineConfig, RetryPolicy, WriteReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Start,
    Write,
    Read,
    End,
}

impl StageId {
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Start => Some(Self::Write),
            Self::Write => Some(Self::Read),
            Self::Read => Some(Self::End),
            Self::End => None,
        }
    }

    pub fn task_id(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Write => "write_prompts_to_postgres",
            Self::Read => "read_prompts_from_postgres",
            Self::End => "end",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.task_id())
    }
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub logical_date: DateTime<Utc>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            logical_date: Utc::now(),
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageOutput {
    pub write: Option<WriteReport>,
    pub verified_rows: Option<usize>,
}

#[async_trait]
pub trait Stage: Send + Sync {
    async fn run(&self, ctx: &RunContext) -> Result<StageOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Retry,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub dag_id: String,
    pub owner: String,
    pub stage: StageId,
    pub run_id: Uuid,
    pub attempt: u32,
    pub kind: AlertKind,
    pub error: String,
    pub recipients: Vec<String>,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// Hands alerts to the log pipeline; mail delivery happens downstream of it.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &Alert) -> Result<()> {
        error!(
            target: "pdl::alert",
            dag_id = %alert.dag_id,
            owner = %alert.owner,
            stage = %alert.stage,
            run_id = %alert.run_id,
            attempt = alert.attempt,
            kind = ?alert.kind,
            recipients = %alert.recipients.join(","),
            error = %alert.error,
            "pipeline alert"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: StageId,
    pub attempts: u32,
    pub output: StageOutput,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunSummary {
    pub run_id: Uuid,
    pub logical_date: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageReport>,
}

pub struct Pipeline {
    config: PipelineConfig,
    write: Box<dyn Stage>,
    read: Box<dyn Stage>,
    alerts: Box<dyn AlertSink>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        write: Box<dyn Stage>,
        read: Box<dyn Stage>,
        alerts: Box<dyn AlertSink>,
    ) -> Self {
        Self {
            config,
            write,
            read,
            alerts,
        }
    }

    /// Postgres-backed stages with log alerts.
    pub fn from_config(config: PipelineConfig, connection: ConnectionParams) -> Result<Self> {
        let write = WriteStage::from_config(&config, connection.clone())?;
        let read = ReadStage::from_config(&config, connection)?;
        Ok(Self::new(
            config,
            Box::new(write),
            Box::new(read),
            Box::<LogAlertSink>::default(),
        ))
    }

    pub fn retry_policy(&self, stage: StageId) -> RetryPolicy {
        let configured = match stage {
            StageId::Write => self.config.write_stage.retry,
            StageId::Read => self.config.read_stage.retry,
            StageId::Start | StageId::End => None,
        };
        configured.unwrap_or(self.config.default_retry)
    }

    pub async fn run_once(&self) -> Result<PipelineRunSummary> {
        self.run_with_context(RunContext::new()).await
    }

    /// Walk the stages in order; the first stage that exhausts its retries ends the run.
    pub async fn run_with_context(&self, ctx: RunContext) -> Result<PipelineRunSummary> {
        let started_at = Utc::now();
        let mut stages = Vec::new();
        let mut current = Some(StageId::Start);

        while let Some(stage) = current {
            let task: Option<&dyn Stage> = match stage {
                StageId::Write => Some(self.write.as_ref()),
                StageId::Read => Some(self.read.as_ref()),
                StageId::Start | StageId::End => None,
            };

            match task {
                Some(task) => stages.push(self.run_stage(stage, task, &ctx).await?),
                None => info!(dag_id = %self.config.dag_id, run_id = %ctx.run_id, stage = %stage, "stage reached"),
            }
            current = stage.next();
        }

        let summary = PipelineRunSummary {
            run_id: ctx.run_id,
            logical_date: ctx.logical_date,
            started_at,
            finished_at: Utc::now(),
            stages,
        };
        info!(dag_id = %self.config.dag_id, run_id = %summary.run_id, "pipeline run complete");
        Ok(summary)
    }

    async fn run_stage(&self, stage: StageId, task: &dyn Stage, ctx: &RunContext) -> Result<StageReport> {
        let policy = self.retry_policy(stage);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let span = info_span!("stage", stage = %stage, run_id = %ctx.run_id, attempt);
            match task.run(ctx).instrument(span).await {
                Ok(output) => {
                    info!(stage = %stage, run_id = %ctx.run_id, attempt, "stage succeeded");
                    return Ok(StageReport {
                        stage,
                        attempts: attempt,
                        output,
                    });
                }
                Err(err) if attempt <= policy.retries => {
                    warn!(
                        stage = %stage,
                        run_id = %ctx.run_id,
                        attempt,
                        retry_in_secs = policy.delay_secs,
                        error = %format!("{err:#}"),
                        "stage failed, retrying"
                    );
                    if self.config.email_on_retry {
                        self.alert(stage, ctx, attempt, AlertKind::Retry, &err).await;
                    }
                    tokio::time::sleep(policy.delay()).await;
                }
                Err(err) => {
                    error!(
                        stage = %stage,
                        run_id = %ctx.run_id,
                        attempt,
                        error = %format!("{err:#}"),
                        "stage failed"
                    );
                    if self.config.email_on_failure {
                        self.alert(stage, ctx, attempt, AlertKind::Failure, &err).await;
                    }
                    return Err(err.context(format!("stage {stage} failed after {attempt} attempt(s)")));
                }
            }
        }
    }

    async fn alert(
        &self,
        stage: StageId,
        ctx: &RunContext,
        attempt: u32,
        kind: AlertKind,
        err: &anyhow::Error,
    ) {
        let alert = Alert {
            dag_id: self.config.dag_id.clone(),
            owner: self.config.owner.clone(),
            stage,
            run_id: ctx.run_id,
            attempt,
            kind,
            error: format!("{err:#}"),
            recipients: self.config.alert_emails.clone(),
        };
        if let Err(send_err) = self.alerts.send(&alert).await {
            warn!(stage = %stage, run_id = %ctx.run_id, error = %send_err, "alert delivery failed");
        }
    }

    /// One job on the configured cron schedule. Missed ticks are not replayed.
    pub async fn build_scheduler(self: Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let schedule = self.config.schedule.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(schedule.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                if let Err(err) = pipeline.run_once().await {
                    error!(dag_id = %pipeline.config.dag_id, error = %format!("{err:#}"), "scheduled run failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {schedule}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}

pub async fn run_scheduler_until_ctrl_c(pipeline: Arc<Pipeline>) -> Result<()> {
    let dag_id = pipeline.config.dag_id.clone();
    let schedule = pipeline.config.schedule.clone();
    let mut sched = pipeline.build_scheduler().await?;
    sched.start().await.context("starting scheduler")?;
    info!(%dag_id, %schedule, "scheduler started");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!(%dag_id, "shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    struct FlakyStage {
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    impl FlakyStage {
        fn new(failures: u32) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Self {
                    failures,
                    calls: Arc::clone(&calls),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl Stage for FlakyStage {
        async fn run(&self, _ctx: &RunContext) -> Result<StageOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                anyhow::bail!("transient failure {call}");
            }
            Ok(StageOutput::default())
        }
    }

    #[derive(Default, Clone)]
    struct RecordingAlertSink {
        alerts: Arc<Mutex<Vec<Alert>>>,
    }

    #[async_trait]
    impl AlertSink for RecordingAlertSink {
        async fn send(&self, alert: &Alert) -> Result<()> {
            self.alerts.lock().expect("lock").push(alert.clone());
            Ok(())
        }
    }

    fn fast_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.default_retry = RetryPolicy::new(3, 0);
        config.write_stage.retry = Some(RetryPolicy::new(1, 0));
        config.read_stage.retry = Some(RetryPolicy::new(1, 0));
        config
    }

    #[test]
    fn stages_run_start_write_read_end() {
        let mut order = vec![StageId::Start];
        while let Some(next) = order.last().and_then(|s| s.next()) {
            order.push(next);
        }
        assert_eq!(
            order,
            vec![StageId::Start, StageId::Write, StageId::Read, StageId::End]
        );
    }

    #[test]
    fn stage_override_wins_over_default_policy() {
        let mut config = PipelineConfig::default();
        config.read_stage.retry = None;
        let (write, _) = FlakyStage::new(0);
        let (read, _) = FlakyStage::new(0);
        let pipeline = Pipeline::new(
            config,
            Box::new(write),
            Box::new(read),
            Box::<RecordingAlertSink>::default(),
        );

        assert_eq!(pipeline.retry_policy(StageId::Write), RetryPolicy::new(1, 60));
        assert_eq!(pipeline.retry_policy(StageId::Read), RetryPolicy::new(3, 300));
        assert_eq!(pipeline.retry_policy(StageId::Start), RetryPolicy::new(3, 300));
    }

    #[test]
    fn table_only_override_keeps_stage_retry() {
        let config = PipelineConfig::from_yaml_str("read_stage:\n  table: awesome_chatgpt_prompts\n")
            .expect("config");
        let (write, _) = FlakyStage::new(0);
        let (read, _) = FlakyStage::new(0);
        let pipeline = Pipeline::new(
            config,
            Box::new(write),
            Box::new(read),
            Box::<RecordingAlertSink>::default(),
        );

        assert_eq!(pipeline.retry_policy(StageId::Read), RetryPolicy::new(1, 60));
        assert_eq!(pipeline.retry_policy(StageId::Write), RetryPolicy::new(1, 60));
    }

    #[tokio::test]
    async fn single_failure_is_retried_without_alert() {
        let (write, write_calls) = FlakyStage::new(1);
        let (read, read_calls) = FlakyStage::new(0);
        let sink = RecordingAlertSink::default();
        let pipeline = Pipeline::new(
            fast_config(),
            Box::new(write),
            Box::new(read),
            Box::new(sink.clone()),
        );

        let summary = pipeline.run_once().await.expect("run");

        assert_eq!(write_calls.load(Ordering::SeqCst), 2);
        assert_eq!(read_calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.stages.len(), 2);
        assert_eq!(summary.stages[0].stage, StageId::Write);
        assert_eq!(summary.stages[0].attempts, 2);
        assert_eq!(summary.stages[1].stage, StageId::Read);
        assert!(sink.alerts.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_alert_once_and_skip_downstream() {
        let (write, write_calls) = FlakyStage::new(u32::MAX);
        let (read, read_calls) = FlakyStage::new(0);
        let sink = RecordingAlertSink::default();
        let pipeline = Pipeline::new(
            fast_config(),
            Box::new(write),
            Box::new(read),
            Box::new(sink.clone()),
        );

        let err = pipeline.run_once().await.expect_err("write must fail");

        assert!(format!("{err:#}").contains("write_prompts_to_postgres"));
        assert_eq!(write_calls.load(Ordering::SeqCst), 2);
        assert_eq!(read_calls.load(Ordering::SeqCst), 0);
        let alerts = sink.alerts.lock().expect("lock");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Failure);
        assert_eq!(alerts[0].stage, StageId::Write);
        assert_eq!(alerts[0].attempt, 2);
        assert_eq!(alerts[0].recipients, vec!["alert@airflow.com"]);
    }

    #[tokio::test]
    async fn missing_override_uses_default_retries_and_retry_alerts() {
        let mut config = fast_config();
        config.read_stage.retry = None;
        config.email_on_retry = true;
        let (write, _) = FlakyStage::new(0);
        let (read, read_calls) = FlakyStage::new(3);
        let sink = RecordingAlertSink::default();
        let pipeline = Pipeline::new(config, Box::new(write), Box::new(read), Box::new(sink.clone()));

        let summary = pipeline.run_once().await.expect("run");

        assert_eq!(read_calls.load(Ordering::SeqCst), 4);
        assert_eq!(summary.stages[1].attempts, 4);
        let alerts = sink.alerts.lock().expect("lock");
        assert_eq!(alerts.len(), 3);
        assert!(alerts.iter().all(|a| a.kind == AlertKind::Retry));
    }

    #[tokio::test]
    async fn failure_alerts_can_be_disabled() {
        let mut config = fast_config();
        config.email_on_failure = false;
        let (write, _) = FlakyStage::new(u32::MAX);
        let (read, _) = FlakyStage::new(0);
        let sink = RecordingAlertSink::default();
        let pipeline = Pipeline::new(config, Box::new(write), Box::new(read), Box::new(sink.clone()));

        assert!(pipeline.run_once().await.is_err());
        assert!(sink.alerts.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn scheduler_accepts_daily_cron_and_rejects_garbage() {
        let (write, _) = FlakyStage::new(0);
        let (read, _) = FlakyStage::new(0);
        let pipeline = Arc::new(Pipeline::new(
            PipelineConfig::default(),
            Box::new(write),
            Box::new(read),
            Box::<LogAlertSink>::default(),
        ));
        assert!(pipeline.build_scheduler().await.is_ok());

        let mut config = PipelineConfig::default();
        config.schedule = "every day please".to_string();
        let (write, _) = FlakyStage::new(0);
        let (read, _) = FlakyStage::new(0);
        let pipeline = Arc::new(Pipeline::new(
            config,
            Box::new(write),
            Box::new(read),
            Box::<LogAlertSink>::default(),
        ));
        assert!(pipeline.build_scheduler().await.is_err());
    }
}
