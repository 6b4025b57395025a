// Job Scheduler - Central scheduler for background jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info};
use uuid::Uuid;

use super::DriftScanJob;
use crate::drift::{EnvironmentScanner, ScanError};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Scan error: {0}")]
    ScanError(#[from] ScanError),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// 0 disables the scheduled scan
    pub scan_interval_minutes: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            scan_interval_minutes: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: i32,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Completed,
    Failed,
    PartialFailure,
}

const MAX_EXECUTION_LOGS: usize = 100;

/// Most recent job runs, oldest first
#[derive(Default)]
pub struct JobHistory {
    logs: RwLock<Vec<JobExecutionLog>>,
}

impl JobHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, log: JobExecutionLog) {
        let mut logs = self.logs.write().await;
        logs.push(log);
        if logs.len() > MAX_EXECUTION_LOGS {
            logs.remove(0);
        }
    }

    pub async fn recent(&self) -> Vec<JobExecutionLog> {
        self.logs.read().await.clone()
    }
}

/// Run one drift scan over every environment and record the outcome
pub async fn run_drift_scan(scanner: Arc<EnvironmentScanner>, history: &JobHistory) -> JobExecutionLog {
    let started_at = Utc::now();
    info!("Running drift scan job");

    let (status, items_processed, errors) = match DriftScanJob::new(scanner).run().await {
        Ok(result) => {
            let status = if result.errors.is_empty() {
                JobStatus::Completed
            } else {
                JobStatus::PartialFailure
            };
            (status, result.environments_scanned, result.errors)
        }
        Err(e) => {
            error!("Drift scan job failed: {}", e);
            (JobStatus::Failed, 0, vec![e.to_string()])
        }
    };

    let completed_at = Utc::now();
    let log = JobExecutionLog {
        id: Uuid::new_v4(),
        job_name: "Drift Scan".to_string(),
        started_at,
        completed_at: Some(completed_at),
        status,
        items_processed,
        errors,
        duration_ms: Some((completed_at - started_at).num_milliseconds()),
    };
    history.record(log.clone()).await;
    log
}

pub struct JobScheduler {
    scheduler: TokioScheduler,
    scanner: Arc<EnvironmentScanner>,
    history: Arc<JobHistory>,
    config: JobConfig,
}

impl JobScheduler {
    pub async fn new(
        scanner: Arc<EnvironmentScanner>,
        history: Arc<JobHistory>,
        config: JobConfig,
    ) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            scanner,
            history,
            config,
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        self.schedule_drift_scan().await?;
        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_drift_scan(&self) -> JobResult<()> {
        let interval = self.config.scan_interval_minutes;
        if interval == 0 {
            info!("Scheduled drift scans are disabled");
            return Ok(());
        }

        let scanner = self.scanner.clone();
        let history = self.history.clone();

        let job = Job::new_repeated_async(Duration::from_secs(interval * 60), move |_uuid, _lock| {
            let scanner = scanner.clone();
            let history = history.clone();

            Box::pin(async move {
                run_drift_scan(scanner, &history).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled drift scan to run every {} minutes", interval);

        Ok(())
    }
}
