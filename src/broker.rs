//! Job-table backend for running a sync across processes.
//!
//! The coordinating process inserts one `sync_jobs` row per work item and polls
//! until its run has no pending or running rows. Any number of `worker`
//! processes claim rows, execute them with the same pipeline as the in-process
//! pool, and record the outcome.

use crate::db::{self, Pool};
use crate::model::{RunReport, WorkItem};
use crate::sync::WorkDistributor;
use crate::worker::{self, SyncContext};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::Row;
use std::time::Duration;
use tracing::{error, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
    Abandoned,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Abandoned => "abandoned",
            JobState::Failed => "failed",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "running" => Some(JobState::Running),
            "done" => Some(JobState::Done),
            "abandoned" => Some(JobState::Abandoned),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

/// Row counts for one run, by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunProgress {
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub abandoned: u64,
    pub failed: u64,
}

impl RunProgress {
    pub fn outstanding(&self) -> u64 {
        self.pending + self.running
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            planned: self.pending + self.running + self.done + self.abandoned + self.failed,
            succeeded: self.done,
            abandoned: self.abandoned,
            failed: self.failed,
        }
    }
}

/// Open the broker database and bring its schema up to date.
pub async fn open(url: &str) -> Result<Pool> {
    let pool = db::init_pool(url).await?;
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn enqueue_job(pool: &Pool, run_id: Uuid, item: &WorkItem) -> Result<i64> {
    let payload = serde_json::to_string(item)?;
    let id: i64 = sqlx::query("INSERT INTO sync_jobs (run_id, payload, state) VALUES (?, ?, ?) RETURNING id")
        .bind(run_id.to_string())
        .bind(payload)
        .bind(JobState::Pending.as_str())
        .fetch_one(pool)
        .await
        .context("failed to enqueue sync job")?
        .get("id");
    Ok(id)
}

/// Atomically move the oldest pending job to `running` and return it.
#[instrument(skip_all)]
pub async fn claim_next_job(pool: &Pool) -> Result<Option<(i64, String)>> {
    let row = sqlx::query(
        "UPDATE sync_jobs SET state = 'running', claimed_at = CURRENT_TIMESTAMP \
         WHERE id = (SELECT id FROM sync_jobs WHERE state = 'pending' ORDER BY id LIMIT 1) \
         AND state = 'pending' \
         RETURNING id, payload",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| (r.get::<i64, _>("id"), r.get::<String, _>("payload"))))
}

#[instrument(skip_all)]
pub async fn finish_job(pool: &Pool, id: i64, state: JobState, error: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE sync_jobs SET state = ?, error = ?, finished_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(state.as_str())
        .bind(error)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to record sync job outcome")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn run_progress(pool: &Pool, run_id: Uuid) -> Result<RunProgress> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT state, COUNT(*) FROM sync_jobs WHERE run_id = ? GROUP BY state")
            .bind(run_id.to_string())
            .fetch_all(pool)
            .await?;
    let mut progress = RunProgress::default();
    for (state, count) in rows {
        let count = count.max(0) as u64;
        match JobState::parse_state(&state) {
            Some(JobState::Pending) => progress.pending = count,
            Some(JobState::Running) => progress.running = count,
            Some(JobState::Done) => progress.done = count,
            Some(JobState::Abandoned) => progress.abandoned = count,
            Some(JobState::Failed) => progress.failed = count,
            None => error!(state = %state, count, "unknown sync job state"),
        }
    }
    Ok(progress)
}

/// Claim and run one job. Returns `Ok(false)` when nothing was pending.
pub async fn process_next_job(pool: &Pool, ctx: &SyncContext) -> Result<bool> {
    let Some((id, payload)) = claim_next_job(pool).await? else {
        return Ok(false);
    };
    let item: WorkItem = match serde_json::from_str(&payload) {
        Ok(item) => item,
        Err(err) => {
            error!(id, ?err, "undecodable sync job payload");
            finish_job(pool, id, JobState::Failed, Some(&err.to_string())).await?;
            return Ok(true);
        }
    };

    let (state, error) = match worker::run_item_contained(ctx, &item).await {
        Ok(true) => (JobState::Done, None),
        Ok(false) => (JobState::Abandoned, None),
        Err(err) => (JobState::Failed, Some(format!("{:#}", err))),
    };
    finish_job(pool, id, state, error.as_deref()).await?;
    Ok(true)
}

/// Worker loop for one slot; returns when idle if `exit_when_idle` is set.
pub async fn run_worker(
    pool: Pool,
    ctx: SyncContext,
    poll_interval: Duration,
    exit_when_idle: bool,
) -> Result<()> {
    loop {
        match process_next_job(&pool, &ctx).await {
            Ok(true) => {}
            Ok(false) => {
                if exit_when_idle {
                    info!("no pending sync jobs, exiting");
                    return Ok(());
                }
                tokio::time::sleep(poll_interval).await;
            }
            Err(err) => {
                error!(?err, "broker worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// [`WorkDistributor`] that writes items to the job table.
#[derive(Debug, Clone)]
pub struct SqlBroker {
    pool: Pool,
    run_id: Uuid,
    progress_interval: Duration,
}

impl SqlBroker {
    pub fn new(pool: Pool, progress_interval: Duration) -> Self {
        Self {
            pool,
            run_id: Uuid::new_v4(),
            progress_interval,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Block until the run has no pending or running jobs.
    pub async fn progress(&self) -> Result<RunProgress> {
        loop {
            let progress = run_progress(&self.pool, self.run_id).await?;
            if progress.outstanding() == 0 {
                return Ok(progress);
            }
            info!(
                run_id = %self.run_id,
                pending = progress.pending,
                running = progress.running,
                done = progress.done,
                abandoned = progress.abandoned,
                failed = progress.failed,
                "sync progress"
            );
            tokio::time::sleep(self.progress_interval).await;
        }
    }
}

#[async_trait]
impl WorkDistributor for SqlBroker {
    async fn submit(&self, item: WorkItem) -> Result<()> {
        enqueue_job(&self.pool, self.run_id, &item).await?;
        Ok(())
    }

    async fn drain_and_wait(&mut self) -> Result<RunReport> {
        Ok(self.progress().await?.report())
    }
}
