//! In-process worker pool and the per-item fetch → render → bulk pipeline.

use crate::db::RecordSource;
use crate::elastic::IndexStore;
use crate::model::{RunReport, WorkItem};
use crate::queue::{Job, WorkQueue};
use crate::render::DocumentRenderer;
use crate::sync::WorkDistributor;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Everything a worker needs to execute a [`WorkItem`].
#[derive(Clone)]
pub struct SyncContext {
    pub source: Arc<dyn RecordSource>,
    pub renderer: Arc<dyn DocumentRenderer>,
    pub store: Arc<dyn IndexStore>,
    /// Total tries per item, first one included.
    pub max_attempts: u32,
}

/// Run one item, re-running the whole fetch/render/bulk sequence when the bulk
/// request fails with a retryable error.
///
/// Returns `Ok(true)` once a bulk request succeeds and `Ok(false)` when every
/// attempt failed. Record source, rendering and fatal index errors are returned
/// as `Err` without retrying.
#[instrument(skip_all, fields(object = %item.object_type, time_field = %item.time_field, page = item.page))]
pub async fn try_doing_work(ctx: &SyncContext, item: &WorkItem) -> Result<bool> {
    for attempt in 1..=ctx.max_attempts {
        let records = ctx.source.fetch_page(item).await?;
        let documents = ctx
            .renderer
            .render(item.object_type, &records, &item.excluded_fields)
            .context("failed to render documents")?;
        match ctx.store.bulk_upsert(&documents).await {
            Ok(()) => return Ok(true),
            Err(err) if err.is_retryable() => {
                warn!(?err, attempt, max_attempts = ctx.max_attempts, "bulk upsert failed");
            }
            Err(err) => return Err(err).context("bulk upsert rejected"),
        }
    }
    Ok(false)
}

/// [`try_doing_work`] wrapped in the per-item start/finish log lines.
pub async fn run_item(ctx: &SyncContext, item: &WorkItem) -> Result<bool> {
    info!(
        object = %item.object_type,
        time_field = %item.time_field,
        page = item.page,
        total_pages = item.total_pages,
        "starting"
    );
    let outcome = try_doing_work(ctx, item).await;
    match &outcome {
        Ok(true) => info!(
            object = %item.object_type,
            time_field = %item.time_field,
            page = item.page,
            total_pages = item.total_pages,
            "finished"
        ),
        Ok(false) => warn!(
            object = %item.object_type,
            time_field = %item.time_field,
            page = item.page,
            attempts = ctx.max_attempts,
            "giving up on page"
        ),
        Err(err) => error!(
            ?err,
            object = %item.object_type,
            time_field = %item.time_field,
            page = item.page,
            "page failed"
        ),
    }
    outcome
}

/// [`run_item`] with a panic in a collaborator reported as an error.
pub async fn run_item_contained(ctx: &SyncContext, item: &WorkItem) -> Result<bool> {
    match AssertUnwindSafe(run_item(ctx, item)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(
                object = %item.object_type,
                time_field = %item.time_field,
                page = item.page,
                panic = %message,
                "page panicked"
            );
            Err(anyhow!("page panicked: {}", message))
        }
    }
}

/// Worker loop: take jobs until a `Stop` sentinel (or a closed queue), acknowledging
/// every job it takes. A panicking item counts as failed and the loop carries on, so
/// each worker is still there to take its own sentinel.
pub async fn start_work(worker: usize, queue: WorkQueue, ctx: SyncContext) -> RunReport {
    let mut tally = RunReport::default();
    while let Ok(delivery) = queue.get().await {
        let job = delivery.job().clone();
        match job {
            Job::Stop => {
                delivery.task_done();
                break;
            }
            Job::Work(item) => {
                match run_item_contained(&ctx, &item).await {
                    Ok(true) => tally.succeeded += 1,
                    Ok(false) => tally.abandoned += 1,
                    Err(_) => tally.failed += 1,
                }
                delivery.task_done();
            }
        }
    }
    info!(worker, succeeded = tally.succeeded, abandoned = tally.abandoned, failed = tally.failed, "worker exiting");
    tally
}

/// Fixed-size set of workers sharing one bounded queue.
pub struct WorkerPool {
    queue: WorkQueue,
    handles: Vec<JoinHandle<RunReport>>,
    threads: usize,
}

impl WorkerPool {
    pub fn start(threads: usize, capacity: usize, ctx: SyncContext) -> Self {
        let queue = WorkQueue::bounded(capacity);
        let handles = (0..threads)
            .map(|worker| tokio::spawn(start_work(worker, queue.clone(), ctx.clone())))
            .collect();
        info!(threads, capacity, "worker pool started");
        Self {
            queue,
            handles,
            threads,
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }
}

#[async_trait]
impl WorkDistributor for WorkerPool {
    async fn submit(&self, item: WorkItem) -> Result<()> {
        self.queue
            .put(Job::Work(item))
            .await
            .context("failed to enqueue work item")
    }

    async fn drain_and_wait(&mut self) -> Result<RunReport> {
        for _ in 0..self.threads {
            self.queue
                .put(Job::Stop)
                .await
                .context("failed to enqueue stop sentinel")?;
        }

        let mut report = RunReport::default();
        for result in futures::future::join_all(self.handles.drain(..)).await {
            match result {
                Ok(tally) => report.merge(&tally),
                Err(err) => error!(?err, "worker task did not finish cleanly"),
            }
        }

        let orphaned = self.queue.discard_remaining();
        if !orphaned.is_empty() {
            let unrun = orphaned
                .iter()
                .filter(|job| matches!(job, Job::Work(_)))
                .count() as u64;
            report.failed += unrun;
            warn!(orphaned = orphaned.len(), unrun, "discarded jobs left behind by dead workers");
        }
        self.queue.join().await;
        self.queue.close();
        Ok(report)
    }
}
