//! Run coordinator: preflight, dispatch, plan, drain.

use crate::elastic::{IndexError, IndexStore};
use crate::model::{RunReport, WorkItem};
use crate::planner::{self, PlanParams};
use crate::worker::{SyncContext, WorkerPool};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tracing::{error, info, warn};

/// Where planned work goes and how the run waits for it.
///
/// Implemented by the in-process [`WorkerPool`] and by the job-table broker.
#[async_trait]
pub trait WorkDistributor: Send + Sync {
    async fn submit(&self, item: WorkItem) -> Result<()>;

    /// Signal that planning is over and block until every submitted item is done.
    async fn drain_and_wait(&mut self) -> Result<RunReport>;
}

/// Index reachability check made before anything is planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preflight {
    pub attempts: u32,
    pub wait: Duration,
}

impl Default for Preflight {
    fn default() -> Self {
        Self {
            attempts: 40,
            wait: Duration::from_secs(3),
        }
    }
}

/// Provision the index and ping it, retrying with a fixed wait.
///
/// Makes at most `preflight.attempts` tries and returns the last error once they
/// are used up.
pub async fn try_es_connect(store: &dyn IndexStore, preflight: Preflight) -> Result<(), IndexError> {
    let mut attempt = 1;
    loop {
        let result = match store.ensure_schema().await {
            Ok(()) => store.ping().await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                info!(attempt, "index store reachable");
                return Ok(());
            }
            Err(err) if attempt < preflight.attempts => {
                warn!(?err, attempt, attempts = preflight.attempts, "index store not reachable yet");
                tokio::time::sleep(preflight.wait).await;
                attempt += 1;
            }
            Err(err) => {
                error!(?err, attempts = preflight.attempts, "giving up on index store");
                return Err(err);
            }
        }
    }
}

/// Start an in-process pool; the default distributor for [`search_sync`].
pub fn in_process(threads: usize, capacity: usize, ctx: SyncContext) -> Result<Box<dyn WorkDistributor>> {
    if threads == 0 {
        return Err(anyhow!("threads must be at least 1"));
    }
    Ok(Box::new(WorkerPool::start(threads, capacity, ctx)))
}

/// One full sync run.
///
/// Only preflight failure (and failure to plan) ends the run early. Items that
/// fail are tallied in the returned report.
pub async fn search_sync<F>(
    ctx: &SyncContext,
    preflight: Preflight,
    params: &PlanParams,
    make_distributor: F,
) -> Result<RunReport>
where
    F: FnOnce() -> Result<Box<dyn WorkDistributor>>,
{
    info!("checking index store");
    try_es_connect(ctx.store.as_ref(), preflight)
        .await
        .context("index store unreachable")?;

    let mut distributor = make_distributor()?;

    let planned = match planner::generate_work(ctx.source.as_ref(), distributor.as_ref(), params).await {
        Ok(planned) => planned,
        Err(err) => {
            // Let already-submitted work finish before surfacing the error.
            if let Err(drain_err) = distributor.drain_and_wait().await {
                error!(?drain_err, "failed to drain after planning error");
            }
            return Err(err.context("planning failed"));
        }
    };

    info!(planned, "waiting for work to drain");
    let mut report = distributor.drain_and_wait().await?;
    report.planned = planned;
    info!(
        planned = report.planned,
        succeeded = report.succeeded,
        abandoned = report.abandoned,
        failed = report.failed,
        "sync drained"
    );
    Ok(report)
}

/// Watermark for a run: `now - time_ago`, truncated to whole seconds.
pub fn cutoff_from(now: DateTime<Utc>, time_ago: Duration) -> Result<DateTime<Utc>> {
    let delta = chrono::Duration::from_std(time_ago).context("time_ago out of range")?;
    let cutoff = now
        .checked_sub_signed(delta)
        .ok_or_else(|| anyhow!("time_ago reaches before the supported calendar range"))?;
    Ok(cutoff.trunc_subsecs(0))
}

static TIME_AGO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\s*([smhdw])\s*$").expect("valid time-ago pattern"));

/// Parse `<n><unit>` where unit is one of `s`, `m`, `h`, `d`, `w`.
pub fn parse_time_ago(input: &str) -> Result<Duration> {
    let caps = TIME_AGO
        .captures(input)
        .ok_or_else(|| anyhow!("invalid duration '{}', expected e.g. 30m, 12h, 7d, 2w", input))?;
    let amount: u64 = caps[1].parse().context("duration amount out of range")?;
    let unit: u64 = match &caps[2] {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => 7 * 24 * 60 * 60,
    };
    let secs = amount
        .checked_mul(unit)
        .ok_or_else(|| anyhow!("duration '{}' out of range", input))?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_time_ago_units() {
        assert_eq!(parse_time_ago("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_time_ago("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_time_ago("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_time_ago(" 1 d ").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_time_ago("2w").unwrap(), Duration::from_secs(1_209_600));
    }

    #[test]
    fn rejects_bad_time_ago() {
        assert!(parse_time_ago("").is_err());
        assert!(parse_time_ago("7").is_err());
        assert!(parse_time_ago("-1d").is_err());
        assert!(parse_time_ago("3y").is_err());
        assert!(parse_time_ago("99999999999999999999w").is_err());
    }

    #[test]
    fn cutoff_drops_subseconds() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 30).unwrap()
            + chrono::Duration::milliseconds(750);
        let cutoff = cutoff_from(now, Duration::from_secs(30)).unwrap();
        assert_eq!(cutoff, Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap());
    }

    #[test]
    fn default_preflight_is_forty_tries_three_seconds_apart() {
        let p = Preflight::default();
        assert_eq!(p.attempts, 40);
        assert_eq!(p.wait, Duration::from_secs(3));
    }
}
