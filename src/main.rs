use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use search_sync::broker::{self, SqlBroker};
use search_sync::config::{self, Config};
use search_sync::db::{self, SqlRecordSource};
use search_sync::elastic::ElasticClient;
use search_sync::planner::PlanParams;
use search_sync::render::FlatRenderer;
use search_sync::sync::{self, Preflight, WorkDistributor};
use search_sync::worker::SyncContext;

#[derive(Debug, Parser)]
#[command(author, version, about = "Sync the metadata database into the search index")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Plan and run one sync, exiting once all work has drained
    Sync(SyncOpts),
    /// Execute jobs submitted by `sync --distributed`
    Worker(WorkerOpts),
}

#[derive(Debug, clap::Args)]
struct SyncOpts {
    /// Records fetched and indexed per work item
    #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u64).range(1..))]
    items_per_page: u64,

    /// Number of in-process workers
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u64).range(1..))]
    threads: u64,

    /// Sync records created or updated this long ago or later (e.g. 12h, 7d, 2w)
    #[arg(long, default_value = "5200w", value_parser = sync::parse_time_ago)]
    time_ago: Duration,

    /// Field to leave out of every document; repeatable
    #[arg(long = "exclude")]
    exclude: Vec<String>,

    /// Submit work to the broker job table instead of the in-process pool
    #[arg(long)]
    distributed: bool,
}

#[derive(Debug, clap::Args)]
struct WorkerOpts {
    /// Jobs executed concurrently by this process
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u64).range(1..))]
    concurrency: u64,

    /// Exit once no pending jobs remain instead of polling forever
    #[arg(long)]
    exit_when_idle: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    let ctx = SyncContext {
        source: Arc::new(SqlRecordSource::new(pool)),
        renderer: Arc::new(FlatRenderer),
        store: Arc::new(ElasticClient::from_config(&cfg)?),
        max_attempts: cfg.sync.max_attempts,
    };

    match args.command {
        Command::Sync(opts) => run_sync(&cfg, ctx, opts).await,
        Command::Worker(opts) => run_workers(&cfg, ctx, opts).await,
    }
}

async fn open_broker(cfg: &Config) -> Result<search_sync::db::Pool> {
    let url = cfg
        .broker_url()
        .ok_or_else(|| anyhow!("broker.url (or BROKER_URL) is required for distributed syncs"))?;
    broker::open(&url).await
}

fn progress_interval(cfg: &Config) -> Duration {
    Duration::from_millis(cfg.broker.as_ref().map(|b| b.progress_interval_ms).unwrap_or(2000))
}

fn poll_interval(cfg: &Config) -> Duration {
    Duration::from_millis(cfg.broker.as_ref().map(|b| b.poll_interval_ms).unwrap_or(500))
}

async fn run_sync(cfg: &Config, ctx: SyncContext, opts: SyncOpts) -> Result<()> {
    let cutoff = sync::cutoff_from(Utc::now(), opts.time_ago)?;
    let params = PlanParams::new(
        opts.items_per_page,
        cutoff,
        opts.exclude.into_iter().collect::<BTreeSet<_>>(),
    );
    let preflight = Preflight {
        attempts: cfg.sync.connect_attempts,
        wait: cfg.connect_wait(),
    };
    info!(
        items_per_page = opts.items_per_page,
        threads = opts.threads,
        cutoff = %cutoff,
        distributed = opts.distributed,
        "starting search sync"
    );

    let report = if opts.distributed {
        let broker_pool = open_broker(cfg).await?;
        let interval = progress_interval(cfg);
        sync::search_sync(&ctx, preflight, &params, move || {
            let broker = SqlBroker::new(broker_pool, interval);
            info!(run_id = %broker.run_id(), "submitting to broker");
            Ok(Box::new(broker) as Box<dyn WorkDistributor>)
        })
        .await?
    } else {
        let threads = usize::try_from(opts.threads)?;
        let capacity = cfg.sync.queue_capacity;
        let pool_ctx = ctx.clone();
        sync::search_sync(&ctx, preflight, &params, move || {
            sync::in_process(threads, capacity, pool_ctx)
        })
        .await?
    };

    if report.is_clean() {
        info!(planned = report.planned, "search sync complete");
    } else {
        warn!(
            planned = report.planned,
            succeeded = report.succeeded,
            abandoned = report.abandoned,
            failed = report.failed,
            "search sync complete with failed pages"
        );
    }
    Ok(())
}

async fn run_workers(cfg: &Config, ctx: SyncContext, opts: WorkerOpts) -> Result<()> {
    let broker_pool = open_broker(cfg).await?;
    let poll = poll_interval(cfg);
    info!(concurrency = opts.concurrency, "starting broker workers");

    let handles: Vec<_> = (0..opts.concurrency)
        .map(|_| {
            tokio::spawn(broker::run_worker(
                broker_pool.clone(),
                ctx.clone(),
                poll,
                opts.exit_when_idle,
            ))
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(?err, "broker worker stopped"),
            Err(err) => error!(?err, "broker worker panicked"),
        }
    }
    Ok(())
}
