//! Chapel offline daemon and diagnostics.
//!
//! Run with: `cargo run -p chapel-service -- run`

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use chapel_service::{Config, OfflineService};
use chapel_store::QueueQuery;
use chapel_types::{OfflineCondition, OfflineStatus, Priority};

/// Chapel offline daemon - cache, queue replay and sync diagnostics.
#[derive(Parser, Debug)]
#[command(name = "chapel")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sync daemon in the foreground until Ctrl-C.
    Run,

    /// Show online state, cache, queue and sync statistics.
    Status {
        /// Print the snapshot as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Replay queued operations now, ignoring sync policy.
    Sync,

    /// Inspect or clear queued operations.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Inspect or clear the response cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Read one endpoint with offline fallback.
    Fetch {
        /// Endpoint path (e.g., /api/users).
        endpoint: String,
    },

    /// Download the shell assets into the asset cache.
    Precache,

    /// Manage sync statistics.
    Stats {
        #[command(subcommand)]
        action: StatsAction,
    },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// List pending operations in replay order.
    List {
        /// Only operations in this category (e.g., tasks).
        #[arg(long)]
        category: Option<String>,

        /// Only operations at or above this priority.
        #[arg(long)]
        priority: Option<Priority>,
    },

    /// Drop every pending operation.
    Clear,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Show cache size and age.
    Stats,

    /// Remove every cached response.
    Clear,
}

#[derive(Subcommand, Debug)]
enum StatsAction {
    /// Zero all sync counters.
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("chapel={}", level).parse()?)
                .add_directive(format!("chapel_core={}", level).parse()?)
                .add_directive(format!("chapel_service={}", level).parse()?),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_default(),
    };
    if let Some(db_path) = args.database {
        config.storage.path = db_path;
    }
    config.validate()?;

    info!("Opening database at {:?}", config.storage.path);
    let service = OfflineService::builder(config).build()?;
    service.initialize().await?;

    match args.command {
        Command::Run => run_daemon(&service).await?,
        Command::Status { json } => {
            service.probe_connectivity().await;
            let status = service.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Command::Sync => {
            service.probe_connectivity().await;
            let outcome = service.sync_now().await;
            if let Some(error) = outcome.error {
                anyhow::bail!("Sync failed: {}", error);
            }
            println!(
                "Replayed {} operation(s) in {:?}: {} succeeded, {} failed, {} dropped, {} conflicts",
                outcome.operations,
                outcome.duration,
                outcome.succeeded,
                outcome.failed,
                outcome.exhausted,
                outcome.conflicts
            );
        }
        Command::Queue { action } => match action {
            QueueAction::List { category, priority } => {
                let mut query = QueueQuery::new();
                if let Some(category) = &category {
                    query = query.category(category);
                }
                if let Some(priority) = priority {
                    query = query.min_priority(priority);
                }
                let ops = service.pending_operations(Some(&query)).await?;
                if ops.is_empty() {
                    println!("Queue is empty");
                }
                for op in ops {
                    println!(
                        "{}  {:<6} {:<7} {}  retries {}/{}",
                        op.id, op.priority, op.method, op.endpoint, op.retry_count, op.max_retries
                    );
                }
            }
            QueueAction::Clear => {
                let removed = service.clear_queue().await?;
                println!("Removed {} queued operation(s)", removed);
            }
        },
        Command::Cache { action } => match action {
            CacheAction::Stats => {
                let cache = service.status().await.cache;
                println!("Entries: {}", cache.total_items);
                println!("Size:    {} bytes", cache.total_size);
                if let Some(oldest) = cache.oldest_item {
                    println!("Oldest:  {}", oldest);
                }
                if let Some(newest) = cache.newest_item {
                    println!("Newest:  {}", newest);
                }
            }
            CacheAction::Clear => {
                let removed = service.clear_cache().await?;
                println!("Removed {} cache entries", removed);
            }
        },
        Command::Fetch { endpoint } => {
            service.probe_connectivity().await;
            let resp = service.fetch_with_offline_fallback(&endpoint).await?;
            if resp.from_cache {
                eprintln!("(served from cache)");
            }
            println!("{}", serde_json::to_string_pretty(&resp.data)?);
        }
        Command::Precache => {
            let report = service.precache_assets().await?;
            println!(
                "Cached {} asset(s) into {}",
                report.cached, report.version
            );
            for failure in &report.failed {
                println!("  failed {}: {}", failure.path, failure.error);
            }
            if report.missing_required() {
                anyhow::bail!("A required shell asset could not be cached");
            }
        }
        Command::Stats { action } => match action {
            StatsAction::Reset => {
                service.reset_sync_stats().await;
                println!("Sync statistics reset");
            }
        },
    }

    Ok(())
}

async fn run_daemon(service: &OfflineService) -> anyhow::Result<()> {
    service.probe_connectivity().await;
    let report = service.precache_assets().await?;
    if report.missing_required() {
        tracing::warn!("Shell precache incomplete: {} failure(s)", report.failed.len());
    }

    service.spawn_connectivity_probe().await;
    if service.spawn_background_runner().await {
        service.register_background_sync(None).await;
    }
    service.start_sync().await;

    if service.data_freshness().await.stale && service.connectivity().is_online() {
        service.download_all().await?;
    }

    info!("Chapel offline daemon running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    service.shutdown().await;
    Ok(())
}

fn print_status(status: &OfflineStatus) {
    let condition = match status.condition() {
        OfflineCondition::Online => "online",
        OfflineCondition::OfflineWithCache => "offline, showing cached data",
        OfflineCondition::OfflineNoData => "offline, no data available",
    };
    println!("Connection:  {}", condition);
    println!(
        "Interceptor: {}",
        if status.interceptor_enabled { "enabled" } else { "disabled" }
    );
    println!(
        "Cache:       {} entries, {} bytes",
        status.cache.total_items, status.cache.total_size
    );
    println!(
        "Queue:       {} pending ({} retrying)",
        status.pending_operations(),
        status.queue.retrying
    );
    println!("Sync:        {}", status.sync_state);

    let stats = &status.sync_stats;
    println!(
        "Cycles:      {} total, {} ok, {} failed, {} skipped",
        stats.total_syncs, stats.successful_syncs, stats.failed_syncs, stats.skipped_syncs
    );
    if let Some(last) = stats.last_sync {
        println!("Last sync:   {}", last);
    }
    if status.permanently_failed() > 0 {
        println!(
            "Dropped:     {} operation(s) permanently failed",
            status.permanently_failed()
        );
    }
    if let Some(error) = &stats.last_error {
        println!("Last error:  {}", error);
    }
    if status.background_supported {
        for reg in &status.registrations {
            println!(
                "Background:  {} {:?} (retries {})",
                reg.tag, reg.status, reg.retry_count
            );
        }
    }
}
