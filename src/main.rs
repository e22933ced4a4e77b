//! ao3-harvest entry point

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ipnet::IpNet;
use tracing_subscriber::EnvFilter;

use ao3_harvest::net::{AddressPool, Fetcher, HttpTransport};
use ao3_harvest::storage::{maintenance, WorkStore};
use ao3_harvest::{CrawlOptions, Harvester, Metrics, TimeUnit};

/// Continuously harvest works from the archive into a local database.
#[derive(Parser, Debug)]
#[command(name = "ao3-harvest", version, about = "Archive work harvester", long_about = None)]
struct Cli {
    /// How many look-back windows to sweep ("3 week" sweeps works updated
    /// 0, 1 and 2 weeks ago)
    time_ago: u32,

    /// Unit of the look-back window: day, week, month or year
    #[arg(value_parser = TimeUnit::from_str)]
    time_unit: TimeUnit,

    /// Path to the work database
    #[arg(long, default_value = "ao3.db")]
    db: PathBuf,

    /// CIDR range to draw random source addresses from
    #[arg(long, value_parser = IpNet::from_str)]
    ip_network: Option<IpNet>,

    /// Listing pages fetched concurrently
    #[arg(long, default_value_t = 10)]
    concurrency: usize,

    /// Page to start the first window's sweep at
    #[arg(long, default_value_t = 1)]
    start_page: u32,

    /// Keep widening the look-back window indefinitely
    #[arg(long)]
    forever: bool,

    /// Expose a Prometheus pull endpoint
    #[arg(long)]
    metrics: bool,

    /// Address for the metrics endpoint
    #[arg(long, default_value = "127.0.0.1:9184")]
    metrics_addr: SocketAddr,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let store = WorkStore::open(&cli.db)
        .with_context(|| format!("opening store at {}", cli.db.display()))?;
    store.init_schema().context("initializing store schema")?;

    let metrics = Arc::new(Metrics::new()?);
    metrics.page_concurrency.set(cli.concurrency as i64);

    if cli.metrics {
        let endpoint_metrics = metrics.clone();
        let addr = cli.metrics_addr;
        tokio::spawn(async move {
            if let Err(error) = ao3_harvest::metrics::serve(endpoint_metrics, addr).await {
                tracing::error!("metrics endpoint failed: {error}");
            }
        });
        tokio::spawn(ao3_harvest::metrics::database_size_worker(
            metrics.clone(),
            cli.db.clone(),
            Duration::from_secs(1),
        ));
    }

    // maintenance runs on its own connection; writers and maintenance only
    // contend on the engine's transaction lock
    let maintenance_store = WorkStore::open(&cli.db)?;
    tokio::spawn(maintenance::worker(
        maintenance_store,
        maintenance::MaintenanceConfig::default(),
    ));

    let pool = AddressPool::new(cli.ip_network);
    if let Some(addr) = pool.pick() {
        // fail fast when the platform refuses non-local source binding
        HttpTransport::probe(addr).context("verifying source address capability")?;
    }

    let fetcher = Arc::new(Fetcher::new(
        Arc::new(HttpTransport::new()),
        pool,
        metrics.clone(),
    ));
    let harvester = Harvester::new(
        fetcher,
        Arc::new(Mutex::new(store)),
        metrics,
        CrawlOptions {
            concurrency: cli.concurrency,
            start_page: cli.start_page,
            lookback: cli.time_ago,
            unit: cli.time_unit,
            forever: cli.forever,
        },
    );
    harvester.run().await?;

    Ok(())
}

/// Sets up the tracing subscriber based on verbosity level.
fn setup_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::new("ao3_harvest=info,warn"),
        1 => EnvFilter::new("ao3_harvest=debug,info"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
