//! Process metrics
//!
//! A single metrics context owns its registry and is passed by reference into
//! the components that report; there is no ambient global. The pull endpoint
//! and the database-size sampler are opt-in tasks spawned by the binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::net::DocKind;
use crate::Result;

/// Counters, gauges and histograms the harvester reports progress into.
pub struct Metrics {
    registry: Registry,

    /// Number of pages downloaded concurrently.
    pub page_concurrency: IntGauge,
    /// Documents downloaded, by document kind.
    pub downloaded: IntCounterVec,
    /// Bytes downloaded, by document kind.
    pub downloaded_bytes: IntCounterVec,
    /// Per-document download latency, by document kind.
    pub download_time: HistogramVec,
    /// Start of the current chunk of pages being downloaded.
    pub page: IntGauge,
    /// Update time of the last work downloaded, as a unix timestamp.
    pub work_updated: IntGauge,
    /// Size of the database file in bytes.
    pub database_size: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let page_concurrency = IntGauge::new(
            "page_concurrency",
            "Number of pages downloaded concurrently.",
        )?;
        let downloaded = IntCounterVec::new(
            Opts::new("downloaded", "Number of documents downloaded."),
            &["doc_type"],
        )?;
        let downloaded_bytes = IntCounterVec::new(
            Opts::new("downloaded_bytes", "Number of bytes downloaded."),
            &["doc_type"],
        )?;
        let download_time = HistogramVec::new(
            HistogramOpts::new("download_time", "Time taken to download documents.")
                .buckets(vec![0.1, 0.25, 0.5, 0.75, 1.0, 2.0, 5.0, 10.0]),
            &["doc_type"],
        )?;
        let page = IntGauge::new("page", "Start of current chunk of pages being downloaded.")?;
        let work_updated = IntGauge::new("work_updated", "Update time of last work downloaded.")?;
        let database_size = IntGauge::new("database_size", "Size of database in bytes.")?;

        registry.register(Box::new(page_concurrency.clone()))?;
        registry.register(Box::new(downloaded.clone()))?;
        registry.register(Box::new(downloaded_bytes.clone()))?;
        registry.register(Box::new(download_time.clone()))?;
        registry.register(Box::new(page.clone()))?;
        registry.register(Box::new(work_updated.clone()))?;
        registry.register(Box::new(database_size.clone()))?;

        // pre-create the label combinations so scrapes see zeroed series
        for kind in [DocKind::Page, DocKind::Work] {
            downloaded.with_label_values(&[kind.as_label()]);
            downloaded_bytes.with_label_values(&[kind.as_label()]);
            download_time.with_label_values(&[kind.as_label()]);
        }

        Ok(Self {
            registry,
            page_concurrency,
            downloaded,
            downloaded_bytes,
            download_time,
            page,
            work_updated,
            database_size,
        })
    }

    /// Records one successful document download.
    pub fn record_download(&self, kind: DocKind, bytes: usize, elapsed: Duration) {
        let label = [kind.as_label()];
        self.downloaded.with_label_values(&label).inc();
        self.downloaded_bytes
            .with_label_values(&label)
            .inc_by(bytes as u64);
        self.download_time
            .with_label_values(&label)
            .observe(elapsed.as_secs_f64());
    }

    /// Renders the registry in the text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        match encoder.encode_to_string(&self.registry.gather()) {
            Ok(text) => text,
            Err(error) => {
                tracing::error!("failed to encode metrics: {error}");
                String::new()
            }
        }
    }
}

/// Serves the pull endpoint at `/metrics`.
pub async fn serve(metrics: Arc<Metrics>, addr: SocketAddr) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics exposed at http://{addr}/metrics");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn render_metrics(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.render()
}

/// Samples the store file's size into the database-size gauge.
pub async fn database_size_worker(metrics: Arc<Metrics>, db_path: PathBuf, period: Duration) {
    loop {
        match tokio::fs::metadata(&db_path).await {
            Ok(meta) => metrics.database_size.set(meta.len() as i64),
            Err(error) => tracing::debug!("could not stat {}: {error}", db_path.display()),
        }
        tokio::time::sleep(period).await;
    }
}
