//! ao3-harvest: a continuous harvester for Archive of Our Own
//!
//! This crate sweeps the archive's search listings in concurrent page chunks,
//! downloads every listed work, and persists parsed records into a
//! transparently-compressed SQLite store. Rate limits are absorbed with
//! unbounded jittered backoff, and outgoing requests can rotate their source
//! address across a configured network range.

pub mod crawler;
pub mod metrics;
pub mod net;
pub mod scrape;
pub mod storage;

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

/// Identity of a remote document, kept on parse failures so the raw body can
/// be dumped for offline diagnosis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocId {
    /// Human-readable name, e.g. "work 123456".
    pub name: String,
    /// Filesystem-safe short name, e.g. "work_123456".
    pub shortname: String,
}

impl DocId {
    pub fn work(id: u64) -> Self {
        Self {
            name: format!("work {id}"),
            shortname: format!("work_{id}"),
        }
    }

    pub fn listing(ago: u32, unit: scrape::search::TimeUnit, page: u32) -> Self {
        Self {
            name: format!("listing {ago} {unit}s ago, page {page}"),
            shortname: format!("page_{ago}{unit}_{page}"),
        }
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Main error type for harvest operations.
///
/// A 404 is not represented here: it is a benign outcome (listing exhausted,
/// or a work removed between listing and fetch) and surfaces as `Ok(None)`
/// from the fetch layer.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("HTTP {status} for {url}")]
    RequestFailed { url: String, status: u16 },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("cannot bind source address {addr}: {source}")]
    Permission {
        addr: IpAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {doc}")]
    Parse { doc: DocId },

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("compression layer error: {0}")]
    Compression(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarvestError {
    /// Shorthand used by the parse helpers.
    pub fn parse(doc: DocId) -> Self {
        Self::Parse { doc }
    }
}

/// Result type alias for harvest operations.
pub type Result<T> = std::result::Result<T, HarvestError>;

// Re-export commonly used types
pub use crawler::{CrawlOptions, Harvester};
pub use metrics::Metrics;
pub use net::{AddressPool, BackoffPolicy, Fetcher, HttpTransport, Transport};
pub use scrape::search::TimeUnit;
pub use scrape::work::{Chapter, Content, Work};
pub use storage::WorkStore;
