//! Pagination controller
//!
//! Drives the harvest: for each look-back window, the listing pages are
//! swept in fixed-size concurrent chunks. Every page task downloads its
//! listing, then every work the listing references, persisting each one
//! atomically. A page that comes back empty terminates the window through
//! the monotonic cancellation group.

use std::sync::{Arc, Mutex};

use crate::crawler::join_monotonic;
use crate::metrics::Metrics;
use crate::net::Fetcher;
use crate::scrape::{self, search, work};
use crate::storage::{date_to_epoch, WorkStore};
use crate::{DocId, Result, TimeUnit};

/// Listing pagination stops here; the archive caps search results at this
/// many pages per query.
pub const MAX_PAGE: u32 = 5_000;

/// Knobs for one harvest run.
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    /// Listing pages fetched concurrently per chunk.
    pub concurrency: usize,
    /// First page of the first window, for resuming an interrupted sweep.
    pub start_page: u32,
    /// Number of look-back windows to sweep ("3 weeks" sweeps works updated
    /// 0, 1 and 2 weeks ago).
    pub lookback: u32,
    pub unit: TimeUnit,
    /// Keep widening the look-back window past `lookback`, indefinitely.
    pub forever: bool,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            start_page: 1,
            lookback: 1,
            unit: TimeUnit::Day,
            forever: false,
        }
    }
}

/// The crawl orchestrator.
pub struct Harvester {
    fetcher: Arc<Fetcher>,
    store: Arc<Mutex<WorkStore>>,
    metrics: Arc<Metrics>,
    opts: CrawlOptions,
}

impl Harvester {
    pub fn new(
        fetcher: Arc<Fetcher>,
        store: Arc<Mutex<WorkStore>>,
        metrics: Arc<Metrics>,
        opts: CrawlOptions,
    ) -> Self {
        Self {
            fetcher,
            store,
            metrics,
            opts,
        }
    }

    /// Sweeps look-back windows of increasing age: a bounded pass over
    /// `lookback` windows backfills history, while `forever` keeps widening
    /// the window indefinitely.
    pub async fn run(&self) -> Result<()> {
        let mut ago = 0;
        let mut start_page = self.opts.start_page;

        while self.opts.forever || ago < self.opts.lookback {
            tracing::info!("harvesting works updated {ago} {}s ago", self.opts.unit);
            self.sweep_window(ago, start_page).await;
            // resumption offsets only apply to the window they interrupted
            start_page = 1;
            ago += 1;
        }
        Ok(())
    }

    /// Sweeps one window in chunks of `concurrency` pages until a page comes
    /// back empty or the page cap is reached.
    async fn sweep_window(&self, ago: u32, start_page: u32) {
        let chunk_size = self.opts.concurrency.max(1) as u32;
        let mut chunk_start = start_page.max(1);

        while chunk_start <= MAX_PAGE {
            let tasks: Vec<_> = (0..chunk_size)
                .map(|offset| self.harvest_page(ago, chunk_start + offset))
                .collect();
            let outcomes = join_monotonic(tasks).await;

            self.metrics.page.set(chunk_start as i64);

            // the chunk's last page decides: empty (or cancelled because an
            // earlier page was empty) means the window is exhausted
            if outcomes.last().map_or(true, Option::is_none) {
                break;
            }
            chunk_start += chunk_size;
        }
    }

    /// Harvests a single listing page and every work it references.
    ///
    /// `None` is the termination marker (empty listing). Failures abort this
    /// page only: they are logged and reported as a continuation so sibling
    /// pages and later chunks proceed; an overlapping window on a later pass
    /// picks the page up again.
    async fn harvest_page(&self, ago: u32, page: u32) -> Option<u32> {
        match self.try_harvest_page(ago, page).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!("page {page} ({ago} {}s ago) failed: {error}", self.opts.unit);
                Some(page + 1)
            }
        }
    }

    async fn try_harvest_page(&self, ago: u32, page: u32) -> Result<Option<u32>> {
        let unit = self.opts.unit;
        tracing::debug!("downloading page {page}");

        let listing_doc = DocId::listing(ago, unit, page);
        let Some(body) = self.fetcher.fetch_listing(ago, unit, page).await? else {
            // the search endpoint 404s past its last page
            return Ok(None);
        };

        let work_ids = match search::parse_listing(&body, &listing_doc) {
            Ok(ids) => ids,
            Err(error) => {
                self.dump_unparsed(&listing_doc, &body);
                return Err(error);
            }
        };
        if work_ids.is_empty() {
            return Ok(None);
        }

        for work_id in work_ids {
            tracing::debug!("downloading work {work_id}");
            let Some(body) = self.fetcher.fetch_work(work_id).await? else {
                tracing::warn!("work {work_id} linked by search but not found upon request");
                continue;
            };

            let parsed = match work::parse_work(&body, work_id) {
                Ok(parsed) => parsed,
                Err(error) => {
                    self.dump_unparsed(&DocId::work(work_id), &body);
                    return Err(error);
                }
            };

            self.metrics
                .work_updated
                .set(date_to_epoch(parsed.last_updated()));

            // the transaction inside write_work makes the record visible
            // atomically; there is no await point while the lock is held
            self.store.lock().unwrap().write_work(&parsed)?;
        }

        Ok(Some(page + 1))
    }

    fn dump_unparsed(&self, doc: &DocId, body: &str) {
        match scrape::dump_document(doc, body) {
            Ok(path) => {
                tracing::error!("failed to parse {doc}; raw document saved to {}", path.display())
            }
            Err(error) => {
                tracing::error!("failed to parse {doc}; could not save raw document: {error}")
            }
        }
    }
}
