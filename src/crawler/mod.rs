//! Crawl orchestration: chunked pagination over the search listings with
//! monotonic, cancellation-aware termination.

mod monotonic;
mod pagination;

pub use monotonic::join_monotonic;
pub use pagination::{CrawlOptions, Harvester, MAX_PAGE};
