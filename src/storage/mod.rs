//! Persistent storage for harvested works
//!
//! A single SQLite file holds works, their chapters, and tag associations.
//! Chapter content is transparently zstd-compressed with per-language
//! dictionaries; a background task performs the incremental compression
//! maintenance the extension defers.

pub mod maintenance;
mod schema;
mod store;

pub use schema::initialize_schema;
pub use store::{date_to_epoch, epoch_to_date, WorkStore};
