//! Markup extraction for the two remote document kinds: search listings and
//! works. Parsing is deliberately strict; a structural mismatch is a fatal
//! parse failure whose raw body gets dumped for offline diagnosis, because it
//! means the site's markup changed, not that the network hiccuped.

pub mod search;
pub mod work;

use std::path::PathBuf;

use crate::DocId;

/// Base URL of the production archive.
pub const DEFAULT_BASE_URL: &str = "https://archiveofourown.org";

/// Writes the raw body of an unparseable document to `<shortname>.html` in
/// the working directory and returns the path.
pub fn dump_document(doc: &DocId, body: &str) -> std::io::Result<PathBuf> {
    let path = PathBuf::from(format!("{}.html", doc.shortname));
    std::fs::write(&path, body)?;
    Ok(path)
}
