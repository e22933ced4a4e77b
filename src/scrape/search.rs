//! Search listings
//!
//! A listing is one page of the archive's work search, filtered to works
//! updated within a relative time window and sorted most-recently-updated
//! first. Extraction yields the listed work ids in order; an empty list is
//! the end-of-results signal.

use std::fmt;
use std::str::FromStr;

use scraper::{Html, Selector};
use url::Url;

use crate::{DocId, HarvestError, Result};

/// Unit of the relative "updated N units ago" search window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            other => Err(format!("unknown time unit: {other}")),
        }
    }
}

/// Builds the search URL for works updated `ago` units ago, at `page`.
///
/// The full parameter set the archive's search form submits is carried along
/// with only `revised_at`, `page` and the sort order filled in; the server
/// rejects requests missing the empty fields as malformed searches.
pub fn search_url(
    base: &Url,
    ago: u32,
    unit: TimeUnit,
    page: u32,
) -> std::result::Result<Url, url::ParseError> {
    let mut url = base.join("/works/search")?;
    let revised_at = format!("{ago}+{unit}");
    let page = page.to_string();

    url.query_pairs_mut()
        .append_pair("work_search[revised_at]", &revised_at)
        .append_pair("page", &page)
        .append_pair("work_search[query]", "")
        .append_pair("work_search[title]", "")
        .append_pair("work_search[creators]", "")
        .append_pair("work_search[complete]", "")
        .append_pair("work_search[crossover]", "")
        .append_pair("work_search[single_chapter]", "0")
        .append_pair("work_search[word_count]", "")
        .append_pair("work_search[language_id]", "")
        .append_pair("work_search[fandom_names]", "")
        .append_pair("work_search[rating_ids]", "")
        .append_pair("work_search[character_names]", "")
        .append_pair("work_search[relationship_names]", "")
        .append_pair("work_search[freeform_names]", "")
        .append_pair("work_search[hits]", "")
        .append_pair("work_search[kudos_count]", "")
        .append_pair("work_search[comments_count]", "")
        .append_pair("work_search[bookmarks_count]", "")
        .append_pair("work_search[sort_column]", "revised_at")
        .append_pair("work_search[sort_direction]", "desc")
        .append_pair("commit", "Search");

    Ok(url)
}

/// Extracts the listed work ids, in listing order.
pub fn parse_listing(html: &str, doc: &DocId) -> Result<Vec<u64>> {
    let document = Html::parse_document(html);
    let selector =
        Selector::parse("li.work.blurb.group").map_err(|_| HarvestError::parse(doc.clone()))?;

    let mut ids = Vec::new();
    for element in document.select(&selector) {
        // each blurb carries its work id as e.g. id="work_123456"
        let id = element
            .value()
            .attr("id")
            .and_then(|id| id.strip_prefix("work_"))
            .and_then(|id| id.parse::<u64>().ok())
            .ok_or_else(|| HarvestError::parse(doc.clone()))?;
        ids.push(id);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing_doc() -> DocId {
        DocId::listing(0, TimeUnit::Week, 1)
    }

    #[test]
    fn parses_work_ids_in_order() {
        let html = r#"<html><body><ol>
            <li id="work_101" class="work blurb group">one</li>
            <li id="work_57" class="work blurb group">two</li>
            <li id="work_900001" class="work blurb group">three</li>
        </ol></body></html>"#;

        let ids = parse_listing(html, &listing_doc()).unwrap();
        assert_eq!(ids, vec![101, 57, 900001]);
    }

    #[test]
    fn empty_listing_yields_no_ids() {
        let html = r#"<html><body><p>No results found.</p></body></html>"#;
        let ids = parse_listing(html, &listing_doc()).unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn malformed_blurb_id_is_a_parse_failure() {
        let html = r#"<html><body>
            <li id="not-a-work" class="work blurb group">bad</li>
        </body></html>"#;
        assert!(parse_listing(html, &listing_doc()).is_err());
    }

    #[test]
    fn search_url_encodes_window_and_sort() {
        let base = Url::parse("https://archiveofourown.org").unwrap();
        let url = search_url(&base, 5, TimeUnit::Week, 3).unwrap();

        assert_eq!(url.path(), "/works/search");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("work_search[revised_at]".into(), "5+week".into())));
        assert!(pairs.contains(&("page".into(), "3".into())));
        assert!(pairs.contains(&("work_search[sort_column]".into(), "revised_at".into())));
        assert!(pairs.contains(&("work_search[sort_direction]".into(), "desc".into())));
    }
}
