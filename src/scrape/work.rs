//! Work documents
//!
//! A work page (in its full, unabridged rendering) carries the complete
//! metadata block and either a single body of text or the whole chapter
//! sequence. Extraction mirrors the page's definition-list markup:
//! `dd.<field>` nodes for scalar fields, `dd.<category>.tags` for tag sets,
//! `#chapters` for content.

use chrono::NaiveDate;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::{DocId, HarvestError, Result};

/// A fully-parsed work, the unit of persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct Work {
    pub id: u64,

    pub title: String,
    /// Account name, "Anonymous" when the author is hidden.
    pub author: String,
    /// Display pseudonym, "Anonymous" when the author is hidden.
    pub author_pseud: String,

    pub summary: Option<String>,
    pub notes: Option<String>,

    pub published: NaiveDate,
    pub updated: Option<NaiveDate>,
    pub words: u64,
    pub chapters_published: u32,
    /// `None` means the total is unknown: the work is ongoing.
    pub chapters_total: Option<u32>,
    pub language: String,

    pub hits: u64,
    pub kudos: u64,
    pub comments: u64,
    pub bookmarks: u64,

    pub rating_tags: Vec<String>,
    pub warning_tags: Vec<String>,
    pub category_tags: Vec<String>,
    pub fandom_tags: Vec<String>,
    pub character_tags: Vec<String>,
    pub relationship_tags: Vec<String>,
    pub freeform_tags: Vec<String>,

    pub content: Content,
}

/// Work content: one opaque body, or the ordered chapter sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Single(String),
    Chapters(Vec<Chapter>),
}

/// One chapter of a multi-chapter work. Owned by its work; never outlives it
/// in storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Chapter {
    pub id: u64,
    pub title: String,
    pub content: String,
}

/// The categories a work's tags are filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Rating,
    Warning,
    Category,
    Fandom,
    Character,
    Relationship,
    Freeform,
}

impl TagKind {
    pub const ALL: [TagKind; 7] = [
        TagKind::Rating,
        TagKind::Warning,
        TagKind::Category,
        TagKind::Fandom,
        TagKind::Character,
        TagKind::Relationship,
        TagKind::Freeform,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rating => "rating",
            Self::Warning => "warning",
            Self::Category => "category",
            Self::Fandom => "fandom",
            Self::Character => "character",
            Self::Relationship => "relationship",
            Self::Freeform => "freeform",
        }
    }
}

impl Work {
    /// Single ordering timestamp: the update date, falling back to the
    /// publication date for never-updated works.
    pub fn last_updated(&self) -> NaiveDate {
        self.updated.unwrap_or(self.published)
    }

    /// The seven tag lists paired with their category.
    pub fn tag_sets(&self) -> [(TagKind, &[String]); 7] {
        [
            (TagKind::Rating, self.rating_tags.as_slice()),
            (TagKind::Warning, self.warning_tags.as_slice()),
            (TagKind::Category, self.category_tags.as_slice()),
            (TagKind::Fandom, self.fandom_tags.as_slice()),
            (TagKind::Character, self.character_tags.as_slice()),
            (TagKind::Relationship, self.relationship_tags.as_slice()),
            (TagKind::Freeform, self.freeform_tags.as_slice()),
        ]
    }
}

/// Builds the URL of a work's full, unabridged rendering.
pub fn work_url(base: &Url, id: u64) -> std::result::Result<Url, url::ParseError> {
    let mut url = base.join(&format!("/works/{id}"))?;
    url.query_pairs_mut()
        .append_pair("view_adult", "true")
        .append_pair("view_full_work", "true");
    Ok(url)
}

/// Parses a work page into a [`Work`].
pub fn parse_work(html: &str, id: u64) -> Result<Work> {
    let document = Html::parse_document(html);
    let doc = DocId::work(id);
    let parser = Parser {
        document: &document,
        doc: &doc,
    };

    let (author, author_pseud) = parser.author()?;
    let (chapters_published, chapters_total) = parser.chapter_counts()?;

    Ok(Work {
        id,
        title: parser.required_text("h2")?,
        author,
        author_pseud,
        summary: parser.text(".summary.module p"),
        notes: parser.text(".notes.module p"),
        published: parser.date("dd.published")?,
        updated: parser.optional_date("dd.status")?,
        words: parser.number("dd.words")?,
        chapters_published,
        chapters_total,
        language: parser.required_text("dd.language")?,
        hits: parser.counter("dd.hits")?,
        kudos: parser.counter("dd.kudos")?,
        comments: parser.counter("dd.comments")?,
        bookmarks: parser.counter("dd.bookmarks")?,
        rating_tags: parser.tag_set(TagKind::Rating),
        warning_tags: parser.tag_set(TagKind::Warning),
        category_tags: parser.tag_set(TagKind::Category),
        fandom_tags: parser.tag_set(TagKind::Fandom),
        character_tags: parser.tag_set(TagKind::Character),
        relationship_tags: parser.tag_set(TagKind::Relationship),
        freeform_tags: parser.tag_set(TagKind::Freeform),
        content: parser.content()?,
    })
}

struct Parser<'a> {
    document: &'a Html,
    doc: &'a DocId,
}

impl Parser<'_> {
    fn fail(&self) -> HarvestError {
        HarvestError::parse(self.doc.clone())
    }

    fn first(&self, selector: &str) -> Option<ElementRef<'_>> {
        let selector = Selector::parse(selector).ok()?;
        self.document.select(&selector).next()
    }

    fn text(&self, selector: &str) -> Option<String> {
        self.first(selector)
            .map(|el| el.text().collect::<String>().trim().to_string())
    }

    fn required_text(&self, selector: &str) -> Result<String> {
        self.text(selector).ok_or_else(|| self.fail())
    }

    fn number(&self, selector: &str) -> Result<u64> {
        parse_number(&self.required_text(selector)?).ok_or_else(|| self.fail())
    }

    /// Engagement counters are omitted from the page while zero.
    fn counter(&self, selector: &str) -> Result<u64> {
        match self.text(selector) {
            Some(text) => parse_number(&text).ok_or_else(|| self.fail()),
            None => Ok(0),
        }
    }

    fn date(&self, selector: &str) -> Result<NaiveDate> {
        parse_date(&self.required_text(selector)?).ok_or_else(|| self.fail())
    }

    fn optional_date(&self, selector: &str) -> Result<Option<NaiveDate>> {
        match self.text(selector) {
            Some(text) => Ok(Some(parse_date(&text).ok_or_else(|| self.fail())?)),
            None => Ok(None),
        }
    }

    /// Account name and pseudonym from the byline's author link, both taken
    /// from the href (`/users/<account>/pseuds/<pseud>`) since the link text
    /// only shows the pseud. Anonymous works have no author link at all.
    fn author(&self) -> Result<(String, String)> {
        let Some(link) = self.first(r#"a[rel="author"]"#) else {
            return Ok(("Anonymous".to_string(), "Anonymous".to_string()));
        };
        let href = link.value().attr("href").ok_or_else(|| self.fail())?;
        let mut segments = href.split('/');
        let account = segments.nth(2).ok_or_else(|| self.fail())?;
        let pseud = segments.nth(1).ok_or_else(|| self.fail())?;
        Ok((decode_segment(account), decode_segment(pseud)))
    }

    /// The `dd.chapters` node reads `<published>/<total>`, with "?" standing
    /// for an unknown total.
    fn chapter_counts(&self) -> Result<(u32, Option<u32>)> {
        let text = self.required_text("dd.chapters")?;
        let (published, total) = text.split_once('/').ok_or_else(|| self.fail())?;
        let published = parse_number(published)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| self.fail())?;
        let total = match total.trim() {
            "?" => None,
            total => Some(
                parse_number(total)
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| self.fail())?,
            ),
        };
        Ok((published, total))
    }

    fn tag_set(&self, kind: TagKind) -> Vec<String> {
        let selector = format!("dd.{}.tags a", kind.as_str());
        let Ok(selector) = Selector::parse(&selector) else {
            return Vec::new();
        };
        self.document
            .select(&selector)
            .map(|el| el.text().collect::<String>().trim().to_string())
            .collect()
    }

    fn content(&self) -> Result<Content> {
        let chapter_selector =
            Selector::parse(r#"div[id^="chapter-"]"#).map_err(|_| self.fail())?;
        let chapter_divs: Vec<ElementRef<'_>> = self.document.select(&chapter_selector).collect();

        if chapter_divs.is_empty() {
            // single-chapter works render one userstuff block under #chapters
            let body = self.first("#chapters .userstuff").ok_or_else(|| self.fail())?;
            return Ok(Content::Single(body.inner_html().trim().to_string()));
        }

        let chapters = chapter_divs
            .into_iter()
            .map(|div| self.chapter(div))
            .collect::<Result<Vec<Chapter>>>()?;
        Ok(Content::Chapters(chapters))
    }

    fn chapter(&self, div: ElementRef<'_>) -> Result<Chapter> {
        let heading_selector = Selector::parse("h3").map_err(|_| self.fail())?;
        let link_selector = Selector::parse("h3 a").map_err(|_| self.fail())?;
        let article_selector =
            Selector::parse(r#"div[role="article"]"#).map_err(|_| self.fail())?;

        // heading: <h3><a href="/works/<work>/chapters/<id>">Chapter N</a>: Title</h3>
        let link = div.select(&link_selector).next().ok_or_else(|| self.fail())?;
        let href = link.value().attr("href").ok_or_else(|| self.fail())?;
        let id = href
            .split('/')
            .nth(4)
            .and_then(|id| id.parse::<u64>().ok())
            .ok_or_else(|| self.fail())?;

        let heading = div
            .select(&heading_selector)
            .next()
            .ok_or_else(|| self.fail())?
            .text()
            .collect::<String>();
        let title = heading
            .split_once(':')
            .map(|(_, title)| title.trim().to_string())
            .unwrap_or_default();

        // the chapter body, minus the landmark heading the site injects
        let article = div
            .select(&article_selector)
            .next()
            .ok_or_else(|| self.fail())?;
        let content = article
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|el| el.value().name() != "h3")
            .map(|el| el.html())
            .collect::<Vec<String>>()
            .join("\n");

        Ok(Chapter { id, title, content })
    }
}

fn parse_number(text: &str) -> Option<u64> {
    text.trim().replace(',', "").parse().ok()
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok()
}

fn decode_segment(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}
