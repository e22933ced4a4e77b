//! SQLite-backed work storage
//!
//! One work is one transaction: the work row, its full chapter set, and its
//! full tagging set become visible together or not at all. Re-writing an id
//! replaces everything previously stored for it, so repeated harvests of the
//! same work converge on the latest fetch.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::scrape::work::{Chapter, Content, Work};
use crate::storage::schema::initialize_schema;
use crate::{HarvestError, Result};

/// Unix timestamp of a date, at midnight UTC.
pub fn date_to_epoch(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// Inverse of [`date_to_epoch`]; out-of-range values clamp to the epoch.
pub fn epoch_to_date(epoch: i64) -> NaiveDate {
    DateTime::<Utc>::from_timestamp(epoch, 0)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .date_naive()
}

/// Durable storage for harvested works.
pub struct WorkStore {
    conn: Connection,
}

impl WorkStore {
    /// Opens (creating if necessary) a store at `path`: applies the pragma
    /// set and loads the zstd extension functions. Schema creation is
    /// separate, see [`WorkStore::init_schema`].
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // auto_vacuum must be configured before the first table exists
        conn.execute_batch(
            "
            PRAGMA auto_vacuum = FULL;
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
        ",
        )?;

        sqlite_zstd::load(&conn)
            .map_err(|error| HarvestError::Compression(error.to_string()))?;

        Ok(Self { conn })
    }

    /// Creates tables, indexes, and the transparent compression layer.
    /// Idempotent.
    pub fn init_schema(&self) -> Result<()> {
        initialize_schema(&self.conn)?;
        Ok(())
    }

    /// Upserts a work atomically. Latest fetch wins: the work row is
    /// overwritten and the chapter and tagging sets are fully replaced, so no
    /// stale chapters or taggings survive a shrinking re-fetch.
    pub fn write_work(&mut self, work: &Work) -> Result<()> {
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT OR REPLACE INTO works VALUES
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                work.id as i64,
                work.title,
                work.author,
                work.author_pseud,
                work.summary,
                work.notes,
                date_to_epoch(work.published),
                work.updated.map(date_to_epoch),
                work.words as i64,
                work.chapters_published,
                work.chapters_total,
                work.language,
                work.hits as i64,
                work.kudos as i64,
                work.comments as i64,
                work.bookmarks as i64,
            ],
        )?;

        tx.execute(
            "DELETE FROM chapters WHERE work_id = ?1",
            params![work.id as i64],
        )?;
        match &work.content {
            Content::Chapters(chapters) => {
                for chapter in chapters {
                    tx.execute(
                        "INSERT INTO chapters (id, work_id, title, content) VALUES (?1, ?2, ?3, ?4)",
                        params![chapter.id as i64, work.id as i64, chapter.title, chapter.content],
                    )?;
                }
            }
            // a single opaque body is stored as one chapter row reusing the
            // work's own id and title
            Content::Single(body) => {
                tx.execute(
                    "INSERT INTO chapters (id, work_id, title, content) VALUES (?1, ?2, ?3, ?4)",
                    params![work.id as i64, work.id as i64, work.title, body],
                )?;
            }
        }

        tx.execute(
            "DELETE FROM taggings WHERE work_id = ?1",
            params![work.id as i64],
        )?;
        for (kind, tags) in work.tag_sets() {
            for tag in tags {
                tx.execute(
                    "INSERT OR REPLACE INTO taggings (tag, work_id, type) VALUES (?1, ?2, ?3)",
                    params![tag, work.id as i64, kind.as_str()],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Reads a work back in full, or `None` if the id is unknown.
    pub fn get_work(&self, id: u64) -> Result<Option<Work>> {
        let work = self
            .conn
            .query_row(
                "SELECT title, author, author_pseud, summary, notes, published, updated,
                        words, chapters_published, chapters_total, language,
                        hits, kudos, comments, bookmarks
                 FROM works WHERE id = ?1",
                params![id as i64],
                |row| {
                    Ok(Work {
                        id,
                        title: row.get(0)?,
                        author: row.get(1)?,
                        author_pseud: row.get(2)?,
                        summary: row.get(3)?,
                        notes: row.get(4)?,
                        published: epoch_to_date(row.get(5)?),
                        updated: row.get::<_, Option<i64>>(6)?.map(epoch_to_date),
                        words: row.get::<_, i64>(7)? as u64,
                        chapters_published: row.get(8)?,
                        chapters_total: row.get(9)?,
                        language: row.get(10)?,
                        hits: row.get::<_, i64>(11)? as u64,
                        kudos: row.get::<_, i64>(12)? as u64,
                        comments: row.get::<_, i64>(13)? as u64,
                        bookmarks: row.get::<_, i64>(14)? as u64,
                        rating_tags: Vec::new(),
                        warning_tags: Vec::new(),
                        category_tags: Vec::new(),
                        fandom_tags: Vec::new(),
                        character_tags: Vec::new(),
                        relationship_tags: Vec::new(),
                        freeform_tags: Vec::new(),
                        content: Content::Chapters(Vec::new()),
                    })
                },
            )
            .optional()?;
        let Some(mut work) = work else {
            return Ok(None);
        };

        let mut stmt = self
            .conn
            .prepare("SELECT id, title, content FROM chapters WHERE work_id = ?1 ORDER BY id")?;
        let mut chapters = stmt
            .query_map(params![id as i64], |row| {
                Ok(Chapter {
                    id: row.get::<_, i64>(0)? as u64,
                    title: row.get(1)?,
                    content: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<Chapter>, _>>()?;

        work.content = if chapters.len() == 1 && chapters[0].id == id {
            Content::Single(chapters.remove(0).content)
        } else {
            Content::Chapters(chapters)
        };

        let mut stmt = self
            .conn
            .prepare("SELECT tag, type FROM taggings WHERE work_id = ?1 ORDER BY rowid")?;
        let taggings = stmt
            .query_map(params![id as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<(String, String)>, _>>()?;
        for (tag, kind) in taggings {
            let bucket = match kind.as_str() {
                "rating" => &mut work.rating_tags,
                "warning" => &mut work.warning_tags,
                "category" => &mut work.category_tags,
                "fandom" => &mut work.fandom_tags,
                "character" => &mut work.character_tags,
                "relationship" => &mut work.relationship_tags,
                "freeform" => &mut work.freeform_tags,
                _ => continue,
            };
            bucket.push(tag);
        }

        Ok(Some(work))
    }

    pub fn count_works(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM works", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Runs one bounded increment of compression and reclamation work.
    ///
    /// `budget` caps the wall-clock time the call may spend; `target_load`
    /// is the database-load fraction the maintenance aims for. The extension
    /// commits in small steps, so concurrent writers queue at most one step,
    /// not the whole budget.
    pub fn incremental_maintenance(&self, budget: Duration, target_load: f64) -> Result<()> {
        self.conn.query_row(
            "SELECT zstd_incremental_maintenance(?1, ?2)",
            params![budget.as_secs_f64(), target_load],
            |_| Ok(()),
        )?;
        Ok(())
    }
}
