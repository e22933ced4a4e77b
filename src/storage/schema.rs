//! Database schema and compression configuration

/// SQL schema for the store: works, their chapters, and tag associations,
/// plus the secondary indexes backing range and sort queries.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE works (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    author TEXT NOT NULL,
    author_pseud TEXT NOT NULL,
    summary TEXT,
    notes TEXT,
    published INTEGER NOT NULL,
    updated INTEGER,
    words INTEGER NOT NULL,
    chapters_published INTEGER NOT NULL,
    chapters_total INTEGER,
    language TEXT NOT NULL,
    hits INTEGER NOT NULL,
    kudos INTEGER NOT NULL,
    comments INTEGER NOT NULL,
    bookmarks INTEGER NOT NULL
);

CREATE TABLE chapters (
    id INTEGER PRIMARY KEY,
    work_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    FOREIGN KEY (work_id) REFERENCES works (id)
);

CREATE TABLE taggings (
    tag TEXT NOT NULL,
    work_id INTEGER NOT NULL,
    type TEXT NOT NULL,
    PRIMARY KEY (tag, work_id),
    FOREIGN KEY (work_id) REFERENCES works (id)
);

CREATE INDEX works_by_published ON works (published);
CREATE INDEX works_by_updated ON works (updated);
CREATE INDEX works_by_words ON works (words);
CREATE INDEX works_by_language ON works (language);
CREATE INDEX works_by_hits ON works (hits);
CREATE INDEX works_by_kudos ON works (kudos);
CREATE INDEX works_by_comments ON works (comments);
CREATE INDEX works_by_bookmarks ON works (bookmarks);

CREATE INDEX chapters_by_work_id ON chapters (work_id);

CREATE INDEX taggings_by_work_id ON taggings (work_id);
CREATE INDEX taggings_by_tag ON taggings (tag);
"#;

/// Enables transparent zstd compression of chapter content. The dictionary
/// chooser keys on the owning work's language, so each dictionary trains on
/// naturally clustered text.
pub const ZSTD_TRANSPARENT_SQL: &str = r#"
SELECT zstd_enable_transparent('{
    "table": "chapters",
    "column": "content",
    "compression_level": 19,
    "dict_chooser": "SELECT language FROM works WHERE id = work_id LIMIT 1"
}');
"#;

/// Initializes the database schema and the compression layer.
///
/// Idempotent: an already-initialized database is left untouched, since the
/// compression layer must only be enabled once.
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    let initialized: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = 'works'",
        [],
        |row| row.get(0),
    )?;
    if initialized > 0 {
        return Ok(());
    }

    conn.execute_batch(SCHEMA_SQL)?;
    conn.query_row(ZSTD_TRANSPARENT_SQL, [], |_| Ok(()))?;
    Ok(())
}
