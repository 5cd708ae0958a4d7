use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: u32 = 3;

pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;
    Ok(())
}

pub fn create_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

pub fn create_books_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS books (
            id                    TEXT PRIMARY KEY,
            source                TEXT NOT NULL,
            primary_catalog_key   TEXT,
            secondary_catalog_key TEXT,
            isbn13                TEXT,
            isbn10                TEXT,
            title                 TEXT NOT NULL,
            authors               TEXT NOT NULL DEFAULT '[]',
            publisher             TEXT,
            published_year        TEXT,
            description           TEXT,
            page_count            INTEGER,
            cover_url             TEXT,
            categories            TEXT NOT NULL DEFAULT '[]',
            language              TEXT,
            popularity_score      REAL,
            ratings_average       REAL,
            ratings_count         INTEGER,
            ai_enhanced           INTEGER NOT NULL DEFAULT 0,
            created_at            TEXT NOT NULL,
            last_updated          TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_books_isbn13      ON books(isbn13);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_books_isbn10      ON books(isbn10);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_books_catalog_key ON books(primary_catalog_key);
        CREATE INDEX IF NOT EXISTS idx_books_title        ON books(title COLLATE NOCASE);
        CREATE INDEX IF NOT EXISTS idx_books_last_updated ON books(last_updated);
        ",
    )?;
    Ok(())
}

/// Secondary-catalog volume ids become a natural key of their own, so a book
/// known only to that catalog still maps to exactly one row.
pub fn create_secondary_key_index(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE UNIQUE INDEX IF NOT EXISTS idx_books_secondary_key ON books(secondary_catalog_key);
        ",
    )?;
    Ok(())
}

pub fn create_recommendation_cache_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS recommendation_cache (
            user_id              TEXT PRIMARY KEY,
            recommendations      TEXT NOT NULL DEFAULT '[]',
            generated_at         TEXT NOT NULL,
            expires_at           TEXT NOT NULL,
            activity_counter     INTEGER NOT NULL DEFAULT 0,
            last_auto_refresh_at TEXT
        );
        ",
    )?;
    Ok(())
}
