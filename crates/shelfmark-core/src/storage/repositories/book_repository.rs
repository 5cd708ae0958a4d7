use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{ErrorCode, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::error::{Result, ShelfError};
use crate::models::{CacheRecord, CatalogSource, IdentityKey, NormalizedBook};
use crate::storage::database::ConnectionPool;
use crate::storage::{from_db_json, from_db_timestamp, to_db_timestamp};

use super::Repository;

/// Result of an optimistic insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(CacheRecord),
    /// Another record already owns this natural key.
    Conflict(IdentityKey),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Updated,
    Conflict(IdentityKey),
}

pub trait BookRepository: Repository<Entity = CacheRecord, Id = Uuid> + Send + Sync {
    fn find_by_isbn13(&self, isbn13: &str) -> Result<Option<CacheRecord>>;
    fn find_by_isbn10(&self, isbn10: &str) -> Result<Option<CacheRecord>>;
    fn find_by_catalog_key(&self, key: &str) -> Result<Option<CacheRecord>>;
    fn find_by_secondary_key(&self, key: &str) -> Result<Option<CacheRecord>>;
    fn insert(&self, record: &CacheRecord) -> Result<InsertOutcome>;
    fn update(&self, record: &CacheRecord) -> Result<UpdateOutcome>;
    /// Case-insensitive substring match over title and authors.
    fn search_title(&self, query: &str, limit: usize) -> Result<Vec<CacheRecord>>;
    /// Records last written before `cutoff`, oldest first.
    fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<CacheRecord>>;
    fn count(&self) -> Result<usize>;
}

const SELECT_COLUMNS: &str = "SELECT id, source, primary_catalog_key, secondary_catalog_key,
        isbn13, isbn10, title, authors, publisher, published_year, description,
        page_count, cover_url, categories, language, popularity_score,
        ratings_average, ratings_count, ai_enhanced, created_at, last_updated
    FROM books";

pub struct SqliteBookRepository {
    pool: Arc<ConnectionPool>,
}

impl SqliteBookRepository {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<CacheRecord> {
        let id_str: String = row.get(0)?;
        let source_str: String = row.get(1)?;
        let authors_str: String = row.get(7)?;
        let categories_str: String = row.get(13)?;
        let created_str: String = row.get(19)?;
        let updated_str: String = row.get(20)?;

        let book = NormalizedBook {
            source: CatalogSource::from_str(&source_str).unwrap_or_default(),
            primary_catalog_key: row.get(2)?,
            secondary_catalog_key: row.get(3)?,
            isbn13: row.get(4)?,
            isbn10: row.get(5)?,
            title: row.get(6)?,
            authors: from_db_json(7, &authors_str)?,
            publisher: row.get(8)?,
            published_year: row.get(9)?,
            description: row.get(10)?,
            page_count: row.get(11)?,
            cover_url: row.get(12)?,
            categories: from_db_json(13, &categories_str)?,
            language: row.get(14)?,
            popularity_score: row.get(15)?,
            ratings_average: row.get(16)?,
            ratings_count: row.get(17)?,
        };

        Ok(CacheRecord {
            id: Uuid::parse_str(&id_str).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
            })?,
            book,
            ai_enhanced: row.get(18)?,
            created_at: from_db_timestamp(19, &created_str)?,
            last_updated: from_db_timestamp(20, &updated_str)?,
        })
    }

    fn find_one(&self, column: &str, value: &str) -> Result<Option<CacheRecord>> {
        let conn = self.pool.get_connection();
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE {column} = ?1"))?;
        let record = stmt
            .query_row(params![value], Self::row_to_record)
            .optional()?;
        Ok(record)
    }
}

/// Map a UNIQUE violation on a natural key to the key that collided.
fn unique_violation(err: &rusqlite::Error, record: &CacheRecord) -> Option<IdentityKey> {
    let rusqlite::Error::SqliteFailure(code, Some(message)) = err else {
        return None;
    };
    if code.code != ErrorCode::ConstraintViolation {
        return None;
    }
    let book = &record.book;
    if message.contains("books.isbn13") {
        book.isbn13.clone().map(IdentityKey::Isbn13)
    } else if message.contains("books.isbn10") {
        book.isbn10.clone().map(IdentityKey::Isbn10)
    } else if message.contains("books.primary_catalog_key") {
        book.primary_catalog_key.clone().map(IdentityKey::CatalogKey)
    } else if message.contains("books.secondary_catalog_key") {
        book.secondary_catalog_key.clone().map(IdentityKey::SecondaryKey)
    } else {
        None
    }
}

impl Repository for SqliteBookRepository {
    type Entity = CacheRecord;
    type Id = Uuid;

    fn find_by_id(&self, id: &Self::Id) -> Result<Option<Self::Entity>> {
        self.find_one("id", &id.to_string())
    }
}

impl BookRepository for SqliteBookRepository {
    fn find_by_isbn13(&self, isbn13: &str) -> Result<Option<CacheRecord>> {
        self.find_one("isbn13", isbn13)
    }

    fn find_by_isbn10(&self, isbn10: &str) -> Result<Option<CacheRecord>> {
        self.find_one("isbn10", isbn10)
    }

    fn find_by_catalog_key(&self, key: &str) -> Result<Option<CacheRecord>> {
        self.find_one("primary_catalog_key", key)
    }

    fn find_by_secondary_key(&self, key: &str) -> Result<Option<CacheRecord>> {
        self.find_one("secondary_catalog_key", key)
    }

    fn insert(&self, record: &CacheRecord) -> Result<InsertOutcome> {
        let book = &record.book;
        let authors_json = serde_json::to_string(&book.authors)?;
        let categories_json = serde_json::to_string(&book.categories)?;

        let conn = self.pool.get_connection();
        let result = conn.execute(
            "INSERT INTO books
                (id, source, primary_catalog_key, secondary_catalog_key, isbn13, isbn10,
                 title, authors, publisher, published_year, description, page_count,
                 cover_url, categories, language, popularity_score, ratings_average,
                 ratings_count, ai_enhanced, created_at, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21)",
            params![
                record.id.to_string(),
                book.source.as_str(),
                book.primary_catalog_key,
                book.secondary_catalog_key,
                book.isbn13,
                book.isbn10,
                book.title,
                authors_json,
                book.publisher,
                book.published_year,
                book.description,
                book.page_count,
                book.cover_url,
                categories_json,
                book.language,
                book.popularity_score,
                book.ratings_average,
                book.ratings_count,
                record.ai_enhanced,
                to_db_timestamp(&record.created_at),
                to_db_timestamp(&record.last_updated),
            ],
        );

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted(record.clone())),
            Err(err) => match unique_violation(&err, record) {
                Some(key) => Ok(InsertOutcome::Conflict(key)),
                None => Err(ShelfError::Database(err)),
            },
        }
    }

    fn update(&self, record: &CacheRecord) -> Result<UpdateOutcome> {
        let book = &record.book;
        let authors_json = serde_json::to_string(&book.authors)?;
        let categories_json = serde_json::to_string(&book.categories)?;

        let conn = self.pool.get_connection();
        let result = conn.execute(
            "UPDATE books SET
                source = ?2, primary_catalog_key = ?3, secondary_catalog_key = ?4,
                isbn13 = ?5, isbn10 = ?6, title = ?7, authors = ?8, publisher = ?9,
                published_year = ?10, description = ?11, page_count = ?12, cover_url = ?13,
                categories = ?14, language = ?15, popularity_score = ?16,
                ratings_average = ?17, ratings_count = ?18, ai_enhanced = ?19,
                last_updated = ?20
             WHERE id = ?1",
            params![
                record.id.to_string(),
                book.source.as_str(),
                book.primary_catalog_key,
                book.secondary_catalog_key,
                book.isbn13,
                book.isbn10,
                book.title,
                authors_json,
                book.publisher,
                book.published_year,
                book.description,
                book.page_count,
                book.cover_url,
                categories_json,
                book.language,
                book.popularity_score,
                book.ratings_average,
                book.ratings_count,
                record.ai_enhanced,
                to_db_timestamp(&record.last_updated),
            ],
        );

        match result {
            Ok(0) => Err(ShelfError::BookNotFound(record.id.to_string())),
            Ok(_) => Ok(UpdateOutcome::Updated),
            Err(err) => match unique_violation(&err, record) {
                Some(key) => Ok(UpdateOutcome::Conflict(key)),
                None => Err(ShelfError::Database(err)),
            },
        }
    }

    fn search_title(&self, query: &str, limit: usize) -> Result<Vec<CacheRecord>> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let escaped = trimmed
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("%{escaped}%");

        let conn = self.pool.get_connection();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS}
             WHERE title LIKE ?1 ESCAPE '\\' OR authors LIKE ?1 ESCAPE '\\'
             ORDER BY COALESCE(popularity_score, 0) DESC, last_updated DESC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![pattern, limit as i64], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<CacheRecord>> {
        let conn = self.pool.get_connection();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE last_updated < ?1 ORDER BY last_updated ASC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(
                params![to_db_timestamp(&cutoff), limit as i64],
                Self::row_to_record,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.pool.get_connection();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM books", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
