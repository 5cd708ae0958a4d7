use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::{Result, ShelfError};
use crate::models::{CacheRecord, CuratedFields, IdentityKey, IdentityKeys, NormalizedBook};

use super::repositories::{BookRepository, InsertOutcome, UpdateOutcome};

/// A persisted record together with its staleness at lookup time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedBook {
    pub record: CacheRecord,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertOptions {
    /// Overwrite curated fields even on `ai_enhanced` records.
    pub force: bool,
}

/// Persistence-facing operations for book records: identity lookup, staleness,
/// and insert-or-update that tolerates a concurrent insert of the same key.
#[derive(Clone)]
pub struct CacheStore {
    repo: Arc<dyn BookRepository>,
    stale_after: Duration,
    max_categories: usize,
}

impl CacheStore {
    pub fn new(repo: Arc<dyn BookRepository>, config: &CacheConfig) -> Self {
        Self::with_policy(repo, config.book_ttl_days, config.max_categories)
    }

    pub fn with_policy(repo: Arc<dyn BookRepository>, stale_days: i64, max_categories: usize) -> Self {
        Self {
            repo,
            stale_after: Duration::days(stale_days),
            max_categories,
        }
    }

    /// First hit in isbn13 → isbn10 → primary key → secondary key order. Stale
    /// hits are returned and flagged, never hidden.
    pub fn find_by_identity(&self, keys: &IdentityKeys) -> Result<Option<CachedBook>> {
        Ok(self.find_record(keys)?.map(|record| self.wrap(record)))
    }

    pub fn find_by_id(&self, id: &Uuid) -> Result<Option<CachedBook>> {
        Ok(self.repo.find_by_id(id)?.map(|record| self.wrap(record)))
    }

    pub fn is_stale(&self, record: &CacheRecord) -> bool {
        self.is_stale_at(record, Utc::now())
    }

    pub fn is_stale_at(&self, record: &CacheRecord, now: DateTime<Utc>) -> bool {
        now > record.last_updated + self.stale_after
    }

    pub fn search_local(&self, query: &str, limit: usize) -> Result<Vec<CachedBook>> {
        Ok(self
            .repo
            .search_title(query, limit)?
            .into_iter()
            .map(|record| self.wrap(record))
            .collect())
    }

    pub fn stale_records(&self, limit: usize) -> Result<Vec<CacheRecord>> {
        self.repo.list_stale(Utc::now() - self.stale_after, limit)
    }

    /// Update the record reachable by any of `keys` (or the book's own keys), or
    /// insert a new one. An insert that loses a race on a natural key is retried
    /// once as a lookup of that key and resolves to the winner's record.
    pub fn upsert(
        &self,
        keys: &IdentityKeys,
        book: &NormalizedBook,
        options: UpsertOptions,
    ) -> Result<CacheRecord> {
        book.validate(self.max_categories)?;
        let lookup = combined_keys(keys, book);

        if let Some(existing) = self.find_record(&lookup)? {
            return self.refresh(existing, book, options.force);
        }

        let record = CacheRecord::new(book.clone());
        match self.repo.insert(&record)? {
            InsertOutcome::Inserted(inserted) => {
                debug!(id = %inserted.id, title = %inserted.book.title, "cached new book");
                Ok(inserted)
            }
            InsertOutcome::Conflict(key) => {
                debug!(%key, "insert lost race, resolving existing record");
                let existing = self
                    .find_by_key(&key)?
                    .ok_or(ShelfError::IdentityConflict(key))?;
                self.refresh(existing, book, options.force)
            }
        }
    }

    /// Write curated fields and mark the record so later refreshes keep them.
    /// The curated record must pass the same validation as an upstream one.
    pub fn apply_curation(&self, id: &Uuid, fields: &CuratedFields) -> Result<CacheRecord> {
        let mut record = self
            .repo
            .find_by_id(id)?
            .ok_or_else(|| ShelfError::BookNotFound(id.to_string()))?;
        record.apply_curation(fields);
        record.book.validate(self.max_categories)?;
        match self.repo.update(&record)? {
            UpdateOutcome::Updated => Ok(record),
            UpdateOutcome::Conflict(key) => Err(ShelfError::IdentityConflict(key)),
        }
    }

    fn wrap(&self, record: CacheRecord) -> CachedBook {
        let stale = self.is_stale(&record);
        CachedBook { record, stale }
    }

    fn find_record(&self, keys: &IdentityKeys) -> Result<Option<CacheRecord>> {
        for key in keys.ordered() {
            if let Some(record) = self.find_by_key(&key)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn find_by_key(&self, key: &IdentityKey) -> Result<Option<CacheRecord>> {
        match key {
            IdentityKey::Isbn13(v) => self.repo.find_by_isbn13(v),
            IdentityKey::Isbn10(v) => self.repo.find_by_isbn10(v),
            IdentityKey::CatalogKey(v) => self.repo.find_by_catalog_key(v),
            IdentityKey::SecondaryKey(v) => self.repo.find_by_secondary_key(v),
        }
    }

    fn refresh(&self, existing: CacheRecord, book: &NormalizedBook, force: bool) -> Result<CacheRecord> {
        let mut updated = existing.clone();
        updated.refresh_from(book, force);

        match self.repo.update(&updated)? {
            UpdateOutcome::Updated => Ok(updated),
            UpdateOutcome::Conflict(key) => {
                // The incoming data carries a key another record owns; keep ours.
                warn!(id = %existing.id, %key, "refresh would steal a key from another record");
                restore_key(&mut updated, &existing, &key);
                match self.repo.update(&updated)? {
                    UpdateOutcome::Updated => Ok(updated),
                    UpdateOutcome::Conflict(key) => Err(ShelfError::IdentityConflict(key)),
                }
            }
        }
    }
}

fn combined_keys(keys: &IdentityKeys, book: &NormalizedBook) -> IdentityKeys {
    IdentityKeys {
        isbn13: keys.isbn13.clone().or_else(|| book.isbn13.clone()),
        isbn10: keys.isbn10.clone().or_else(|| book.isbn10.clone()),
        primary_catalog_key: keys
            .primary_catalog_key
            .clone()
            .or_else(|| book.primary_catalog_key.clone()),
        secondary_catalog_key: keys
            .secondary_catalog_key
            .clone()
            .or_else(|| book.secondary_catalog_key.clone()),
    }
}

fn restore_key(updated: &mut CacheRecord, existing: &CacheRecord, key: &IdentityKey) {
    match key {
        IdentityKey::Isbn13(_) => updated.book.isbn13.clone_from(&existing.book.isbn13),
        IdentityKey::Isbn10(_) => updated.book.isbn10.clone_from(&existing.book.isbn10),
        IdentityKey::CatalogKey(_) => updated
            .book
            .primary_catalog_key
            .clone_from(&existing.book.primary_catalog_key),
        IdentityKey::SecondaryKey(_) => updated
            .book
            .secondary_catalog_key
            .clone_from(&existing.book.secondary_catalog_key),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::models::CatalogSource;
    use crate::storage::database::Database;
    use crate::storage::repositories::{Repository, SqliteBookRepository};

    fn store() -> (CacheStore, Database) {
        let db = Database::open_in_memory().unwrap();
        let store = CacheStore::with_policy(Arc::new(db.books()), 30, 5);
        (store, db)
    }

    fn dune() -> NormalizedBook {
        let mut b = NormalizedBook::new(CatalogSource::OpenLibrary, "Dune");
        b.isbn13 = Some("9780441013593".to_string());
        b.primary_catalog_key = Some("OL893415W".to_string());
        b.authors = vec!["Frank Herbert".to_string()];
        b
    }

    #[test]
    fn find_by_identity_prefers_isbn13_over_other_keys() {
        let (store, _db) = store();
        let by_isbn = store.upsert(&IdentityKeys::default(), &dune(), UpsertOptions::default()).unwrap();

        let mut other = NormalizedBook::new(CatalogSource::OpenLibrary, "Dune Messiah");
        other.primary_catalog_key = Some("OL893512W".to_string());
        store.upsert(&IdentityKeys::default(), &other, UpsertOptions::default()).unwrap();

        let keys = IdentityKeys {
            isbn13: Some("9780441013593".to_string()),
            isbn10: None,
            primary_catalog_key: Some("OL893512W".to_string()),
            secondary_catalog_key: None,
        };
        let hit = store.find_by_identity(&keys).unwrap().unwrap();
        assert_eq!(hit.record.id, by_isbn.id);
    }

    #[test]
    fn find_by_identity_falls_through_to_catalog_key() {
        let (store, _db) = store();
        let saved = store.upsert(&IdentityKeys::default(), &dune(), UpsertOptions::default()).unwrap();

        let keys = IdentityKeys {
            isbn13: Some("9780000000002".to_string()),
            isbn10: Some("0000000000".to_string()),
            primary_catalog_key: Some("OL893415W".to_string()),
            secondary_catalog_key: None,
        };
        assert_eq!(store.find_by_identity(&keys).unwrap().unwrap().record.id, saved.id);
        assert!(store.find_by_identity(&IdentityKeys::isbn13("9780000000002")).unwrap().is_none());
    }

    #[test]
    fn stale_hits_are_reported_not_hidden() {
        let (store, db) = store();
        let mut record = CacheRecord::new(dune());
        record.last_updated = Utc::now() - Duration::days(45);
        db.books().insert(&record).unwrap();

        let hit = store.find_by_identity(&IdentityKeys::isbn13("9780441013593")).unwrap().unwrap();
        assert!(hit.stale);
        assert_eq!(hit.record.id, record.id);
    }

    #[test]
    fn staleness_boundary_is_exclusive() {
        let (store, _db) = store();
        let now = Utc::now();
        let mut record = CacheRecord::new(dune());

        record.last_updated = now - Duration::days(30) - Duration::seconds(1);
        assert!(store.is_stale_at(&record, now));

        record.last_updated = now - Duration::days(30) + Duration::seconds(1);
        assert!(!store.is_stale_at(&record, now));
    }

    #[test]
    fn upsert_updates_existing_record_in_place() {
        let (store, db) = store();
        let first = store.upsert(&IdentityKeys::default(), &dune(), UpsertOptions::default()).unwrap();

        let mut refreshed = dune();
        refreshed.isbn10 = Some("0441013597".to_string());
        refreshed.page_count = Some(412);
        let second = store
            .upsert(&IdentityKeys::isbn13("9780441013593"), &refreshed, UpsertOptions::default())
            .unwrap();

        assert_eq!(first.id, second.id);
        assert!(second.last_updated >= first.last_updated);
        assert_eq!(db.books().count().unwrap(), 1);
        let stored = db.books().find_by_isbn10("0441013597").unwrap().unwrap();
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.book.page_count, Some(412));
    }

    #[test]
    fn upsert_rejects_invalid_books() {
        let (store, db) = store();
        let orphan = NormalizedBook::new(CatalogSource::GoogleBooks, "No identity");
        assert!(store.upsert(&IdentityKeys::default(), &orphan, UpsertOptions::default()).is_err());
        assert_eq!(db.books().count().unwrap(), 0);
    }

    fn volume_only() -> NormalizedBook {
        let mut b = NormalizedBook::new(CatalogSource::GoogleBooks, "Dune");
        b.secondary_catalog_key = Some("B1hSG45JCX4C".to_string());
        b.authors = vec!["Frank Herbert".to_string()];
        b
    }

    #[test]
    fn book_known_only_by_secondary_key_is_stored_once() {
        let (store, db) = store();
        let first = store.upsert(&IdentityKeys::default(), &volume_only(), UpsertOptions::default()).unwrap();
        let second = store.upsert(&IdentityKeys::default(), &volume_only(), UpsertOptions::default()).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(db.books().count().unwrap(), 1);
        let keys = IdentityKeys {
            secondary_catalog_key: Some("B1hSG45JCX4C".to_string()),
            ..Default::default()
        };
        assert_eq!(store.find_by_identity(&keys).unwrap().unwrap().record.id, first.id);
    }

    #[test]
    fn curation_rejects_non_four_digit_year() {
        let (store, db) = store();
        let saved = store.upsert(&IdentityKeys::default(), &dune(), UpsertOptions::default()).unwrap();

        let err = store
            .apply_curation(
                &saved.id,
                &CuratedFields {
                    published_year: Some("65".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ShelfError::ValidationError(_)));

        let stored = db.books().find_by_id(&saved.id).unwrap().unwrap();
        assert!(stored.book.published_year.is_none());
        assert!(!stored.ai_enhanced);
    }

    #[test]
    fn curation_rejects_too_many_categories() {
        let (store, _db) = store();
        let saved = store.upsert(&IdentityKeys::default(), &dune(), UpsertOptions::default()).unwrap();
        let fields = CuratedFields {
            categories: Some((0..6).map(|i| format!("c{i}")).collect()),
            ..Default::default()
        };
        assert!(matches!(
            store.apply_curation(&saved.id, &fields),
            Err(ShelfError::ValidationError(_))
        ));
    }

    #[test]
    fn curated_fields_survive_refresh_unless_forced() {
        let (store, _db) = store();
        let saved = store.upsert(&IdentityKeys::default(), &dune(), UpsertOptions::default()).unwrap();
        store
            .apply_curation(
                &saved.id,
                &CuratedFields {
                    description: Some("Curated".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut upstream = dune();
        upstream.description = Some("Upstream".to_string());
        let kept = store.upsert(&IdentityKeys::default(), &upstream, UpsertOptions::default()).unwrap();
        assert_eq!(kept.book.description.as_deref(), Some("Curated"));
        assert!(kept.ai_enhanced);

        let forced = store.upsert(&IdentityKeys::default(), &upstream, UpsertOptions { force: true }).unwrap();
        assert_eq!(forced.book.description.as_deref(), Some("Upstream"));
    }

    #[test]
    fn refresh_that_would_steal_a_key_keeps_its_own() {
        let (store, db) = store();
        let mut messiah = NormalizedBook::new(CatalogSource::OpenLibrary, "Dune Messiah");
        messiah.primary_catalog_key = Some("OL893512W".to_string());
        messiah.isbn10 = Some("0441172695".to_string());
        let messiah_record = store.upsert(&IdentityKeys::default(), &messiah, UpsertOptions::default()).unwrap();

        store.upsert(&IdentityKeys::default(), &dune(), UpsertOptions::default()).unwrap();

        // Upstream wrongly attaches Messiah's ISBN-10 to Dune.
        let mut confused = dune();
        confused.isbn10 = Some("0441172695".to_string());
        let refreshed = store
            .upsert(&IdentityKeys::isbn13("9780441013593"), &confused, UpsertOptions::default())
            .unwrap();

        assert!(refreshed.book.isbn10.is_none());
        assert_eq!(
            db.books().find_by_isbn10("0441172695").unwrap().unwrap().id,
            messiah_record.id
        );
    }

    /// Hides existing rows from the first `blind_lookups` key lookups, the way a
    /// concurrent writer that committed between our lookup and insert would.
    struct RacingRepository {
        inner: SqliteBookRepository,
        blind_lookups: AtomicUsize,
    }

    impl RacingRepository {
        fn blind(&self) -> bool {
            self.blind_lookups
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    impl Repository for RacingRepository {
        type Entity = CacheRecord;
        type Id = Uuid;

        fn find_by_id(&self, id: &Uuid) -> Result<Option<CacheRecord>> {
            self.inner.find_by_id(id)
        }
    }

    impl BookRepository for RacingRepository {
        fn find_by_isbn13(&self, isbn13: &str) -> Result<Option<CacheRecord>> {
            if self.blind() { Ok(None) } else { self.inner.find_by_isbn13(isbn13) }
        }
        fn find_by_isbn10(&self, isbn10: &str) -> Result<Option<CacheRecord>> {
            if self.blind() { Ok(None) } else { self.inner.find_by_isbn10(isbn10) }
        }
        fn find_by_catalog_key(&self, key: &str) -> Result<Option<CacheRecord>> {
            if self.blind() { Ok(None) } else { self.inner.find_by_catalog_key(key) }
        }
        fn find_by_secondary_key(&self, key: &str) -> Result<Option<CacheRecord>> {
            if self.blind() { Ok(None) } else { self.inner.find_by_secondary_key(key) }
        }
        fn insert(&self, record: &CacheRecord) -> Result<InsertOutcome> {
            self.inner.insert(record)
        }
        fn update(&self, record: &CacheRecord) -> Result<UpdateOutcome> {
            self.inner.update(record)
        }
        fn search_title(&self, query: &str, limit: usize) -> Result<Vec<CacheRecord>> {
            self.inner.search_title(query, limit)
        }
        fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<CacheRecord>> {
            self.inner.list_stale(cutoff, limit)
        }
        fn count(&self) -> Result<usize> {
            self.inner.count()
        }
    }

    #[test]
    fn lost_insert_race_resolves_to_existing_record() {
        let db = Database::open_in_memory().unwrap();
        let winner = db.books();
        let existing = CacheRecord::new(dune());
        winner.insert(&existing).unwrap();

        let racing = RacingRepository {
            inner: db.books(),
            blind_lookups: AtomicUsize::new(2),
        };
        let store = CacheStore::with_policy(Arc::new(racing), 30, 5);

        let result = store.upsert(&IdentityKeys::default(), &dune(), UpsertOptions::default()).unwrap();
        assert_eq!(result.id, existing.id);
        assert_eq!(db.books().count().unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_upserts_of_same_isbn_share_one_record() {
        for _ in 0..20 {
            let db = Database::open_in_memory().unwrap();
            let store = CacheStore::with_policy(Arc::new(db.books()), 30, 5);

            let a = {
                let store = store.clone();
                tokio::task::spawn_blocking(move || {
                    store.upsert(&IdentityKeys::default(), &dune(), UpsertOptions::default())
                })
            };
            let b = {
                let store = store.clone();
                tokio::task::spawn_blocking(move || {
                    store.upsert(&IdentityKeys::default(), &dune(), UpsertOptions::default())
                })
            };

            let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
            assert_eq!(a.id, b.id);
            assert_eq!(db.books().count().unwrap(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_upserts_of_same_volume_share_one_record() {
        for _ in 0..20 {
            let db = Database::open_in_memory().unwrap();
            let store = CacheStore::with_policy(Arc::new(db.books()), 30, 5);

            let tasks: Vec<_> = (0..2)
                .map(|_| {
                    let store = store.clone();
                    tokio::task::spawn_blocking(move || {
                        store.upsert(&IdentityKeys::default(), &volume_only(), UpsertOptions::default())
                    })
                })
                .collect();

            let mut ids = Vec::new();
            for task in tasks {
                ids.push(task.await.unwrap().unwrap().id);
            }
            assert_eq!(ids[0], ids[1]);
            assert_eq!(db.books().count().unwrap(), 1);
        }
    }
}
