use std::sync::Arc;

use rusqlite::{OptionalExtension, Row, params};

use crate::error::Result;
use crate::models::RecommendationCacheEntry;
use crate::storage::database::ConnectionPool;
use crate::storage::{from_db_json, from_db_timestamp, to_db_timestamp};

pub trait RecommendationCacheRepository: Send + Sync {
    fn find(&self, user_id: &str) -> Result<Option<RecommendationCacheEntry>>;
    /// Replace the user's entry wholesale.
    fn save(&self, entry: &RecommendationCacheEntry) -> Result<()>;
    /// Store a regenerated list, subtracting only the `consumed` activity the
    /// regeneration accounted for. Activity recorded while the list was being
    /// generated carries over. Returns the counter as stored.
    fn save_regenerated(&self, entry: &RecommendationCacheEntry, consumed: u32) -> Result<u32>;
    /// Bump the activity counter; `None` when the user has no cached entry.
    fn increment_activity(&self, user_id: &str) -> Result<Option<u32>>;
}

pub struct SqliteRecommendationRepository {
    pool: Arc<ConnectionPool>,
}

impl SqliteRecommendationRepository {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &Row) -> rusqlite::Result<RecommendationCacheEntry> {
        let recs_str: String = row.get(1)?;
        let generated_str: String = row.get(2)?;
        let expires_str: String = row.get(3)?;
        let auto_refresh_str: Option<String> = row.get(5)?;

        Ok(RecommendationCacheEntry {
            user_id: row.get(0)?,
            recommendations: from_db_json(1, &recs_str)?,
            generated_at: from_db_timestamp(2, &generated_str)?,
            expires_at: from_db_timestamp(3, &expires_str)?,
            activity_counter: row.get(4)?,
            last_auto_refresh_at: auto_refresh_str
                .map(|s| from_db_timestamp(5, &s))
                .transpose()?,
        })
    }
}

impl RecommendationCacheRepository for SqliteRecommendationRepository {
    fn find(&self, user_id: &str) -> Result<Option<RecommendationCacheEntry>> {
        let conn = self.pool.get_connection();
        let entry = conn
            .query_row(
                "SELECT user_id, recommendations, generated_at, expires_at,
                        activity_counter, last_auto_refresh_at
                 FROM recommendation_cache WHERE user_id = ?1",
                params![user_id],
                Self::row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn save(&self, entry: &RecommendationCacheEntry) -> Result<()> {
        let recs_json = serde_json::to_string(&entry.recommendations)?;
        let conn = self.pool.get_connection();
        conn.execute(
            "INSERT INTO recommendation_cache
                (user_id, recommendations, generated_at, expires_at, activity_counter,
                 last_auto_refresh_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                recommendations = excluded.recommendations,
                generated_at = excluded.generated_at,
                expires_at = excluded.expires_at,
                activity_counter = excluded.activity_counter,
                last_auto_refresh_at = excluded.last_auto_refresh_at",
            params![
                entry.user_id,
                recs_json,
                to_db_timestamp(&entry.generated_at),
                to_db_timestamp(&entry.expires_at),
                entry.activity_counter,
                entry.last_auto_refresh_at.as_ref().map(to_db_timestamp),
            ],
        )?;
        Ok(())
    }

    fn save_regenerated(&self, entry: &RecommendationCacheEntry, consumed: u32) -> Result<u32> {
        let recs_json = serde_json::to_string(&entry.recommendations)?;
        let conn = self.pool.get_connection();
        let counter = conn.query_row(
            "INSERT INTO recommendation_cache
                (user_id, recommendations, generated_at, expires_at, activity_counter,
                 last_auto_refresh_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
                recommendations = excluded.recommendations,
                generated_at = excluded.generated_at,
                expires_at = excluded.expires_at,
                activity_counter = MAX(recommendation_cache.activity_counter - ?6, 0),
                last_auto_refresh_at = excluded.last_auto_refresh_at
             RETURNING activity_counter",
            params![
                entry.user_id,
                recs_json,
                to_db_timestamp(&entry.generated_at),
                to_db_timestamp(&entry.expires_at),
                entry.last_auto_refresh_at.as_ref().map(to_db_timestamp),
                consumed,
            ],
            |row| row.get(0),
        )?;
        Ok(counter)
    }

    fn increment_activity(&self, user_id: &str) -> Result<Option<u32>> {
        let conn = self.pool.get_connection();
        let counter = conn
            .query_row(
                "UPDATE recommendation_cache
                 SET activity_counter = activity_counter + 1
                 WHERE user_id = ?1
                 RETURNING activity_counter",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(counter)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::Recommendation;
    use crate::storage::database::Database;

    fn entry(user: &str) -> RecommendationCacheEntry {
        RecommendationCacheEntry::generated(
            user,
            vec![Recommendation {
                title: "Hyperion".to_string(),
                author: "Dan Simmons".to_string(),
                reason: "You rated Dune highly".to_string(),
            }],
            Utc::now(),
            5,
            None,
        )
    }

    #[test]
    fn save_then_find_roundtrip() {
        let repo = Database::open_in_memory().unwrap().recommendations();
        let e = entry("reader-1");
        repo.save(&e).unwrap();
        assert_eq!(repo.find("reader-1").unwrap(), Some(e));
        assert!(repo.find("reader-2").unwrap().is_none());
    }

    #[test]
    fn save_replaces_existing_entry() {
        let repo = Database::open_in_memory().unwrap().recommendations();
        let mut e = entry("reader-1");
        repo.save(&e).unwrap();
        repo.increment_activity("reader-1").unwrap();

        e.recommendations.clear();
        e.last_auto_refresh_at = Some(Utc::now());
        repo.save(&e).unwrap();

        let stored = repo.find("reader-1").unwrap().unwrap();
        assert!(stored.recommendations.is_empty());
        assert_eq!(stored.activity_counter, 0);
        assert_eq!(stored.last_auto_refresh_at, e.last_auto_refresh_at);
    }

    #[test]
    fn increment_activity_counts_up() {
        let repo = Database::open_in_memory().unwrap().recommendations();
        repo.save(&entry("reader-1")).unwrap();

        assert_eq!(repo.increment_activity("reader-1").unwrap(), Some(1));
        assert_eq!(repo.increment_activity("reader-1").unwrap(), Some(2));
        assert_eq!(repo.increment_activity("nobody").unwrap(), None);
    }

    #[test]
    fn save_regenerated_keeps_unconsumed_activity() {
        let repo = Database::open_in_memory().unwrap().recommendations();
        repo.save(&entry("reader-1")).unwrap();
        for _ in 0..5 {
            repo.increment_activity("reader-1").unwrap();
        }

        // The regeneration was triggered after 3; two more arrived meanwhile.
        let counter = repo.save_regenerated(&entry("reader-1"), 3).unwrap();
        assert_eq!(counter, 2);
        assert_eq!(repo.find("reader-1").unwrap().unwrap().activity_counter, 2);
    }

    #[test]
    fn save_regenerated_inserts_with_zero_counter() {
        let repo = Database::open_in_memory().unwrap().recommendations();
        assert_eq!(repo.save_regenerated(&entry("reader-1"), 0).unwrap(), 0);
        assert!(repo.find("reader-1").unwrap().is_some());
    }
}
