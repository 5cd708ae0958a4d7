use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use shelfmark_core::config::RecommendationConfig;
use shelfmark_core::{Recommendation, RecommendationCacheEntry, RecommendationCacheRepository};
use tracing::{debug, info};

use crate::error::{CatalogError, Result};

/// One rating from the user's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingSignal {
    pub title: String,
    pub author: String,
    /// 1 to 5.
    pub rating: u8,
}

/// Reading history owned by the CRUD layer.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn ratings(&self, user_id: &str) -> Result<Vec<RatingSignal>>;
}

/// The text model that turns liked books into suggestions.
#[async_trait]
pub trait RecommendationGenerator: Send + Sync {
    async fn generate(&self, liked: &[RatingSignal], limit: usize) -> Result<Vec<Recommendation>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTrigger {
    Missing,
    Ttl,
    Activity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "trigger", rename_all = "snake_case")]
pub enum CacheState {
    Valid,
    Expired(RefreshTrigger),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecommendationOutcome {
    Cached {
        entry: RecommendationCacheEntry,
    },
    Regenerated {
        entry: RecommendationCacheEntry,
        trigger: RefreshTrigger,
    },
    InsufficientSignal {
        found: usize,
        required: usize,
        message: String,
    },
}

/// `Valid` iff not past `expires_at` and not due for an activity refresh.
/// An activity refresh is due once the counter reaches the threshold and the
/// last one (if any) is at least the minimum interval old; it takes
/// precedence over TTL expiry.
pub fn evaluate(
    policy: &RecommendationConfig,
    entry: Option<&RecommendationCacheEntry>,
    now: DateTime<Utc>,
) -> CacheState {
    let Some(entry) = entry else {
        return CacheState::Expired(RefreshTrigger::Missing);
    };
    let interval = Duration::days(policy.min_refresh_interval_days);
    let refresh_allowed = entry
        .last_auto_refresh_at
        .is_none_or(|last| now - last >= interval);
    if entry.activity_counter >= policy.activity_threshold && refresh_allowed {
        return CacheState::Expired(RefreshTrigger::Activity);
    }
    if now > entry.expires_at {
        return CacheState::Expired(RefreshTrigger::Ttl);
    }
    CacheState::Valid
}

/// Time expiry plus activity-triggered early refresh for per-user recommendations.
pub struct RecommendationCacheManager {
    repo: Arc<dyn RecommendationCacheRepository>,
    signals: Arc<dyn SignalSource>,
    generator: Arc<dyn RecommendationGenerator>,
    config: RecommendationConfig,
}

impl RecommendationCacheManager {
    pub fn new(
        repo: Arc<dyn RecommendationCacheRepository>,
        signals: Arc<dyn SignalSource>,
        generator: Arc<dyn RecommendationGenerator>,
        config: RecommendationConfig,
    ) -> Self {
        Self {
            repo,
            signals,
            generator,
            config,
        }
    }

    pub fn evaluate(&self, entry: Option<&RecommendationCacheEntry>, now: DateTime<Utc>) -> CacheState {
        evaluate(&self.config, entry, now)
    }

    pub fn status(&self, user_id: &str) -> Result<(Option<RecommendationCacheEntry>, CacheState)> {
        let entry = self.repo.find(user_id)?;
        let state = self.evaluate(entry.as_ref(), Utc::now());
        Ok((entry, state))
    }

    pub async fn get_recommendations(&self, user_id: &str) -> Result<RecommendationOutcome> {
        let (entry, state) = self.status(user_id)?;
        let trigger = match state {
            CacheState::Valid => {
                if let Some(entry) = entry {
                    return Ok(RecommendationOutcome::Cached { entry });
                }
                RefreshTrigger::Missing
            }
            CacheState::Expired(trigger) => trigger,
        };

        debug!(user_id, ?trigger, "regenerating recommendations");
        match self.regenerate(user_id, trigger, entry.as_ref()).await {
            Ok(entry) => Ok(RecommendationOutcome::Regenerated { entry, trigger }),
            Err(CatalogError::InsufficientSignal { found, required }) => {
                Ok(RecommendationOutcome::InsufficientSignal {
                    found,
                    required,
                    message: format!(
                        "Rate at least {required} books {} stars or higher to get recommendations \
                         ({found} so far).",
                        self.config.high_rating_floor
                    ),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Generate and cache a new list. Fails with `InsufficientSignal` when the
    /// user has too few high ratings; nothing is written in that case.
    /// The activity counter drops by what `previous` had counted, so activity
    /// recorded during generation is kept for the next evaluation.
    pub async fn regenerate(
        &self,
        user_id: &str,
        trigger: RefreshTrigger,
        previous: Option<&RecommendationCacheEntry>,
    ) -> Result<RecommendationCacheEntry> {
        let liked: Vec<RatingSignal> = self
            .signals
            .ratings(user_id)
            .await?
            .into_iter()
            .filter(|s| s.rating >= self.config.high_rating_floor)
            .collect();
        if liked.len() < self.config.min_signal_events {
            return Err(CatalogError::InsufficientSignal {
                found: liked.len(),
                required: self.config.min_signal_events,
            });
        }

        let mut recommendations = self
            .generator
            .generate(&liked, self.config.max_recommendations)
            .await?;
        recommendations.truncate(self.config.max_recommendations);

        let now = Utc::now();
        let last_auto_refresh_at = match trigger {
            RefreshTrigger::Activity => Some(now),
            RefreshTrigger::Missing | RefreshTrigger::Ttl => previous.and_then(|p| p.last_auto_refresh_at),
        };
        let mut entry = RecommendationCacheEntry::generated(
            user_id,
            recommendations,
            now,
            self.config.ttl_days,
            last_auto_refresh_at,
        );
        let consumed = previous.map_or(0, |p| p.activity_counter);
        entry.activity_counter = self.repo.save_regenerated(&entry, consumed)?;
        info!(user_id, count = entry.recommendations.len(), ?trigger, "cached recommendations");
        Ok(entry)
    }

    /// Count one qualifying activity (e.g. a new rating). `None` if the user has
    /// no cached list yet.
    pub fn record_activity(&self, user_id: &str) -> Result<Option<u32>> {
        Ok(self.repo.increment_activity(user_id)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use shelfmark_core::Database;

    use super::*;

    struct FixedSignals(Vec<u8>);

    #[async_trait]
    impl SignalSource for FixedSignals {
        async fn ratings(&self, _user_id: &str) -> Result<Vec<RatingSignal>> {
            Ok(self
                .0
                .iter()
                .enumerate()
                .map(|(i, rating)| RatingSignal {
                    title: format!("Book {i}"),
                    author: "Someone".to_string(),
                    rating: *rating,
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct CountingGenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RecommendationGenerator for CountingGenerator {
        async fn generate(&self, liked: &[RatingSignal], _limit: usize) -> Result<Vec<Recommendation>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Deliberately over-produce.
            Ok((0..8)
                .map(|i| Recommendation {
                    title: format!("Suggestion {i}"),
                    author: "Author".to_string(),
                    reason: format!("Because you liked {}", liked[0].title),
                })
                .collect())
        }
    }

    fn manager(db: &Database, ratings: Vec<u8>) -> (RecommendationCacheManager, Arc<CountingGenerator>) {
        let generator = Arc::new(CountingGenerator::default());
        let manager = RecommendationCacheManager::new(
            Arc::new(db.recommendations()),
            Arc::new(FixedSignals(ratings)),
            generator.clone(),
            RecommendationConfig::default(),
        );
        (manager, generator)
    }

    fn entry(now: DateTime<Utc>, counter: u32, last_auto: Option<DateTime<Utc>>) -> RecommendationCacheEntry {
        let mut e = RecommendationCacheEntry::generated("u1", Vec::new(), now - Duration::days(1), 5, last_auto);
        e.activity_counter = counter;
        e
    }

    #[test]
    fn fresh_entry_without_activity_is_valid() {
        let db = Database::open_in_memory().unwrap();
        let (m, _) = manager(&db, vec![]);
        let now = Utc::now();
        assert_eq!(m.evaluate(Some(&entry(now, 0, None)), now), CacheState::Valid);
        assert_eq!(m.evaluate(None, now), CacheState::Expired(RefreshTrigger::Missing));
    }

    #[test]
    fn activity_expires_entry_before_ttl() {
        let db = Database::open_in_memory().unwrap();
        let (m, _) = manager(&db, vec![]);
        let now = Utc::now();

        let long_ago = Some(now - Duration::days(8));
        assert_eq!(
            m.evaluate(Some(&entry(now, 3, long_ago)), now),
            CacheState::Expired(RefreshTrigger::Activity)
        );
        assert_eq!(
            m.evaluate(Some(&entry(now, 3, None)), now),
            CacheState::Expired(RefreshTrigger::Activity)
        );
    }

    #[test]
    fn activity_refresh_is_rate_limited() {
        let db = Database::open_in_memory().unwrap();
        let (m, _) = manager(&db, vec![]);
        let now = Utc::now();
        let recent = Some(now - Duration::days(2));
        assert_eq!(m.evaluate(Some(&entry(now, 10, recent)), now), CacheState::Valid);
        assert_eq!(m.evaluate(Some(&entry(now, 2, None)), now), CacheState::Valid);
    }

    #[test]
    fn ttl_expiry() {
        let db = Database::open_in_memory().unwrap();
        let (m, _) = manager(&db, vec![]);
        let now = Utc::now();
        let e = entry(now, 0, None);
        assert_eq!(
            m.evaluate(Some(&e), e.expires_at + Duration::seconds(1)),
            CacheState::Expired(RefreshTrigger::Ttl)
        );
        assert_eq!(m.evaluate(Some(&e), e.expires_at), CacheState::Valid);
    }

    #[tokio::test]
    async fn missing_entry_is_generated_then_served_from_cache() {
        let db = Database::open_in_memory().unwrap();
        let (m, generator) = manager(&db, vec![5, 4, 5, 1]);

        let first = m.get_recommendations("u1").await.unwrap();
        let RecommendationOutcome::Regenerated { entry, trigger } = first else {
            panic!("expected regeneration, got {first:?}");
        };
        assert_eq!(trigger, RefreshTrigger::Missing);
        assert_eq!(entry.recommendations.len(), 5);
        assert_eq!(entry.activity_counter, 0);
        assert_eq!(entry.expires_at, entry.generated_at + Duration::days(5));
        assert_eq!(entry.last_auto_refresh_at, None);

        let second = m.get_recommendations("u1").await.unwrap();
        assert!(matches!(second, RecommendationOutcome::Cached { .. }));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn too_few_high_ratings_is_insufficient_signal() {
        let db = Database::open_in_memory().unwrap();
        let (m, generator) = manager(&db, vec![5, 4, 3, 2, 1]);

        let outcome = m.get_recommendations("u1").await.unwrap();
        match outcome {
            RecommendationOutcome::InsufficientSignal { found, required, message } => {
                assert_eq!((found, required), (2, 3));
                assert!(message.contains("at least 3"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        assert!(db.recommendations().find("u1").unwrap().is_none());
    }

    #[tokio::test]
    async fn activity_refresh_stamps_and_resets_counter() {
        let db = Database::open_in_memory().unwrap();
        let (m, _) = manager(&db, vec![5, 5, 5]);
        m.get_recommendations("u1").await.unwrap();

        for expected in 1..=3 {
            assert_eq!(m.record_activity("u1").unwrap(), Some(expected));
        }
        let outcome = m.get_recommendations("u1").await.unwrap();
        let RecommendationOutcome::Regenerated { entry, trigger } = outcome else {
            panic!("expected activity refresh");
        };
        assert_eq!(trigger, RefreshTrigger::Activity);
        assert_eq!(entry.activity_counter, 0);
        assert_eq!(entry.last_auto_refresh_at, Some(entry.generated_at));

        // Counter trips again, but the last auto refresh is too recent.
        for _ in 0..3 {
            m.record_activity("u1").unwrap();
        }
        assert!(matches!(
            m.get_recommendations("u1").await.unwrap(),
            RecommendationOutcome::Cached { .. }
        ));
    }

    /// Records activity for the user while the list is being generated.
    struct BusyReaderGenerator {
        repo: Arc<dyn RecommendationCacheRepository>,
        bumps: u32,
    }

    #[async_trait]
    impl RecommendationGenerator for BusyReaderGenerator {
        async fn generate(&self, _liked: &[RatingSignal], _limit: usize) -> Result<Vec<Recommendation>> {
            for _ in 0..self.bumps {
                self.repo.increment_activity("u1")?;
            }
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn activity_during_regeneration_is_not_lost() {
        let db = Database::open_in_memory().unwrap();
        let repo: Arc<dyn RecommendationCacheRepository> = Arc::new(db.recommendations());
        let m = RecommendationCacheManager::new(
            repo.clone(),
            Arc::new(FixedSignals(vec![5, 5, 5])),
            Arc::new(BusyReaderGenerator { repo: repo.clone(), bumps: 2 }),
            RecommendationConfig::default(),
        );
        repo.save(&entry(Utc::now(), 0, None)).unwrap();
        for _ in 0..3 {
            m.record_activity("u1").unwrap();
        }

        let RecommendationOutcome::Regenerated { entry, trigger } = m.get_recommendations("u1").await.unwrap() else {
            panic!("expected activity refresh");
        };
        assert_eq!(trigger, RefreshTrigger::Activity);
        assert_eq!(entry.activity_counter, 2);
        assert_eq!(repo.find("u1").unwrap().unwrap().activity_counter, 2);
    }

    #[tokio::test]
    async fn ttl_refresh_keeps_previous_auto_refresh_stamp() {
        let db = Database::open_in_memory().unwrap();
        let (m, _) = manager(&db, vec![5, 5, 5]);
        let stamp = Utc::now() - Duration::days(3);
        let previous = entry(Utc::now(), 0, Some(stamp));

        let regenerated = m.regenerate("u1", RefreshTrigger::Ttl, Some(&previous)).await.unwrap();
        assert_eq!(regenerated.last_auto_refresh_at, Some(stamp));
    }

    #[test]
    fn activity_without_cached_entry_is_not_counted() {
        let db = Database::open_in_memory().unwrap();
        let (m, _) = manager(&db, vec![]);
        assert_eq!(m.record_activity("nobody").unwrap(), None);
    }
}
