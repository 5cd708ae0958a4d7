use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub reason: String,
}

/// Cached recommendation list for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationCacheEntry {
    pub user_id: String,
    pub recommendations: Vec<Recommendation>,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Qualifying activity recorded since `generated_at`.
    pub activity_counter: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_auto_refresh_at: Option<DateTime<Utc>>,
}

impl RecommendationCacheEntry {
    /// A fresh entry: counter at zero and `expires_at = generated_at + ttl_days`.
    pub fn generated(
        user_id: impl Into<String>,
        recommendations: Vec<Recommendation>,
        generated_at: DateTime<Utc>,
        ttl_days: i64,
        last_auto_refresh_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            recommendations,
            generated_at,
            expires_at: generated_at + Duration::days(ttl_days),
            activity_counter: 0,
            last_auto_refresh_at,
        }
    }
}
