use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shelfmark_core::CatalogSource;

use crate::error::Result;

pub mod google_books;
pub mod openlibrary;

pub use google_books::GoogleBooksAdapter;
pub use openlibrary::{OpenLibraryAdapter, edition_score};

/// One upstream catalog.
///
/// Adapters only fetch and map; they never retry across sources, never persist,
/// and never throttle. An empty result is `Ok(vec![])`, a missing record is
/// `Ok(None)`, and transport or non-2xx failures are `UpstreamUnavailable`.
#[async_trait]
pub trait CatalogAdapter: Send + Sync {
    fn source(&self) -> CatalogSource;

    async fn search(&self, query: &str, limit: usize, author: Option<&str>) -> Result<Vec<RawRecord>>;

    /// Fetch by the catalog's own key (work key or volume id).
    async fn get_by_identity(&self, key: &str) -> Result<Option<RawRecord>>;

    async fn search_by_isbn(&self, isbn: &str) -> Result<Option<RawRecord>>;
}

/// Engagement counters reported by the works catalog's search index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Engagement {
    pub edition_count: Option<u64>,
    pub already_read: Option<u64>,
    pub currently_reading: Option<u64>,
    pub want_to_read: Option<u64>,
    pub ratings_count: Option<u64>,
}

impl Engagement {
    pub fn is_empty(&self) -> bool {
        self.edition_count.is_none()
            && self.already_read.is_none()
            && self.currently_reading.is_none()
            && self.want_to_read.is_none()
            && self.ratings_count.is_none()
    }
}

/// Catalog data after schema quirks are unwrapped but before any policy
/// (ISBN validation, cover choice, category truncation) is applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source: CatalogSource,
    /// Work key for the works catalog, volume id for the commercial one.
    pub catalog_key: Option<String>,
    pub edition_key: Option<String>,
    pub title: Option<String>,
    pub authors: Vec<String>,
    /// Unvalidated, possibly hyphenated.
    pub isbns: Vec<String>,
    pub publisher: Option<String>,
    pub published_date: Option<String>,
    pub description: Option<String>,
    pub page_count: Option<u32>,
    pub cover_id: Option<i64>,
    /// Ready-made image link (commercial catalog).
    pub image_url: Option<String>,
    pub subjects: Vec<String>,
    pub language: Option<String>,
    pub engagement: Engagement,
    pub ratings_average: Option<f64>,
    pub ratings_count: Option<u32>,
}

impl RawRecord {
    pub fn new(source: CatalogSource) -> Self {
        Self {
            source,
            ..Default::default()
        }
    }
}

pub(crate) fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}

pub(crate) fn str_array(v: &Value, key: &str) -> Vec<String> {
    v.get(key)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn u64_field(v: &Value, key: &str) -> Option<u64> {
    v.get(key).and_then(Value::as_u64)
}
