use once_cell::sync::Lazy;
use regex::Regex;
use shelfmark_core::{AppConfig, CatalogSource, NormalizedBook};

use crate::error::{CatalogError, Result};
use crate::identifiers::best_isbns;
use crate::sources::{Engagement, RawRecord};

static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4})\b").expect("valid regex"));

/// Subject tags at or beyond this many characters are catalog noise.
const MAX_CATEGORY_LEN: usize = 50;

/// Weights for edition count, already-read, currently-reading, want-to-read and
/// rating count.
pub const POPULARITY_WEIGHTS: [f64; 5] = [10.0, 5.0, 3.0, 2.0, 1.0];

/// Converts adapter output into [`NormalizedBook`]. Deterministic: the same raw
/// record always normalizes to the same book.
#[derive(Debug, Clone)]
pub struct Normalizer {
    covers_url: String,
    max_categories: usize,
}

impl Normalizer {
    pub fn new(covers_url: impl Into<String>, max_categories: usize) -> Self {
        Self {
            covers_url: covers_url.into().trim_end_matches('/').to_string(),
            max_categories,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.catalogs.covers_url.clone(), config.cache.max_categories)
    }

    pub fn normalize(&self, raw: &RawRecord) -> Result<NormalizedBook> {
        let title = raw
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                CatalogError::malformed(
                    raw.source,
                    format!("record {} has no title", raw.catalog_key.as_deref().unwrap_or("?")),
                )
            })?;

        let (isbn13, isbn10) = best_isbns(raw.isbns.iter().map(String::as_str));
        let cover_url = self.cover_url(raw, isbn13.as_deref(), isbn10.as_deref());

        let mut book = NormalizedBook::new(raw.source, title);
        match raw.source {
            CatalogSource::OpenLibrary => book.primary_catalog_key = raw.catalog_key.clone(),
            CatalogSource::GoogleBooks => book.secondary_catalog_key = raw.catalog_key.clone(),
        }
        book.isbn13 = isbn13;
        book.isbn10 = isbn10;
        book.authors = raw.authors.clone();
        book.publisher = raw.publisher.clone();
        book.published_year = raw.published_date.as_deref().and_then(extract_year);
        book.description = raw.description.clone();
        book.page_count = raw.page_count.filter(|n| *n > 0);
        book.cover_url = cover_url;
        book.categories = truncate_categories(&raw.subjects, self.max_categories);
        book.language = raw.language.clone();
        book.popularity_score = popularity_score(&raw.engagement);
        book.ratings_average = raw.ratings_average;
        book.ratings_count = raw.ratings_count.or_else(|| {
            raw.engagement.ratings_count.and_then(|n| u32::try_from(n).ok())
        });
        Ok(book)
    }

    /// First available of: cover id (or the catalog's own image link), edition
    /// key, ISBN-13, ISBN-10.
    pub fn cover_url(&self, raw: &RawRecord, isbn13: Option<&str>, isbn10: Option<&str>) -> Option<String> {
        if let Some(id) = raw.cover_id {
            return Some(format!("{}/b/id/{id}-L.jpg", self.covers_url));
        }
        if let Some(link) = &raw.image_url {
            return Some(link.clone());
        }
        if let Some(edition) = &raw.edition_key {
            return Some(format!("{}/b/olid/{edition}-L.jpg", self.covers_url));
        }
        isbn13
            .or(isbn10)
            .map(|isbn| format!("{}/b/isbn/{isbn}-L.jpg", self.covers_url))
    }
}

/// First `max` distinct entries shorter than 50 characters.
pub fn truncate_categories(subjects: &[String], max: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(max);
    for subject in subjects {
        if out.len() == max {
            break;
        }
        let subject = subject.trim();
        if subject.is_empty() || subject.chars().count() >= MAX_CATEGORY_LEN {
            continue;
        }
        if !out.iter().any(|s| s == subject) {
            out.push(subject.to_string());
        }
    }
    out
}

/// Weighted engagement sum; `None` when the source reports no engagement at all.
pub fn popularity_score(engagement: &Engagement) -> Option<f64> {
    if engagement.is_empty() {
        return None;
    }
    let signals = [
        engagement.edition_count,
        engagement.already_read,
        engagement.currently_reading,
        engagement.want_to_read,
        engagement.ratings_count,
    ];
    Some(
        signals
            .iter()
            .zip(POPULARITY_WEIGHTS)
            .map(|(signal, weight)| signal.unwrap_or(0) as f64 * weight)
            .sum(),
    )
}

/// First standalone 4-digit run: `"August 1990"` → `"1990"`, `"2004-09-30"` → `"2004"`.
pub fn extract_year(date: &str) -> Option<String> {
    YEAR_RE.captures(date).map(|c| c[1].to_string())
}
