use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::book::NormalizedBook;

/// Persisted form of a [`NormalizedBook`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub book: NormalizedBook,
    /// Set once a curation pass has rewritten the descriptive fields.
    pub ai_enhanced: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl CacheRecord {
    pub fn new(book: NormalizedBook) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            book,
            ai_enhanced: false,
            created_at: now,
            last_updated: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// Fold freshly fetched data into this record.
    ///
    /// Present incoming values replace stored ones; absent incoming values never
    /// clear stored ones. Curated fields (description, categories, publisher,
    /// published year) are left alone on an `ai_enhanced` record unless `force`.
    pub fn refresh_from(&mut self, incoming: &NormalizedBook, force: bool) {
        let protect = self.ai_enhanced && !force;
        let book = &mut self.book;

        replace_if_some(&mut book.primary_catalog_key, &incoming.primary_catalog_key);
        replace_if_some(&mut book.secondary_catalog_key, &incoming.secondary_catalog_key);
        replace_if_some(&mut book.isbn13, &incoming.isbn13);
        replace_if_some(&mut book.isbn10, &incoming.isbn10);

        if !incoming.title.trim().is_empty() {
            book.title = incoming.title.clone();
        }
        if !incoming.authors.is_empty() {
            book.authors = incoming.authors.clone();
        }
        replace_if_some(&mut book.page_count, &incoming.page_count);
        replace_if_some(&mut book.cover_url, &incoming.cover_url);
        replace_if_some(&mut book.language, &incoming.language);
        replace_if_some(&mut book.popularity_score, &incoming.popularity_score);
        replace_if_some(&mut book.ratings_average, &incoming.ratings_average);
        replace_if_some(&mut book.ratings_count, &incoming.ratings_count);

        if !protect {
            replace_if_some(&mut book.description, &incoming.description);
            replace_if_some(&mut book.publisher, &incoming.publisher);
            replace_if_some(&mut book.published_year, &incoming.published_year);
            if !incoming.categories.is_empty() {
                book.categories = incoming.categories.clone();
            }
        }
        if force {
            self.ai_enhanced = false;
        }

        self.touch();
    }

    /// Overwrite curated fields and mark the record as curated.
    pub fn apply_curation(&mut self, fields: &CuratedFields) {
        if let Some(description) = &fields.description {
            self.book.description = Some(description.clone());
        }
        if let Some(categories) = &fields.categories {
            self.book.categories = categories.clone();
        }
        if let Some(publisher) = &fields.publisher {
            self.book.publisher = Some(publisher.clone());
        }
        if let Some(year) = &fields.published_year {
            self.book.published_year = Some(year.clone());
        }
        self.ai_enhanced = true;
        self.touch();
    }
}

fn replace_if_some<T: Clone>(target: &mut Option<T>, incoming: &Option<T>) {
    if incoming.is_some() {
        target.clone_from(incoming);
    }
}

/// Output of a curation pass (human or generative model).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CuratedFields {
    pub description: Option<String>,
    pub categories: Option<Vec<String>>,
    pub publisher: Option<String>,
    pub published_year: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CatalogSource;

    fn stored() -> CacheRecord {
        let mut book = NormalizedBook::new(CatalogSource::OpenLibrary, "Dune");
        book.primary_catalog_key = Some("OL893415W".to_string());
        book.description = Some("Curated blurb".to_string());
        book.categories = vec!["Science Fiction".to_string()];
        book.publisher = Some("Chilton".to_string());
        book.published_year = Some("1965".to_string());
        book.page_count = Some(412);
        CacheRecord::new(book)
    }

    fn incoming() -> NormalizedBook {
        let mut book = NormalizedBook::new(CatalogSource::OpenLibrary, "Dune");
        book.isbn13 = Some("9780441013593".to_string());
        book.description = Some("Upstream blurb".to_string());
        book.categories = vec!["Fiction".to_string()];
        book.publisher = Some("Ace".to_string());
        book.published_year = Some("1990".to_string());
        book
    }

    #[test]
    fn refresh_never_clears_present_fields() {
        let mut record = stored();
        record.refresh_from(&incoming(), false);
        assert_eq!(record.book.page_count, Some(412));
        assert_eq!(record.book.primary_catalog_key.as_deref(), Some("OL893415W"));
        assert_eq!(record.book.isbn13.as_deref(), Some("9780441013593"));
        assert_eq!(record.book.description.as_deref(), Some("Upstream blurb"));
    }

    #[test]
    fn refresh_skips_curated_fields_on_enhanced_record() {
        let mut record = stored();
        record.ai_enhanced = true;
        record.refresh_from(&incoming(), false);

        assert_eq!(record.book.description.as_deref(), Some("Curated blurb"));
        assert_eq!(record.book.categories, vec!["Science Fiction"]);
        assert_eq!(record.book.publisher.as_deref(), Some("Chilton"));
        assert_eq!(record.book.published_year.as_deref(), Some("1965"));
        assert!(record.ai_enhanced);
        assert_eq!(record.book.isbn13.as_deref(), Some("9780441013593"));
    }

    #[test]
    fn forced_refresh_overwrites_curated_fields() {
        let mut record = stored();
        record.ai_enhanced = true;
        record.refresh_from(&incoming(), true);

        assert_eq!(record.book.description.as_deref(), Some("Upstream blurb"));
        assert_eq!(record.book.publisher.as_deref(), Some("Ace"));
        assert!(!record.ai_enhanced);
    }

    #[test]
    fn curation_marks_record_enhanced() {
        let mut record = stored();
        record.apply_curation(&CuratedFields {
            description: Some("A desert planet epic.".to_string()),
            ..Default::default()
        });
        assert!(record.ai_enhanced);
        assert_eq!(record.book.description.as_deref(), Some("A desert planet epic."));
        assert_eq!(record.book.publisher.as_deref(), Some("Chilton"));
    }
}
