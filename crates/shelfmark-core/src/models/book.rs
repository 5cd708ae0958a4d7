use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShelfError};

/// Upstream catalog a record was fetched from.
///
/// The works catalog (Open Library) is the higher-trust source: when two records
/// describe the same work, its fields win and the commercial catalog only backfills.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogSource {
    #[default]
    OpenLibrary,
    GoogleBooks,
}

impl CatalogSource {
    /// Higher value wins during merge.
    pub fn trust(&self) -> u8 {
        match self {
            Self::OpenLibrary => 2,
            Self::GoogleBooks => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenLibrary => "open_library",
            Self::GoogleBooks => "google_books",
        }
    }
}

impl fmt::Display for CatalogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CatalogSource {
    type Err = ShelfError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open_library" => Ok(Self::OpenLibrary),
            "google_books" => Ok(Self::GoogleBooks),
            other => Err(ShelfError::ValidationError(format!("unknown catalog source: {other}"))),
        }
    }
}

/// Canonical book shape shared by every catalog adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBook {
    pub source: CatalogSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_catalog_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_catalog_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isbn13: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isbn10: Option<String>,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_year: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub popularity_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratings_average: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratings_count: Option<u32>,
}

impl NormalizedBook {
    pub fn new(source: CatalogSource, title: impl Into<String>) -> Self {
        Self {
            source,
            primary_catalog_key: None,
            secondary_catalog_key: None,
            isbn13: None,
            isbn10: None,
            title: title.into(),
            authors: Vec::new(),
            publisher: None,
            published_year: None,
            description: None,
            page_count: None,
            cover_url: None,
            categories: Vec::new(),
            language: None,
            popularity_score: None,
            ratings_average: None,
            ratings_count: None,
        }
    }

    /// True when at least one catalog key or ISBN anchors this record.
    pub fn is_identifiable(&self) -> bool {
        self.primary_catalog_key.is_some()
            || self.secondary_catalog_key.is_some()
            || self.isbn13.is_some()
            || self.isbn10.is_some()
    }

    pub fn identity_keys(&self) -> IdentityKeys {
        IdentityKeys {
            isbn13: self.isbn13.clone(),
            isbn10: self.isbn10.clone(),
            primary_catalog_key: self.primary_catalog_key.clone(),
            secondary_catalog_key: self.secondary_catalog_key.clone(),
        }
    }

    /// Check the invariants a record must satisfy before it is persisted.
    pub fn validate(&self, max_categories: usize) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(ShelfError::ValidationError("title must not be empty".to_string()));
        }
        if !self.is_identifiable() {
            return Err(ShelfError::ValidationError(format!(
                "\"{}\" has no catalog key or ISBN",
                self.title
            )));
        }
        if self.categories.len() > max_categories {
            return Err(ShelfError::ValidationError(format!(
                "{} categories exceeds cap of {max_categories}",
                self.categories.len()
            )));
        }
        if let Some(year) = &self.published_year
            && !is_four_digit_year(year)
        {
            return Err(ShelfError::ValidationError(format!(
                "published year {year:?} is not a 4-digit year"
            )));
        }
        Ok(())
    }
}

pub fn is_four_digit_year(value: &str) -> bool {
    value.len() == 4 && value.bytes().all(|b| b.is_ascii_digit())
}

/// The keys a persisted record can be reached by, in lookup priority order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeys {
    pub isbn13: Option<String>,
    pub isbn10: Option<String>,
    pub primary_catalog_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_catalog_key: Option<String>,
}

impl IdentityKeys {
    pub fn isbn13(value: impl Into<String>) -> Self {
        Self {
            isbn13: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn catalog_key(value: impl Into<String>) -> Self {
        Self {
            primary_catalog_key: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.isbn13.is_none()
            && self.isbn10.is_none()
            && self.primary_catalog_key.is_none()
            && self.secondary_catalog_key.is_none()
    }

    /// isbn13, then isbn10, then primary catalog key, then secondary catalog key.
    pub fn ordered(&self) -> Vec<IdentityKey> {
        let mut keys = Vec::with_capacity(4);
        if let Some(v) = &self.isbn13 {
            keys.push(IdentityKey::Isbn13(v.clone()));
        }
        if let Some(v) = &self.isbn10 {
            keys.push(IdentityKey::Isbn10(v.clone()));
        }
        if let Some(v) = &self.primary_catalog_key {
            keys.push(IdentityKey::CatalogKey(v.clone()));
        }
        if let Some(v) = &self.secondary_catalog_key {
            keys.push(IdentityKey::SecondaryKey(v.clone()));
        }
        keys
    }
}

/// A single natural key with a uniqueness constraint in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum IdentityKey {
    Isbn13(String),
    Isbn10(String),
    CatalogKey(String),
    SecondaryKey(String),
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Isbn13(v) => write!(f, "isbn13:{v}"),
            Self::Isbn10(v) => write!(f, "isbn10:{v}"),
            Self::CatalogKey(v) => write!(f, "catalog_key:{v}"),
            Self::SecondaryKey(v) => write!(f, "secondary_key:{v}"),
        }
    }
}
