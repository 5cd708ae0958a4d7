use shelfmark_core::{CatalogSource, ShelfError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{catalog} unavailable: {reason}")]
    UpstreamUnavailable {
        catalog: CatalogSource,
        reason: String,
    },

    #[error("{catalog} has no record for {key}")]
    NotFound { catalog: CatalogSource, key: String },

    #[error("malformed response from {catalog}: {reason}")]
    MalformedUpstreamResponse {
        catalog: CatalogSource,
        reason: String,
    },

    #[error("all catalogs unavailable for {query:?}: {}", failures.join("; "))]
    AllSourcesUnavailable { query: String, failures: Vec<String> },

    #[error("not enough reading history: {found} qualifying ratings, {required} needed")]
    InsufficientSignal { found: usize, required: usize },

    #[error("invalid ISBN: {0}")]
    InvalidIsbn(String),

    #[error("store task failed: {0}")]
    StoreTask(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Store(#[from] ShelfError),
}

impl CatalogError {
    pub fn unavailable(catalog: CatalogSource, reason: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            catalog,
            reason: reason.into(),
        }
    }

    pub fn malformed(catalog: CatalogSource, reason: impl Into<String>) -> Self {
        Self::MalformedUpstreamResponse {
            catalog,
            reason: reason.into(),
        }
    }

    /// Failures a caller recovers from by trying another source.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable { .. } | Self::MalformedUpstreamResponse { .. } | Self::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;
