//! Shelfmark catalogs: Open Library and Google Books adapters, normalization,
//! cross-catalog dedup, relevance ranking, and the cache-first search and
//! resolve flows.

pub mod error;
pub mod http;
pub mod identifiers;
pub mod sources;
pub mod normalize;
pub mod dedup;
pub mod relevance;
pub mod search;
pub mod resolver;
pub mod recommend;
mod store;

pub use error::{CatalogError, Result};
pub use normalize::Normalizer;
pub use recommend::{
    CacheState, RatingSignal, RecommendationCacheManager, RecommendationGenerator, RecommendationOutcome,
    RefreshTrigger, SignalSource, evaluate,
};
pub use resolver::{BookResolver, RefreshReport, Resolved, ResolvedFrom};
pub use search::{
    SearchHit, SearchOrchestrator, SearchOutcome, SearchRequest, SearchSession, SearchStrategy, SessionOutcome,
};
pub use sources::{CatalogAdapter, GoogleBooksAdapter, OpenLibraryAdapter, RawRecord};
