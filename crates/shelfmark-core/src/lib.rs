pub mod config;
pub mod error;
pub mod models;
pub mod storage;

pub use config::AppConfig;
pub use error::{ExitCode, Result, ShelfError};
pub use models::*;

pub use storage::cache_store::{CacheStore, CachedBook, UpsertOptions};
pub use storage::database::{ConnectionPool, Database, open_database, open_in_memory};
pub use storage::repositories::{
    BookRepository, InsertOutcome, RecommendationCacheRepository, Repository,
    SqliteBookRepository, SqliteRecommendationRepository, UpdateOutcome,
};
