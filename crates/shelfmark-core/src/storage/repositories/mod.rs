mod book_repository;
mod recommendation_repository;

pub use book_repository::{BookRepository, InsertOutcome, SqliteBookRepository, UpdateOutcome};
pub use recommendation_repository::{
    RecommendationCacheRepository, SqliteRecommendationRepository,
};

use crate::error::Result;

pub trait Repository {
    type Entity;
    type Id;

    fn find_by_id(&self, id: &Self::Id) -> Result<Option<Self::Entity>>;
}
