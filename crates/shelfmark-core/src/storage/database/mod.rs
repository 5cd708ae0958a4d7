mod connection;
mod migrations;
mod schema;

pub use connection::ConnectionPool;
pub use migrations::{Migration, get_applied_versions, run_migrations};
pub use schema::SCHEMA_VERSION;

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;

use super::repositories::{SqliteBookRepository, SqliteRecommendationRepository};

pub fn open_database(path: &Path) -> Result<ConnectionPool> {
    let pool = ConnectionPool::open(path)?;
    {
        let conn = pool.get_connection();
        migrations::run_migrations(&conn)?;
    }
    Ok(pool)
}

pub fn open_in_memory() -> Result<ConnectionPool> {
    let pool = ConnectionPool::open_in_memory()?;
    {
        let conn = pool.get_connection();
        migrations::run_migrations(&conn)?;
    }
    Ok(pool)
}

/// Migrated database handle; hands out repositories sharing one pool.
#[derive(Clone)]
pub struct Database {
    pool: Arc<ConnectionPool>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pool = open_database(path)?;
        Ok(Self { pool: Arc::new(pool) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let pool = open_in_memory()?;
        Ok(Self { pool: Arc::new(pool) })
    }

    pub fn books(&self) -> SqliteBookRepository {
        SqliteBookRepository::new(Arc::clone(&self.pool))
    }

    pub fn recommendations(&self) -> SqliteRecommendationRepository {
        SqliteRecommendationRepository::new(Arc::clone(&self.pool))
    }

    pub fn schema_versions(&self) -> Result<Vec<u32>> {
        let conn = self.pool.get_connection();
        get_applied_versions(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn in_memory_database_is_fully_migrated() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.schema_versions().unwrap(), vec![1, 2, 3]);
        assert_eq!(SCHEMA_VERSION, 3);
    }

    #[test]
    fn reopening_file_database_skips_applied_migrations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db").join("shelfmark.db");

        let first = Database::open(&path).unwrap();
        drop(first);
        let second = Database::open(&path).unwrap();
        assert_eq!(second.schema_versions().unwrap(), vec![1, 2, 3]);
    }
}
