use rusqlite::Connection;

use super::Migration;
use crate::error::Result;
use crate::storage::database::schema;

pub struct V2Recommendations;

impl Migration for V2Recommendations {
    fn version(&self) -> u32 {
        2
    }

    fn description(&self) -> &'static str {
        "Per-user recommendation cache"
    }

    fn up(&self, conn: &Connection) -> Result<()> {
        schema::create_recommendation_cache_table(conn)
    }
}
