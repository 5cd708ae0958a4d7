use rusqlite::Connection;

use super::Migration;
use crate::error::Result;
use crate::storage::database::schema;

pub struct V3SecondaryKey;

impl Migration for V3SecondaryKey {
    fn version(&self) -> u32 {
        3
    }

    fn description(&self) -> &'static str {
        "Unique index on secondary catalog key"
    }

    fn up(&self, conn: &Connection) -> Result<()> {
        schema::create_secondary_key_index(conn)
    }
}
