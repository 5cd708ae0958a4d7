use rusqlite::Connection;

use super::Migration;
use crate::error::Result;
use crate::storage::database::schema;

pub struct V1Books;

impl Migration for V1Books {
    fn version(&self) -> u32 {
        1
    }

    fn description(&self) -> &'static str {
        "Book cache table with unique isbn13, isbn10 and catalog key indexes"
    }

    fn up(&self, conn: &Connection) -> Result<()> {
        schema::create_books_table(conn)
    }
}
