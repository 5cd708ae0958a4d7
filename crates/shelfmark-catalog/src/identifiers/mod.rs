pub mod isbn;

pub use isbn::{Isbn, best_isbns, is_valid_isbn10, is_valid_isbn13, isbn10_to_isbn13, isbn13_to_isbn10};
