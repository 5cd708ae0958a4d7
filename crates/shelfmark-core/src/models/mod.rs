pub mod book;
pub mod recommendation;
pub mod record;

pub use book::*;
pub use recommendation::*;
pub use record::*;
