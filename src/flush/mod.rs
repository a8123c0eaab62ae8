pub mod doublewrite;
pub mod engine;

pub use doublewrite::{repair_from_doublewrite, repair_page, DoublewriteBuffer};
pub use engine::{FlushEngine, FlushType};
