pub mod checksum;
pub mod layout;
pub mod page;

pub use checksum::ChecksumAlgorithm;
pub use layout::{Direction, PageType};
pub use page::{PagePosition, RecordPage, DIR_SLOT_MAX_OWNED, DIR_SLOT_MIN_OWNED};
