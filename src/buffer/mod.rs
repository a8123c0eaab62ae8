pub mod flush_list;
pub mod frame;
pub mod lru;
pub mod page_guard;
pub mod pool;

pub use flush_list::FlushList;
pub use frame::FrameHeader;
pub use lru::LruList;
pub use page_guard::{ReadPageGuard, WritePageGuard};
pub use pool::BufferPool;
