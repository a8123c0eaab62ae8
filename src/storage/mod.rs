pub mod disk;

pub use disk::{retry_io, BlockDevice, FileBlockDevice};
