pub mod engine;
pub mod freelist;
pub mod page;
pub mod pager;
pub mod sync;
pub mod wal;

pub use engine::Store;
pub use page::{Ele, IndexRef, Pgid};

/// Fixed page regions at the front of the data file.
pub const META_PAGE_COUNT: u64 = 1;
pub const FREELIST_PAGE_COUNT: u64 = 1;

pub const META_PGID: Pgid = 0;
pub const FREELIST_PGID: Pgid = 1;

/// Base increment for element-page growth, in pages.
pub const ELE_PAGE_INCREMENT: u64 = 8;

/// Insert retries before the engine gives up.
pub const MAX_INSERT_ATTEMPTS: u32 = 3;

/// WAL rotation threshold in bytes.
pub const WAL_ROTATE_THRESHOLD: u64 = 1 << 20;
