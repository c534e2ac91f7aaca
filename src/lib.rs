pub mod disk;
pub mod fs;
pub mod utils;

pub use disk::{BlockDevice, FileDisk, MemDisk};
pub use fs::block_cache::{BlockCache, CacheConfig, FlushDaemon};
pub use fs::directory::Directory;
pub use fs::entry::{EntryKind, FileEntry};
pub use fs::error::{FsError, Result};
pub use fs::fat::{BlockState, Fat};
pub use fs::handle::{AccessMode, HandleTable, OpenHandle};
pub use fs::FileSystem;
