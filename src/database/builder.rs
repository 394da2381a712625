//! # Database Builder
//!
//! Fluent configuration for opening a database. Settings chain before
//! `open()`:
//!
//! ```ignore
//! let db = Database::builder()
//!     .path("/var/lib/app/state.db")
//!     .initial_mmap_size(64 << 20)
//!     .strict_mode(true)
//!     .open()?;
//! ```
//!
//! | Option              | Default | Description                            |
//! |---------------------|---------|----------------------------------------|
//! | `read_only`         | false   | Shared file lock; writes refused       |
//! | `page_size`         | 4096    | Honored only when creating a new file  |
//! | `initial_mmap_size` | 0       | Minimum bytes to map at open           |
//! | `no_grow_sync`      | false   | Skip fsync after file growth           |
//! | `strict_mode`       | false   | Verify the tree on every commit        |
//! | `mmap_populate`     | false   | Pre-fault the map (platform hint)      |
//! | `file_mode`         | 0o600   | Unix permissions for new files         |
//!
//! `page_size` must be a power of two between 512 and 64 KiB; an existing
//! file always keeps the page size recorded in its meta.

use std::path::{Path, PathBuf};

use eyre::{ensure, Result};

use crate::database::Database;
use crate::storage::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

#[derive(Debug, Clone)]
pub struct DatabaseBuilder {
    pub(crate) path: Option<PathBuf>,
    pub(crate) read_only: bool,
    pub(crate) page_size: usize,
    pub(crate) initial_mmap_size: u64,
    pub(crate) no_grow_sync: bool,
    pub(crate) strict_mode: bool,
    pub(crate) mmap_populate: bool,
    pub(crate) file_mode: Option<u32>,
}

impl Default for DatabaseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseBuilder {
    pub fn new() -> Self {
        Self {
            path: None,
            read_only: false,
            page_size: DEFAULT_PAGE_SIZE,
            initial_mmap_size: 0,
            no_grow_sync: false,
            strict_mode: false,
            mmap_populate: false,
            file_mode: None,
        }
    }

    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_owned());
        self
    }

    /// Opens with a shared lock and refuses writes.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Page size for newly created files. Existing files keep theirs.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Minimum bytes to map at open. A generous value avoids remaps (which
    /// wait on live readers) for databases expected to grow.
    pub fn initial_mmap_size(mut self, bytes: u64) -> Self {
        self.initial_mmap_size = bytes;
        self
    }

    /// Skips the fsync that normally follows file growth. Growth is then
    /// only as durable as the following commit's fsync.
    pub fn no_grow_sync(mut self, no_grow_sync: bool) -> Self {
        self.no_grow_sync = no_grow_sync;
        self
    }

    /// Re-verifies tree structure, ordering, and page ownership on every
    /// commit before the meta is written.
    pub fn strict_mode(mut self, strict_mode: bool) -> Self {
        self.strict_mode = strict_mode;
        self
    }

    /// Asks the kernel to pre-fault the whole map at open (`MAP_POPULATE`
    /// where supported). Trades open latency for fewer page-fault stalls.
    pub fn mmap_populate(mut self, populate: bool) -> Self {
        self.mmap_populate = populate;
        self
    }

    /// Unix permission bits for newly created database files. Ignored on
    /// other platforms and for existing files.
    pub fn file_mode(mut self, mode: u32) -> Self {
        self.file_mode = Some(mode);
        self
    }

    pub fn open(self) -> Result<Database> {
        ensure!(
            (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
                && self.page_size.is_power_of_two(),
            "page size {} is not a power of two between {} and {}",
            self.page_size,
            MIN_PAGE_SIZE,
            MAX_PAGE_SIZE
        );
        Database::open_with(self)
    }
}
