//! # Storage Layer
//!
//! Everything that touches bytes on disk lives here: the memory-mapped pager,
//! the page codec, the meta pages, and the free list.
//!
//! ## Shadow paging
//!
//! burrowdb never updates a live page in place. A write transaction builds
//! replacement pages in freshly allocated space, writes and fsyncs them, and
//! then flips the database to the new tree by overwriting whichever of the
//! two meta pages (pgids 0 and 1) is *not* currently active. A crash at any
//! point leaves at least one valid meta pointing at a complete tree.
//!
//! ```text
//! pgid 0   meta (even txids)
//! pgid 1   meta (odd txids)
//! pgid 2   freelist (initial; relocates on every commit)
//! pgid 3   root leaf (initial; relocates on first write)
//! pgid 4+  branch / leaf / freelist / overflow space
//! ```
//!
//! ## Reads vs writes
//!
//! Reads are zero-copy slices into a read-only `Mmap`. Writes bypass the map
//! entirely and go through positioned writes on the owned `File`; a shared
//! file mapping observes them coherently. The map is therefore never mapped
//! writable, and remapping is only required when the high-water mark grows
//! past the mapped region.
//!
//! ## Module organization
//!
//! - `pager`: file handle, map, growth and remap, raw writes, fsync
//! - `page`: fixed 16-byte header plus branch/leaf/freelist payload codecs
//! - `meta`: the 64-byte meta body, FNV-1a checksum, validity rules
//! - `freelist`: free pgids plus pgids pending release per transaction

mod freelist;
mod meta;
mod page;
mod pager;

pub use freelist::Freelist;
pub use meta::{Meta, MAGIC, META_BODY_SIZE, VERSION};
pub use page::{
    BranchElem, BucketHeader, LeafElem, PageHeader, PageKind, PageView, BRANCH_ELEM_SIZE,
    BUCKET_HEADER_SIZE, LEAF_ELEM_SIZE, LEAF_FLAG_BUCKET, PAGE_HEADER_SIZE,
};
pub use pager::{Pager, PagerOptions};

/// 64-bit page identifier; byte offset = `pgid * page_size`.
pub type Pgid = u64;

/// Monotone transaction identifier; commits totally order by it.
pub type Txid = u64;

/// Page size used when creating a fresh database file.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest page size accepted at create time.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest page size accepted at create time.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Keys must be non-empty and no longer than this.
pub const MAX_KEY_SIZE: usize = 32 * 1024;

/// Values may be at most 2^31 - 2 bytes.
pub const MAX_VALUE_SIZE: usize = (1 << 31) - 2;

/// Smallest mapped region; growth doubles from here.
pub const MIN_MMAP_SIZE: u64 = 32 * 1024;

/// Past this size the map grows in fixed 1 GiB steps instead of doubling.
pub const MAX_MMAP_STEP: u64 = 1 << 30;
