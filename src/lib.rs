//! # burrowdb — Embedded Transactional Key-Value Store
//!
//! burrowdb is a single-file, embedded key-value store. One process opens
//! one database file; data lives in named, recursively nestable **buckets**
//! holding lexicographically ordered byte keys mapped to byte values.
//! Durability comes from shadow paging over a memory-mapped file with two
//! alternating meta pages — there is no write-ahead log and no compaction.
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrowdb::Database;
//!
//! let db = Database::open("./app.db")?;
//!
//! db.update(|tx| {
//!     let mut users = tx.create_bucket_if_not_exists(b"users")?;
//!     users.put(b"alice", b"{\"admin\":true}")?;
//!     Ok(())
//! })?;
//!
//! db.view(|tx| {
//!     let users = tx.bucket(b"users")?;
//!     println!("{:?}", users.get(b"alice")?);
//!     Ok(())
//! })?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Database (open/close, update/view)│
//! ├─────────────────────────────────────┤
//! │   Transaction (MVCC, 2-phase commit)│
//! ├──────────────┬──────────────────────┤
//! │   Buckets    │       Cursors        │
//! ├──────────────┴──────────────────────┤
//! │   B+tree (nodes, rebalance, spill)  │
//! ├─────────────────────────────────────┤
//! │   Pages / Meta / Free list codecs   │
//! ├─────────────────────────────────────┤
//! │   Pager (mmap reads, pwrite+fsync)  │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Synchronous, multi-threaded, single-writer. A writable transaction holds
//! the writer mutex; any number of read transactions run concurrently with
//! it, each pinned to the meta snapshot it observed at begin. Pages
//! replaced by a commit stay reserved until every reader that can still see
//! them has finished.
//!
//! ## Guarantees
//!
//! - Committed data survives crashes: the commit point is the fsync of a
//!   checksummed meta page, and the previous meta stays intact.
//! - Readers observe a stable snapshot for their whole lifetime.
//! - Values returned by `get` alias the map and are valid until their
//!   transaction ends; copy what must outlive it.

pub mod btree;
pub mod database;
pub mod error;
pub mod storage;

pub use btree::{Bucket, BucketMut, BucketStats, Cursor, CursorMut, Entry};
pub use database::{Context, Database, DatabaseBuilder, DatabaseStats, Transaction};
pub use error::Error;
pub use storage::{DEFAULT_PAGE_SIZE, MAX_KEY_SIZE, MAX_VALUE_SIZE};
