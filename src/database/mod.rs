//! # Database Handle
//!
//! `Database` is the top-level handle over one database file. It owns the
//! pager (behind a `RwLock` so readers pin the map while the writer can
//! still take it exclusively for a remap), the shared free list, the reader
//! registry, and the single writer mutex.
//!
//! ## Transactions
//!
//! ```ignore
//! let db = Database::open("/tmp/app.db")?;
//!
//! db.update(|tx| {
//!     let mut jobs = tx.create_bucket_if_not_exists(b"jobs")?;
//!     jobs.put(b"job-1", b"pending")?;
//!     Ok(())
//! })?;
//!
//! db.view(|tx| {
//!     let jobs = tx.bucket(b"jobs")?;
//!     assert_eq!(jobs.get(b"job-1")?, Some(&b"pending"[..]));
//!     Ok(())
//! })?;
//! ```
//!
//! `update` commits when the callback succeeds and rolls back when it
//! fails; `view` always rolls back. The `_with_context` variants accept a
//! cancellation [`Context`] that managed commits poll at safe points.
//!
//! ## Concurrency
//!
//! Any number of read transactions run in parallel with one writer.
//! Readers never block the writer and the writer never blocks readers; the
//! single blocking interaction is a map growth, which waits for live
//! readers to drain. `begin(true)` blocks on the writer mutex.
//!
//! ## Failure policy
//!
//! An I/O failure inside commit leaves the file at the previous snapshot
//! and poisons this handle: later `begin(true)` calls fail with `Closed`
//! until the process reopens the database. Read transactions continue to
//! work against the last durable snapshot.

pub mod builder;
mod check;
pub mod context;
pub mod transaction;

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Mutex, RwLock};

pub use builder::DatabaseBuilder;
pub use context::Context;
pub use transaction::Transaction;

use crate::error::Error;
use crate::storage::{
    Freelist, Meta, PageHeader, PageKind, PageView, Pager, PagerOptions, Txid,
};

/// Registry of live read transactions; the free list consults the minimum
/// txid before graduating pending pages.
#[derive(Debug, Default)]
pub(crate) struct ReaderTable {
    slots: Vec<Option<Txid>>,
}

impl ReaderTable {
    pub(crate) fn register(&mut self, txid: Txid) -> usize {
        if let Some(slot) = self.slots.iter().position(Option::is_none) {
            self.slots[slot] = Some(txid);
            return slot;
        }
        self.slots.push(Some(txid));
        self.slots.len() - 1
    }

    pub(crate) fn deregister(&mut self, slot: usize) {
        self.slots[slot] = None;
    }

    pub(crate) fn min_txid(&self) -> Option<Txid> {
        self.slots.iter().flatten().copied().min()
    }

    pub(crate) fn count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) tx_count: u64,
}

/// Shared state behind every transaction of one database handle.
pub(crate) struct DbShared {
    pub(crate) pager: RwLock<Pager>,
    pub(crate) freelist: Mutex<Freelist>,
    pub(crate) readers: Mutex<ReaderTable>,
    pub(crate) write_lock: Mutex<()>,
    pub(crate) poisoned: AtomicBool,
    pub(crate) strict_mode: bool,
    pub(crate) stats: Mutex<StatsCounters>,
    read_only: bool,
    page_size: usize,
    path: PathBuf,
}

/// Point-in-time counters reported by [`Database::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Write transactions committed through this handle.
    pub tx_count: u64,
    /// Read transactions currently live.
    pub open_reader_count: usize,
    /// Pages free for reuse right now.
    pub free_page_count: usize,
    /// Pages released but still pinned by reader snapshots.
    pub pending_page_count: usize,
    /// Bytes the free list will occupy when serialized.
    pub freelist_bytes: usize,
}

pub struct Database {
    shared: DbShared,
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    /// Opens (creating if absent) a database at `path` with defaults.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder().path(path).open()
    }

    pub(crate) fn open_with(options: DatabaseBuilder) -> Result<Self> {
        let path = options
            .path
            .clone()
            .ok_or_else(|| eyre::eyre!("no database path configured"))?;

        if !options.read_only {
            initialize_file(&path, options.page_size, options.file_mode)?;
        }

        let pager_options = PagerOptions {
            read_only: options.read_only,
            initial_mmap_size: options.initial_mmap_size,
            no_grow_sync: options.no_grow_sync,
            populate: options.mmap_populate,
        };
        let pager = Pager::open(&path, &pager_options)?;
        let page_size = pager.page_size();

        let meta = read_active_meta(&pager)?;
        let mut freelist = Freelist::new();
        freelist
            .read_from(PageView::new(pager.page_span(meta.freelist())?)?)
            .wrap_err("failed to load freelist")?;

        tracing::info!(
            path = %path.display(),
            page_size,
            txid = meta.txid(),
            free_pages = freelist.free_count(),
            "database open"
        );

        Ok(Self {
            shared: DbShared {
                pager: RwLock::new(pager),
                freelist: Mutex::new(freelist),
                readers: Mutex::new(ReaderTable::default()),
                write_lock: Mutex::new(()),
                poisoned: AtomicBool::new(false),
                strict_mode: options.strict_mode,
                stats: Mutex::new(StatsCounters::default()),
                read_only: options.read_only,
                page_size,
                path,
            },
        })
    }

    /// Starts a transaction. `begin(true)` blocks until the previous
    /// writer finishes; `begin(false)` never blocks on other transactions.
    pub fn begin(&self, writable: bool) -> Result<Transaction<'_>> {
        if writable {
            self.begin_write(None)
        } else {
            self.begin_read(None)
        }
    }

    fn begin_read(&self, ctx: Option<Context>) -> Result<Transaction<'_>> {
        let guard = self.shared.pager.read();
        let meta = read_active_meta(&guard)?;
        Ok(Transaction::new_read(&self.shared, guard, meta, ctx))
    }

    fn begin_write(&self, ctx: Option<Context>) -> Result<Transaction<'_>> {
        ensure!(!self.shared.read_only, Error::ReadOnly);
        ensure!(!self.shared.poisoned.load(Ordering::Acquire), Error::Closed);

        let writer_guard = self.shared.write_lock.lock();
        // A commit may have failed while this thread waited on the mutex.
        ensure!(!self.shared.poisoned.load(Ordering::Acquire), Error::Closed);

        let guard = self.shared.pager.upgradable_read();
        let meta = read_active_meta(&guard)?;
        Ok(Transaction::new_write(
            &self.shared,
            guard,
            writer_guard,
            meta,
            ctx,
        ))
    }

    /// Runs `f` inside a writable transaction, committing on success and
    /// rolling back on error.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<()>,
    {
        self.update_inner(None, f)
    }

    /// [`Database::update`] with a cancellation context polled at commit
    /// safe points.
    pub fn update_with_context<F>(&self, ctx: Context, f: F) -> Result<()>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<()>,
    {
        self.update_inner(Some(ctx), f)
    }

    fn update_inner<F>(&self, ctx: Option<Context>, f: F) -> Result<()>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<()>,
    {
        let mut tx = self.begin_write(ctx)?;
        tx.poll_context()?;
        match f(&mut tx) {
            Ok(()) => tx.commit(),
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }

    /// Runs `f` inside a read-only transaction.
    pub fn view<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Transaction<'_>) -> Result<()>,
    {
        self.view_inner(None, f)
    }

    pub fn view_with_context<F>(&self, ctx: Context, f: F) -> Result<()>
    where
        F: FnOnce(&Transaction<'_>) -> Result<()>,
    {
        self.view_inner(Some(ctx), f)
    }

    fn view_inner<F>(&self, ctx: Option<Context>, f: F) -> Result<()>
    where
        F: FnOnce(&Transaction<'_>) -> Result<()>,
    {
        let tx = self.begin_read(ctx)?;
        tx.poll_context()?;
        let result = f(&tx);
        tx.rollback()?;
        result
    }

    /// fsync the database file.
    pub fn sync(&self) -> Result<()> {
        self.shared.pager.read().sync()
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.read_only
    }

    pub fn page_size(&self) -> usize {
        self.shared.page_size
    }

    pub fn stats(&self) -> DatabaseStats {
        let freelist = self.shared.freelist.lock();
        DatabaseStats {
            tx_count: self.shared.stats.lock().tx_count,
            open_reader_count: self.shared.readers.lock().count(),
            free_page_count: freelist.free_count(),
            pending_page_count: freelist.pending_count(),
            freelist_bytes: freelist.size(),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.shared.path)
            .field("page_size", &self.shared.page_size)
            .field("read_only", &self.shared.read_only)
            .finish_non_exhaustive()
    }
}

/// Validates both meta slots and returns the newer valid one. When neither
/// validates, slot 0's verdict (magic → version → checksum) is reported.
pub(crate) fn read_active_meta(pager: &Pager) -> Result<Meta> {
    let meta0 = pager.page(0).and_then(Meta::from_page);
    let meta1 = pager.page(1).and_then(Meta::from_page);
    match (meta0, meta1) {
        (Ok(a), Ok(b)) => Ok(if a.txid() > b.txid() { a } else { b }),
        (Ok(a), Err(_)) => Ok(a),
        (Err(_), Ok(b)) => Ok(b),
        (Err(e), Err(_)) => Err(e),
    }
}

/// Writes the four bootstrap pages of a fresh database: two metas, an
/// empty freelist at pgid 2, an empty root leaf at pgid 3.
fn initialize_file(path: &Path, page_size: usize, file_mode: Option<u32>) -> Result<()> {
    let mut open_options = OpenOptions::new();
    open_options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        open_options.mode(file_mode.unwrap_or(0o600));
    }
    #[cfg(not(unix))]
    let _ = file_mode;

    let mut file = open_options
        .open(path)
        .map_err(Error::Io)
        .wrap_err_with(|| format!("failed to create database file '{}'", path.display()))?;

    if file
        .metadata()
        .map_err(Error::Io)
        .wrap_err("failed to stat database file")?
        .len()
        > 0
    {
        return Ok(());
    }

    let mut buf = vec![0u8; 4 * page_size];
    for slot in 0..2u64 {
        let meta = Meta::new(page_size as u32, 3, 2, 4, slot);
        let offset = slot as usize * page_size;
        meta.write_to_page(&mut buf[offset..offset + page_size], slot)?;
    }
    PageHeader::new(2, PageKind::Freelist).write_to(&mut buf[2 * page_size..])?;
    PageHeader::new(3, PageKind::Leaf).write_to(&mut buf[3 * page_size..])?;

    file.write_all(&buf)
        .map_err(Error::Io)
        .wrap_err("failed to write bootstrap pages")?;
    file.sync_all()
        .map_err(Error::Io)
        .wrap_err("failed to sync bootstrap pages")?;
    tracing::info!(path = %path.display(), page_size, "initialized new database file");
    Ok(())
}
