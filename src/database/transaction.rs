//! # Transactions
//!
//! A transaction snapshots the active meta at begin and routes every page
//! read through that snapshot. Read-only transactions register their txid in
//! the reader table and pin the map with a shared pager guard; the writable
//! transaction additionally owns the writer mutex, an upgradable pager
//! guard, a node arena, a bucket cache, and the dirty-page buffers produced
//! by spilling.
//!
//! ## Commit (writer)
//!
//! ```text
//! 1. rebalance every node marked unbalanced        (in-memory)
//! 2. spill dirty nodes into fresh pages            (allocates, buffers)
//! 3. free the old freelist page, write the new one (allocates, buffers)
//! 4. pwrite all dirty pages, fsync                 (data durable)
//! 5. finalize the meta: root, freelist, pgid, txid, checksum
//! 6. pwrite the meta into the inactive slot, fsync (commit point)
//! 7. run commit handlers, release the writer mutex
//! ```
//!
//! A crash (or I/O failure) before step 6's fsync leaves the previous
//! snapshot active; afterwards the new one. I/O failures poison the handle:
//! the transaction reports failure, on-disk state is untouched, and later
//! write attempts fail with `Closed` until the database is reopened.
//!
//! ## MVCC
//!
//! The writer never mutates a live page. Pages it replaces are moved to the
//! free list's pending set under this transaction's id; they graduate to
//! free space only once every reader with an older snapshot has finished.
//! Readers therefore never block the writer and vice versa — the single
//! choke point is a remap, which waits for readers to drain before the map
//! moves.
//!
//! ## Node/page duality
//!
//! The write path materializes pages into mutable [`Node`]s on demand and
//! caches them per bucket keyed by pgid. All nodes live in one
//! transaction-owned arena (`Vec<Node>`) and refer to each other by index,
//! which keeps the parent/child graph representable without reference
//! cycles. Reads never materialize nodes.

use std::sync::atomic::Ordering;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{
    MutexGuard, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard,
};

use crate::btree::bucket::BucketState;
use crate::btree::node::Node;
use crate::btree::{Bucket, BucketMut, Cursor};
use crate::database::context::Context;
use crate::database::DbShared;
use crate::error::Error;
use crate::storage::{Meta, PageView, Pager, Pgid, Txid};

pub(crate) type NodeId = usize;
pub(crate) type BucketId = usize;

/// Root bucket's id inside the write-state bucket table.
pub(crate) const ROOT_BUCKET: BucketId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    RolledBack,
}

/// Pager access for the lifetime of a transaction. Readers hold a plain
/// read guard; the writer holds an upgradable guard so it can take the lock
/// exclusively around a remap without ever dropping pager access.
pub(crate) enum PagerHandle<'db> {
    Read(RwLockReadGuard<'db, Pager>),
    Write(Option<RwLockUpgradableReadGuard<'db, Pager>>),
}

impl PagerHandle<'_> {
    pub(crate) fn pager(&self) -> &Pager {
        match self {
            PagerHandle::Read(guard) => guard,
            PagerHandle::Write(slot) => slot.as_ref().expect("pager guard held for tx lifetime"),
        }
    }
}

/// Mutable state owned by a writable transaction.
pub(crate) struct WriteState {
    pub(crate) nodes: Vec<Node>,
    pub(crate) buckets: Vec<BucketState>,
    /// Serialized pages waiting for the commit write, keyed by pgid.
    pub(crate) dirty: HashMap<Pgid, Vec<u8>>,
    /// Runs handed out by the free list, returned there on rollback.
    freelist_allocs: Vec<(Pgid, usize)>,
    commit_handlers: Vec<Box<dyn FnOnce()>>,
}

impl WriteState {
    fn new(root: BucketState) -> Self {
        Self {
            nodes: Vec::new(),
            buckets: vec![root],
            dirty: HashMap::new(),
            freelist_allocs: Vec::new(),
            commit_handlers: Vec::new(),
        }
    }
}

pub struct Transaction<'db> {
    pub(crate) db: &'db DbShared,
    pub(crate) pager: PagerHandle<'db>,
    pub(crate) meta: Meta,
    page_size: usize,
    state: TxState,
    writable: bool,
    reader_slot: Option<usize>,
    pub(crate) ctx: Option<Context>,
    pub(crate) write: Option<WriteState>,
    _writer_guard: Option<MutexGuard<'db, ()>>,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.meta.txid())
            .field("writable", &self.writable)
            .field("state", &self.state)
            .finish()
    }
}

impl<'db> Transaction<'db> {
    pub(crate) fn new_read(
        db: &'db DbShared,
        pager: RwLockReadGuard<'db, Pager>,
        meta: Meta,
        ctx: Option<Context>,
    ) -> Self {
        let page_size = pager.page_size();
        let slot = db.readers.lock().register(meta.txid());
        Self {
            db,
            pager: PagerHandle::Read(pager),
            meta,
            page_size,
            state: TxState::Active,
            writable: false,
            reader_slot: Some(slot),
            ctx,
            write: None,
            _writer_guard: None,
        }
    }

    pub(crate) fn new_write(
        db: &'db DbShared,
        pager: RwLockUpgradableReadGuard<'db, Pager>,
        writer_guard: MutexGuard<'db, ()>,
        mut meta: Meta,
        ctx: Option<Context>,
    ) -> Self {
        let page_size = pager.page_size();
        meta.set_txid(meta.txid() + 1);

        // Graduate pages freed below every live snapshot.
        let oldest = db.readers.lock().min_txid().unwrap_or(Txid::MAX);
        db.freelist.lock().release(oldest);

        let root = BucketState::root(meta.root());
        Self {
            db,
            pager: PagerHandle::Write(Some(pager)),
            meta,
            page_size,
            state: TxState::Active,
            writable: true,
            reader_slot: None,
            ctx,
            write: Some(WriteState::new(root)),
            _writer_guard: Some(writer_guard),
        }
    }

    /// Transaction id: the snapshot's txid for readers, the id this commit
    /// will publish for the writer.
    pub fn id(&self) -> Txid {
        self.meta.txid()
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn require_active(&self) -> Result<()> {
        ensure!(self.state == TxState::Active, Error::TxClosed);
        Ok(())
    }

    pub(crate) fn require_writable(&self) -> Result<()> {
        self.require_active()?;
        ensure!(self.writable, Error::TxNotWritable);
        Ok(())
    }

    /// Zero-copy view of a committed logical page (base + overflow).
    pub(crate) fn page_view(&self, id: Pgid) -> Result<PageView<'_>> {
        PageView::new(self.pager.pager().page_span(id)?)
    }

    pub(crate) fn w(&self) -> &WriteState {
        self.write.as_ref().expect("write state on writable transaction")
    }

    pub(crate) fn w_mut(&mut self) -> &mut WriteState {
        self.write.as_mut().expect("write state on writable transaction")
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.w().nodes[id]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.w_mut().nodes[id]
    }

    pub(crate) fn bucket_state(&self, id: BucketId) -> &BucketState {
        &self.w().buckets[id]
    }

    pub(crate) fn bucket_state_mut(&mut self, id: BucketId) -> &mut BucketState {
        &mut self.w_mut().buckets[id]
    }

    /// Reserves `count` contiguous pages: free-list runs first, then the
    /// high-water mark, growing file and map as needed.
    pub(crate) fn allocate(&mut self, count: usize) -> Result<Pgid> {
        if let Some(start) = self.db.freelist.lock().allocate(count) {
            self.w_mut().freelist_allocs.push((start, count));
            return Ok(start);
        }

        let start = self.meta.pgid();
        self.meta.set_pgid(start + count as Pgid);
        let min_pages = self.meta.pgid();

        self.pager.pager().grow_file(min_pages)?;

        if !self.pager.pager().is_mapped(min_pages) {
            // The only operation that needs the map exclusively. Upgrading
            // waits for every live reader to finish, then the map moves.
            let PagerHandle::Write(slot) = &mut self.pager else {
                bail!(Error::TxNotWritable);
            };
            let guard = slot.take().expect("pager guard held for tx lifetime");
            let mut write_guard = RwLockUpgradableReadGuard::upgrade(guard);
            let remapped = write_guard.remap(min_pages);
            *slot = Some(RwLockWriteGuard::downgrade_to_upgradable(write_guard));
            remapped?;
        }

        Ok(start)
    }

    /// Moves a committed logical page (base + overflow, read from its
    /// header) onto this transaction's pending list.
    pub(crate) fn free(&self, pgid: Pgid) -> Result<()> {
        let overflow = self.page_view(pgid)?.overflow();
        self.db.freelist.lock().free(self.meta.txid(), pgid, overflow)
    }

    pub(crate) fn poll_context(&self) -> Result<()> {
        match &self.ctx {
            Some(ctx) => ctx.check(),
            None => Ok(()),
        }
    }

    /// Registers a callback to run after a successful commit.
    pub fn on_commit<F: FnOnce() + 'static>(&mut self, handler: F) -> Result<()> {
        self.require_writable()?;
        self.w_mut().commit_handlers.push(Box::new(handler));
        Ok(())
    }

    /// Commits the transaction: rebalance, spill, freelist rewrite, data
    /// write + fsync, then the meta flip into the inactive slot + fsync.
    pub fn commit(mut self) -> Result<()> {
        self.require_writable()?;

        match self.commit_inner() {
            Ok(()) => {
                self.state = TxState::Committed;
                self.db.stats.lock().tx_count += 1;
                let handlers = std::mem::take(&mut self.w_mut().commit_handlers);
                for handler in handlers {
                    handler();
                }
                Ok(())
            }
            Err(e) => {
                let _ = self.rollback_inner();
                Err(e)
            }
        }
    }

    fn commit_inner(&mut self) -> Result<()> {
        // Phase 1: restructure underfilled nodes.
        self.rebalance_all()?;
        self.poll_context()?;

        // Phase 2: spill dirty nodes into freshly allocated pages and move
        // every bucket root (including the meta's root header) forward.
        self.spill_all()?;
        self.poll_context()?;

        // Phase 3: relocate the free list itself.
        self.free(self.meta.freelist())
            .wrap_err("failed to retire previous freelist page")?;
        let pages = self.db.freelist.lock().size().div_ceil(self.page_size);
        let freelist_pgid = self.allocate(pages)?;
        let mut buf = vec![0u8; pages * self.page_size];
        self.db
            .freelist
            .lock()
            .write_to(&mut buf, freelist_pgid, (pages - 1) as u32)?;
        self.w_mut().dirty.insert(freelist_pgid, buf);
        self.meta.set_freelist(freelist_pgid);

        self.poll_context()?;

        // Phase 4: write the new tree. Failures from here on poison the
        // handle; the active meta still points at the previous snapshot.
        self.write_dirty_pages().inspect_err(|_| self.poison())?;

        if self.db.strict_mode {
            self.check().inspect_err(|_| self.poison())?;
        }

        // Phase 5 & 6: publish.
        self.write_meta().inspect_err(|_| self.poison())?;

        tracing::trace!(
            txid = self.meta.txid(),
            root = self.meta.root().root(),
            freelist = self.meta.freelist(),
            hwm = self.meta.pgid(),
            "committed transaction"
        );
        Ok(())
    }

    fn write_dirty_pages(&mut self) -> Result<()> {
        let mut pgids: Vec<Pgid> = self.w().dirty.keys().copied().collect();
        pgids.sort_unstable();

        let pager = self.pager.pager();
        for pgid in pgids {
            let buf = &self.w().dirty[&pgid];
            pager.write_page(pgid, buf)?;
        }
        pager.sync()
    }

    fn write_meta(&mut self) -> Result<()> {
        self.meta.update_checksum();
        let slot = self.meta.slot();
        let mut page = vec![0u8; self.page_size];
        self.meta.write_to_page(&mut page, slot)?;

        let pager = self.pager.pager();
        pager.write_page(slot, &page)?;
        pager.sync()
    }

    fn poison(&self) {
        self.db.poisoned.store(true, Ordering::Release);
        tracing::error!("commit I/O failed; database handle poisoned");
    }

    /// Discards all in-memory changes. On-disk state is untouched.
    pub fn rollback(mut self) -> Result<()> {
        self.require_active()?;
        self.rollback_inner()
    }

    fn rollback_inner(&mut self) -> Result<()> {
        if self.state != TxState::Active {
            return Ok(());
        }
        if self.writable {
            let txid = self.meta.txid();
            let mut freelist = self.db.freelist.lock();
            freelist.rollback(txid);
            if let Some(write) = self.write.as_mut() {
                for (pgid, count) in write.freelist_allocs.drain(..) {
                    freelist.reclaim(pgid, count);
                }
            }
            // High-water-mark allocations are simply abandoned: the meta on
            // disk still carries the old mark, so the next writer re-mints
            // the same range.
        }
        self.state = TxState::RolledBack;
        Ok(())
    }

    // ---- bucket surface (root-bucket delegation) ----

    /// Read view of the root bucket space.
    pub fn root(&self) -> Bucket<'_, 'db> {
        Bucket::root_of(self)
    }

    /// Read view of a named top-level bucket.
    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'_, 'db>> {
        self.require_active()?;
        self.root().bucket(name)
    }

    /// Writable handle for a named top-level bucket.
    pub fn bucket_mut(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        self.require_writable()?;
        let id = self.open_child_bucket(ROOT_BUCKET, name)?;
        Ok(BucketMut::new(self, id))
    }

    pub fn create_bucket(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        self.require_writable()?;
        let id = self.create_child_bucket(ROOT_BUCKET, name, false)?;
        Ok(BucketMut::new(self, id))
    }

    pub fn create_bucket_if_not_exists(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        self.require_writable()?;
        let id = self.create_child_bucket(ROOT_BUCKET, name, true)?;
        Ok(BucketMut::new(self, id))
    }

    /// Deletes a top-level bucket and frees its whole subtree into this
    /// transaction's pending list.
    pub fn delete_bucket(&mut self, name: &[u8]) -> Result<()> {
        self.require_writable()?;
        self.delete_child_bucket(ROOT_BUCKET, name)
    }

    /// Cursor over the root space (top-level buckets and root-level keys).
    pub fn cursor(&self) -> Result<Cursor<'_, 'db>> {
        self.require_active()?;
        Ok(self.root().cursor())
    }

    /// Visits every top-level bucket in name order.
    pub fn for_each<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], Bucket<'_, 'db>) -> Result<()>,
    {
        self.require_active()?;
        let root = self.root();
        let mut cursor = root.cursor();
        let mut entry = cursor.first()?;
        while let Some(e) = entry {
            if e.is_bucket() {
                let key = e.key().to_vec();
                visit(&key, root.bucket(&key)?)?;
            }
            entry = cursor.next()?;
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            let _ = self.rollback_inner();
        }
        if let Some(slot) = self.reader_slot.take() {
            self.db.readers.lock().deregister(slot);
        }
    }
}
