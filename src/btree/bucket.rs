//! # Buckets
//!
//! A bucket is a named subtree of ordered keys. Its on-disk identity is a
//! 16-byte header (root pgid + sequence counter): the root bucket's header
//! lives in the meta page, nested bucket headers live inside their parent
//! leaf's value, flagged as sub-bucket entries.
//!
//! ## Inline buckets
//!
//! A bucket whose whole content fits in a quarter page is not given a page
//! of its own: its header (root pgid 0) is followed by a complete leaf-page
//! image, all packed into the parent leaf's value. The first commit that
//! grows it past the threshold promotes it to a real root page; a shrink
//! can demote it back.
//!
//! ## Handles
//!
//! [`Bucket`] is a shared view that works in both read and write
//! transactions; inside a write transaction it observes the transaction's
//! own uncommitted nodes. [`BucketMut`] is only reachable through a
//! writable transaction and adds the mutating surface. Bucket state itself
//! (header, node cache, opened children) lives in the transaction's write
//! state, addressed by id, so handles stay small and borrow-friendly.
//!
//! ## Limits
//!
//! Keys are 1..=32768 bytes; values at most 2^31 - 2 bytes. Values returned
//! by `get` alias the map (or this transaction's node memory) and live
//! until the transaction ends.

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;

use crate::btree::cursor::{resolve_frame, root_frame, seek_exact, Cursor, CursorMut, FrameRef};
use crate::btree::node::DEFAULT_FILL_PERCENT;
use crate::database::transaction::{BucketId, NodeId, Transaction, ROOT_BUCKET};
use crate::error::Error;
use crate::storage::{
    BucketHeader, PageHeader, PageKind, Pgid, BUCKET_HEADER_SIZE, LEAF_FLAG_BUCKET, MAX_KEY_SIZE,
    MAX_VALUE_SIZE, PAGE_HEADER_SIZE,
};

/// Per-transaction mutable state of one opened bucket.
pub(crate) struct BucketState {
    pub(crate) header: BucketHeader,
    pub(crate) root_node: Option<NodeId>,
    /// Materialized nodes of this subtree, keyed by the pgid they were
    /// read from.
    pub(crate) nodes: HashMap<Pgid, NodeId>,
    /// Sub-buckets opened through this transaction, by name.
    pub(crate) children: HashMap<Vec<u8>, BucketId>,
    /// Copy of the inline leaf-page image (root pgid 0 only).
    pub(crate) inline_page: Option<Vec<u8>>,
    pub(crate) fill_percent: f64,
    pub(crate) deleted: bool,
}

impl BucketState {
    pub(crate) fn root(header: BucketHeader) -> Self {
        Self {
            header,
            root_node: None,
            nodes: HashMap::new(),
            children: HashMap::new(),
            inline_page: None,
            fill_percent: DEFAULT_FILL_PERCENT,
            deleted: false,
        }
    }

    fn child(header: BucketHeader, inline_page: Option<Vec<u8>>) -> Self {
        Self {
            header,
            root_node: None,
            nodes: HashMap::new(),
            children: HashMap::new(),
            inline_page,
            fill_percent: DEFAULT_FILL_PERCENT,
            deleted: false,
        }
    }
}

/// How a [`Bucket`] view reaches its subtree.
#[derive(Clone, Copy)]
pub(crate) enum BucketRef<'a> {
    /// Bucket state cached in the write transaction.
    Cached(BucketId),
    /// Committed-only view (read transactions, or sub-buckets this write
    /// transaction has not touched).
    Detached {
        header: BucketHeader,
        inline: Option<&'a [u8]>,
    },
}

/// Aggregate counts for one bucket's subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketStats {
    /// Leaf entries, sub-bucket markers included.
    pub key_count: usize,
    /// Levels from root to leaves.
    pub depth: usize,
    pub branch_page_count: usize,
    pub leaf_page_count: usize,
    /// True when the bucket is stored inline in its parent.
    pub inline: bool,
}

/// Shared view of a bucket.
#[derive(Clone, Copy)]
pub struct Bucket<'a, 'db> {
    tx: &'a Transaction<'db>,
    bref: BucketRef<'a>,
}

impl std::fmt::Debug for Bucket<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket").finish_non_exhaustive()
    }
}

impl<'a, 'db> Bucket<'a, 'db> {
    pub(crate) fn new(tx: &'a Transaction<'db>, bref: BucketRef<'a>) -> Self {
        Self { tx, bref }
    }

    /// The transaction's root bucket space.
    pub(crate) fn root_of(tx: &'a Transaction<'db>) -> Self {
        let bref = if tx.write.is_some() {
            BucketRef::Cached(ROOT_BUCKET)
        } else {
            BucketRef::Detached {
                header: tx.meta.root(),
                inline: None,
            }
        };
        Self { tx, bref }
    }

    fn header(&self) -> BucketHeader {
        match self.bref {
            BucketRef::Cached(id) => self.tx.bucket_state(id).header,
            BucketRef::Detached { header, .. } => header,
        }
    }

    /// Looks up a plain key. Sub-bucket markers yield `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<&'a [u8]>> {
        self.tx.require_active()?;
        match seek_exact(self.tx, self.bref, key)? {
            Some((flags, _, value)) if flags & LEAF_FLAG_BUCKET == 0 => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// Opens a nested bucket for reading.
    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'a, 'db>> {
        self.tx.require_active()?;
        if let BucketRef::Cached(id) = self.bref {
            if let Some(&child) = self.tx.bucket_state(id).children.get(name) {
                ensure!(!self.tx.bucket_state(child).deleted, Error::BucketNotFound);
                return Ok(Bucket::new(self.tx, BucketRef::Cached(child)));
            }
        }
        match seek_exact(self.tx, self.bref, name)? {
            None => bail!(Error::BucketNotFound),
            Some((flags, _, value)) => {
                ensure!(flags & LEAF_FLAG_BUCKET != 0, Error::BucketNameConflict);
                let header = BucketHeader::from_bytes(value)?;
                let inline = if header.is_inline() {
                    ensure!(value.len() >= BUCKET_HEADER_SIZE + PAGE_HEADER_SIZE, Error::Corruption);
                    Some(&value[BUCKET_HEADER_SIZE..])
                } else {
                    None
                };
                Ok(Bucket::new(self.tx, BucketRef::Detached { header, inline }))
            }
        }
    }

    pub fn cursor(&self) -> Cursor<'a, 'db> {
        Cursor::new(self.tx, self.bref)
    }

    /// Visits every entry in key order; sub-bucket markers pass `None` as
    /// the value. An error from `visit` aborts the iteration.
    pub fn for_each<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], Option<&[u8]>) -> Result<()>,
    {
        self.tx.require_active()?;
        let mut cursor = self.cursor();
        let mut entry = cursor.first()?;
        while let Some(e) = entry {
            visit(e.key(), e.value())?;
            entry = cursor.next()?;
        }
        Ok(())
    }

    /// Current value of the bucket-local sequence counter.
    pub fn sequence(&self) -> u64 {
        self.header().sequence()
    }

    pub fn stats(&self) -> Result<BucketStats> {
        self.tx.require_active()?;
        let mut stats = BucketStats {
            inline: self.header().is_inline(),
            ..BucketStats::default()
        };
        self.walk_stats(root_frame(self.bref, self.tx), 1, &mut stats)?;
        Ok(stats)
    }

    fn walk_stats(&self, fr: FrameRef, depth: usize, stats: &mut BucketStats) -> Result<()> {
        let pon = resolve_frame(self.tx, self.bref, fr)?;
        stats.depth = stats.depth.max(depth);
        if pon.is_leaf()? {
            stats.leaf_page_count += 1;
            stats.key_count += pon.count();
            return Ok(());
        }
        stats.branch_page_count += 1;
        for i in 0..pon.count() {
            let child = pon.branch_pgid(i)?;
            self.walk_stats(FrameRef::Page(child), depth + 1, stats)?;
        }
        Ok(())
    }
}

/// Writable handle for a bucket; only reachable through a writable
/// transaction.
pub struct BucketMut<'a, 'db> {
    tx: &'a mut Transaction<'db>,
    id: BucketId,
}

impl std::fmt::Debug for BucketMut<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketMut").finish_non_exhaustive()
    }
}

impl<'a, 'db> BucketMut<'a, 'db> {
    pub(crate) fn new(tx: &'a mut Transaction<'db>, id: BucketId) -> Self {
        Self { tx, id }
    }

    /// Shared view of the same bucket, observing this transaction's
    /// uncommitted changes.
    pub fn as_view(&self) -> Bucket<'_, 'db> {
        Bucket::new(&*self.tx, BucketRef::Cached(self.id))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        self.as_view().get(key)
    }

    /// Inserts or replaces a plain key/value pair.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.bucket_put(self.id, key, value)
    }

    /// Removes a plain key. Deleting a sub-bucket name fails with
    /// `BucketNameConflict`; use [`BucketMut::delete_bucket`].
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.tx.bucket_delete(self.id, key)
    }

    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'_, 'db>> {
        self.as_view().bucket(name)
    }

    pub fn bucket_mut(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        let child = self.tx.open_child_bucket(self.id, name)?;
        Ok(BucketMut::new(&mut *self.tx, child))
    }

    pub fn create_bucket(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        let child = self.tx.create_child_bucket(self.id, name, false)?;
        Ok(BucketMut::new(&mut *self.tx, child))
    }

    pub fn create_bucket_if_not_exists(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        let child = self.tx.create_child_bucket(self.id, name, true)?;
        Ok(BucketMut::new(&mut *self.tx, child))
    }

    /// Deletes a nested bucket, recursively freeing its subtree into this
    /// transaction's pending list.
    pub fn delete_bucket(&mut self, name: &[u8]) -> Result<()> {
        self.tx.delete_child_bucket(self.id, name)
    }

    pub fn cursor(&self) -> Cursor<'_, 'db> {
        Cursor::new(&*self.tx, BucketRef::Cached(self.id))
    }

    pub fn cursor_mut(&mut self) -> CursorMut<'_, 'db> {
        CursorMut::new(&mut *self.tx, self.id)
    }

    pub fn for_each<F>(&self, visit: F) -> Result<()>
    where
        F: FnMut(&[u8], Option<&[u8]>) -> Result<()>,
    {
        self.as_view().for_each(visit)
    }

    pub fn sequence(&self) -> u64 {
        self.tx.bucket_state(self.id).header.sequence()
    }

    /// Bumps and returns the bucket's monotone sequence counter.
    pub fn next_sequence(&mut self) -> Result<u64> {
        self.tx.bucket_next_sequence(self.id)
    }

    pub fn set_sequence(&mut self, value: u64) -> Result<()> {
        self.tx.bucket_set_sequence(self.id, value)
    }

    pub fn stats(&self) -> Result<BucketStats> {
        self.as_view().stats()
    }
}

impl<'db> Transaction<'db> {
    pub(crate) fn bucket_put(&mut self, id: BucketId, key: &[u8], value: &[u8]) -> Result<()> {
        self.require_writable()?;
        ensure!(!key.is_empty(), Error::KeyRequired);
        ensure!(key.len() <= MAX_KEY_SIZE, Error::KeyTooLarge);
        ensure!(value.len() <= MAX_VALUE_SIZE, Error::ValueTooLarge);

        let leaf = self.materialize_leaf_for(id, key)?;
        if let Ok(i) = self.node(leaf).search(key) {
            ensure!(
                self.node(leaf).inodes[i].flags & LEAF_FLAG_BUCKET == 0,
                Error::BucketNameConflict
            );
        }
        self.node_put(leaf, key, key, value.to_vec(), 0, 0)
    }

    pub(crate) fn bucket_delete(&mut self, id: BucketId, key: &[u8]) -> Result<()> {
        self.require_writable()?;

        let leaf = self.materialize_leaf_for(id, key)?;
        match self.node(leaf).search(key) {
            Err(_) => bail!(Error::NotFound),
            Ok(i) => {
                ensure!(
                    self.node(leaf).inodes[i].flags & LEAF_FLAG_BUCKET == 0,
                    Error::BucketNameConflict
                );
                self.node_del(leaf, key);
                Ok(())
            }
        }
    }

    /// Opens (and caches) a nested bucket's write state.
    pub(crate) fn open_child_bucket(&mut self, parent: BucketId, name: &[u8]) -> Result<BucketId> {
        self.require_writable()?;
        if let Some(&child) = self.bucket_state(parent).children.get(name) {
            ensure!(!self.bucket_state(child).deleted, Error::BucketNotFound);
            return Ok(child);
        }

        let leaf = self.materialize_leaf_for(parent, name)?;
        let (flags, value) = match self.node(leaf).search(name) {
            Err(_) => bail!(Error::BucketNotFound),
            Ok(i) => {
                let inode = &self.node(leaf).inodes[i];
                (inode.flags, inode.value.clone())
            }
        };
        ensure!(flags & LEAF_FLAG_BUCKET != 0, Error::BucketNameConflict);

        let header = BucketHeader::from_bytes(&value)?;
        let inline_page = if header.is_inline() {
            ensure!(
                value.len() >= BUCKET_HEADER_SIZE + PAGE_HEADER_SIZE,
                Error::Corruption
            );
            Some(value[BUCKET_HEADER_SIZE..].to_vec())
        } else {
            None
        };

        let state = BucketState::child(header, inline_page);
        let buckets = &mut self.w_mut().buckets;
        buckets.push(state);
        let child = buckets.len() - 1;
        self.bucket_state_mut(parent)
            .children
            .insert(name.to_vec(), child);
        Ok(child)
    }

    pub(crate) fn create_child_bucket(
        &mut self,
        parent: BucketId,
        name: &[u8],
        if_not_exists: bool,
    ) -> Result<BucketId> {
        self.require_writable()?;
        ensure!(!name.is_empty(), Error::KeyRequired);
        ensure!(name.len() <= MAX_KEY_SIZE, Error::KeyTooLarge);

        let leaf = self.materialize_leaf_for(parent, name)?;
        if let Ok(i) = self.node(leaf).search(name) {
            let flags = self.node(leaf).inodes[i].flags;
            if flags & LEAF_FLAG_BUCKET != 0 {
                if if_not_exists {
                    return self.open_child_bucket(parent, name);
                }
                bail!(Error::BucketExists);
            }
            bail!(Error::BucketNameConflict);
        }

        // New buckets start inline: header plus an empty leaf-page image.
        let mut value = vec![0u8; BUCKET_HEADER_SIZE + PAGE_HEADER_SIZE];
        value[..BUCKET_HEADER_SIZE]
            .copy_from_slice(zerocopy::IntoBytes::as_bytes(&BucketHeader::new(0, 0)));
        PageHeader::new(0, PageKind::Leaf).write_to(&mut value[BUCKET_HEADER_SIZE..])?;

        self.node_put(leaf, name, name, value, 0, LEAF_FLAG_BUCKET)?;
        tracing::debug!(name = %String::from_utf8_lossy(name), "created bucket");
        self.open_child_bucket(parent, name)
    }

    pub(crate) fn delete_child_bucket(&mut self, parent: BucketId, name: &[u8]) -> Result<()> {
        self.require_writable()?;

        let leaf = self.materialize_leaf_for(parent, name)?;
        match self.node(leaf).search(name) {
            Err(_) => bail!(Error::BucketNotFound),
            Ok(i) => ensure!(
                self.node(leaf).inodes[i].flags & LEAF_FLAG_BUCKET != 0,
                Error::BucketNameConflict
            ),
        }

        let child = self.open_child_bucket(parent, name)?;

        // Nested buckets go first.
        let nested: Vec<Vec<u8>> = {
            let view = Bucket::new(self, BucketRef::Cached(child));
            let mut names = Vec::new();
            let mut cursor = view.cursor();
            let mut entry = cursor.first()?;
            while let Some(e) = entry {
                if e.is_bucket() {
                    names.push(e.key().to_vec());
                }
                entry = cursor.next()?;
            }
            names
        };
        for nested_name in nested {
            self.delete_child_bucket(child, &nested_name)?;
        }

        // Free the subtree, drop the in-memory state, unlink the entry.
        let root = self.bucket_state(child).header.root();
        if root != 0 {
            self.free_tree(child, root)?;
        }
        {
            let state = self.bucket_state_mut(child);
            state.nodes.clear();
            state.root_node = None;
            state.inline_page = None;
            state.children.clear();
            state.deleted = true;
        }
        self.bucket_state_mut(parent).children.remove(name);
        ensure!(self.node_del(leaf, name), Error::Corruption);
        Ok(())
    }

    /// Frees every page of a committed subtree into this transaction's
    /// pending list, resolving materialized nodes along the way.
    fn free_tree(&mut self, bucket: BucketId, pgid: Pgid) -> Result<()> {
        if let Some(&node) = self.bucket_state(bucket).nodes.get(&pgid) {
            if !self.node(node).is_leaf {
                let children: Vec<Pgid> =
                    self.node(node).inodes.iter().map(|inode| inode.pgid).collect();
                for child in children {
                    self.free_tree(bucket, child)?;
                }
            }
            let node_pgid = self.node(node).pgid;
            if node_pgid > 0 {
                self.free(node_pgid)?;
                self.node_mut(node).pgid = 0;
            }
            return Ok(());
        }

        let children: Vec<Pgid> = {
            let view = self.page_view(pgid)?;
            if view.is_leaf()? {
                Vec::new()
            } else {
                (0..view.count())
                    .map(|i| view.branch_pgid(i))
                    .collect::<Result<_>>()?
            }
        };
        for child in children {
            self.free_tree(bucket, child)?;
        }
        self.free(pgid)
    }

    pub(crate) fn bucket_next_sequence(&mut self, id: BucketId) -> Result<u64> {
        self.require_writable()?;
        // Materializing the root marks the bucket dirty so the new counter
        // reaches the parent entry at spill.
        self.materialize_root(id)?;
        let state = self.bucket_state_mut(id);
        let value = state.header.sequence() + 1;
        state.header.set_sequence(value);
        Ok(value)
    }

    pub(crate) fn bucket_set_sequence(&mut self, id: BucketId, value: u64) -> Result<()> {
        self.require_writable()?;
        self.materialize_root(id)?;
        self.bucket_state_mut(id).header.set_sequence(value);
        Ok(())
    }

    // ---- commit-time drivers ----

    /// Rebalances every node a delete marked unbalanced, bucket by bucket.
    pub(crate) fn rebalance_all(&mut self) -> Result<()> {
        for bucket in 0..self.w().buckets.len() {
            if self.bucket_state(bucket).deleted {
                continue;
            }
            let mut ids: Vec<NodeId> = self.bucket_state(bucket).nodes.values().copied().collect();
            if let Some(root) = self.bucket_state(bucket).root_node {
                ids.push(root);
            }
            ids.sort_unstable();
            ids.dedup();
            for id in ids {
                self.rebalance_node(id)?;
            }
        }
        Ok(())
    }

    /// Spills the whole dirty tree and moves the meta's root header to the
    /// new root bucket location.
    pub(crate) fn spill_all(&mut self) -> Result<()> {
        self.spill_bucket(ROOT_BUCKET)?;
        let header = self.bucket_state(ROOT_BUCKET).header;
        self.meta.set_root(header);
        Ok(())
    }

    /// Spills one bucket: children first (rewriting their entries in this
    /// bucket), then this bucket's own node tree.
    fn spill_bucket(&mut self, id: BucketId) -> Result<()> {
        let mut names: Vec<Vec<u8>> = self.bucket_state(id).children.keys().cloned().collect();
        names.sort_unstable();

        for name in names {
            let child = self.bucket_state(id).children[&name];
            if self.bucket_state(child).deleted {
                continue;
            }

            let value = if self.bucket_inlineable(child) {
                self.demote_to_inline(child)?
            } else {
                self.spill_bucket(child)?;
                zerocopy::IntoBytes::as_bytes(&self.bucket_state(child).header).to_vec()
            };

            // Untouched subtrees never materialized a root; their parent
            // entry is already correct.
            if self.bucket_state(child).root_node.is_none() {
                continue;
            }

            let leaf = self.materialize_leaf_for(id, &name)?;
            match self.node(leaf).search(&name) {
                Ok(i) => ensure!(
                    self.node(leaf).inodes[i].flags & LEAF_FLAG_BUCKET != 0,
                    Error::Corruption
                ),
                Err(_) => bail!(Error::Corruption),
            }
            self.node_put(leaf, &name, &name, value, 0, LEAF_FLAG_BUCKET)?;
        }

        let Some(root) = self.bucket_state(id).root_node else {
            return Ok(());
        };
        self.spill_node_tree(root)?;
        let new_root = self.root_of(root);
        self.bucket_state_mut(id).root_node = Some(new_root);

        let root_pgid = self.node(new_root).pgid;
        ensure!(root_pgid < self.meta.pgid(), Error::Corruption);
        self.bucket_state_mut(id).header.set_root(root_pgid);
        Ok(())
    }

    /// True when the bucket's whole content fits inline: a leaf root, no
    /// nested buckets, and an image no larger than a quarter page.
    fn bucket_inlineable(&self, id: BucketId) -> bool {
        let Some(root) = self.bucket_state(id).root_node else {
            return false;
        };
        let node = self.node(root);
        if !node.is_leaf {
            return false;
        }
        let threshold = self.page_size() / 4;
        let mut size = PAGE_HEADER_SIZE;
        for inode in &node.inodes {
            if inode.flags & LEAF_FLAG_BUCKET != 0 {
                return false;
            }
            size += crate::storage::LEAF_ELEM_SIZE + inode.key.len() + inode.value.len();
            if size > threshold {
                return false;
            }
        }
        true
    }

    /// Serializes an inlineable bucket into its parent-entry value, freeing
    /// any real root the committed copy still had.
    fn demote_to_inline(&mut self, id: BucketId) -> Result<Vec<u8>> {
        let committed_root = self.bucket_state(id).header.root();
        if committed_root != 0 {
            self.free_tree(id, committed_root)?;
        }
        self.bucket_state_mut(id).header.set_root(0);

        let root = self
            .bucket_state(id)
            .root_node
            .expect("inlineable bucket has a materialized root");
        let node = self.node(root);
        let image = crate::btree::node::serialize_node(node, 0, node.size().max(1));
        let sequence = self.bucket_state(id).header.sequence();

        let mut value = Vec::with_capacity(BUCKET_HEADER_SIZE + image.len());
        value.extend_from_slice(zerocopy::IntoBytes::as_bytes(&BucketHeader::new(0, sequence)));
        value.extend_from_slice(&image);
        Ok(value)
    }
}
