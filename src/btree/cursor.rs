//! # Cursors
//!
//! A cursor holds a stack of `(page-or-node, element-index)` frames
//! descending from a bucket's root. Each frame is recorded by pgid (or as
//! the bucket's inline image) and resolved on every access: inside a write
//! transaction a pgid resolves to the materialized node when one exists, so
//! a cursor sees this transaction's uncommitted changes; otherwise it
//! resolves to the committed page.
//!
//! ## Positioning semantics
//!
//! - `first` / `last`: extreme elements of the subtree, skipping over empty
//!   leaves left behind by deletions in the same transaction.
//! - `next` / `prev`: step within the current leaf, or climb until a branch
//!   frame has a sibling and re-descend its edge.
//! - `seek(key)`: greatest-≤ descent through branches, then the first leaf
//!   element with key ≥ target; an exact hit returns that pair, otherwise
//!   the smallest strictly greater key (or nothing at the end of the
//!   bucket).
//! - `delete` (writable cursors): removes the element under the cursor and
//!   marks its node unbalanced. The position afterwards is unspecified;
//!   callers must reposition.
//!
//! Returned [`Entry`] pairs distinguish plain key/value pairs from
//! sub-bucket markers; a sub-bucket entry carries no value.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::btree::bucket::BucketRef;
use crate::btree::node::Node;
use crate::database::transaction::{BucketId, NodeId, Transaction};
use crate::error::Error;
use crate::storage::{PageView, Pgid, LEAF_FLAG_BUCKET};

/// One key/value pair yielded by a cursor.
#[derive(Debug, Clone, Copy)]
pub struct Entry<'a> {
    key: &'a [u8],
    value: Option<&'a [u8]>,
}

impl<'a> Entry<'a> {
    pub fn key(&self) -> &'a [u8] {
        self.key
    }

    /// The value, or `None` for sub-bucket markers.
    pub fn value(&self) -> Option<&'a [u8]> {
        self.value
    }

    pub fn is_bucket(&self) -> bool {
        self.value.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum FrameRef {
    /// A page by id, resolved through the node cache first.
    Page(Pgid),
    /// The bucket's own inline image (or its materialized root node).
    Inline,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    fr: FrameRef,
    index: usize,
}

type Stack = SmallVec<[Frame; 8]>;

/// A page or its in-memory replacement, behind one set of accessors.
pub(crate) enum PageOrNode<'a> {
    Page(PageView<'a>),
    Node(&'a Node),
}

impl<'a> PageOrNode<'a> {
    pub(crate) fn count(&self) -> usize {
        match self {
            PageOrNode::Page(view) => view.count(),
            PageOrNode::Node(node) => node.inodes.len(),
        }
    }

    pub(crate) fn is_leaf(&self) -> Result<bool> {
        match self {
            PageOrNode::Page(view) => view.is_leaf(),
            PageOrNode::Node(node) => Ok(node.is_leaf),
        }
    }

    pub(crate) fn branch_pgid(&self, index: usize) -> Result<Pgid> {
        match self {
            PageOrNode::Page(view) => view.branch_pgid(index),
            PageOrNode::Node(node) => Ok(node.inodes[index].pgid),
        }
    }

    fn branch_lookup(&self, key: &[u8]) -> Result<usize> {
        match self {
            PageOrNode::Page(view) => view.branch_lookup(key),
            PageOrNode::Node(node) => Ok(node.branch_lookup(key)),
        }
    }

    fn leaf_search(&self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        match self {
            PageOrNode::Page(view) => view.leaf_search(key),
            PageOrNode::Node(node) => Ok(node.search(key)),
        }
    }

    pub(crate) fn leaf_entry(&self, index: usize) -> Result<(u32, &'a [u8], &'a [u8])> {
        match self {
            PageOrNode::Page(view) => {
                let elem = view.leaf_elem(index)?;
                Ok((elem.flags(), view.leaf_key(index)?, view.leaf_value(index)?))
            }
            PageOrNode::Node(node) => {
                let inode = node
                    .inodes
                    .get(index)
                    .ok_or_else(|| eyre::Report::new(Error::Corruption))?;
                Ok((inode.flags, &inode.key, &inode.value))
            }
        }
    }
}

/// The frame for a bucket's root.
pub(crate) fn root_frame(bref: BucketRef<'_>, tx: &Transaction<'_>) -> FrameRef {
    let root = match bref {
        BucketRef::Cached(id) => tx.bucket_state(id).header.root(),
        BucketRef::Detached { header, .. } => header.root(),
    };
    if root == 0 {
        FrameRef::Inline
    } else {
        FrameRef::Page(root)
    }
}

/// Resolves a frame, preferring materialized nodes over committed pages.
pub(crate) fn resolve_frame<'a>(
    tx: &'a Transaction<'_>,
    bref: BucketRef<'a>,
    fr: FrameRef,
) -> Result<PageOrNode<'a>> {
    match fr {
        FrameRef::Page(pgid) => {
            if let BucketRef::Cached(id) = bref {
                if let Some(&node) = tx.bucket_state(id).nodes.get(&pgid) {
                    return Ok(PageOrNode::Node(tx.node(node)));
                }
            }
            Ok(PageOrNode::Page(tx.page_view(pgid)?))
        }
        FrameRef::Inline => match bref {
            BucketRef::Cached(id) => {
                let state = tx.bucket_state(id);
                if let Some(root) = state.root_node {
                    return Ok(PageOrNode::Node(tx.node(root)));
                }
                let image = state
                    .inline_page
                    .as_deref()
                    .ok_or_else(|| eyre::Report::new(Error::Corruption))?;
                Ok(PageOrNode::Page(PageView::for_inline(image)?))
            }
            BucketRef::Detached { inline, .. } => {
                let image = inline.ok_or_else(|| eyre::Report::new(Error::Corruption))?;
                Ok(PageOrNode::Page(PageView::for_inline(image)?))
            }
        },
    }
}

fn entry_from<'a>(raw: (u32, &'a [u8], &'a [u8])) -> Entry<'a> {
    let (flags, key, value) = raw;
    if flags & LEAF_FLAG_BUCKET != 0 {
        Entry { key, value: None }
    } else {
        Entry {
            key,
            value: Some(value),
        }
    }
}

// ---- shared navigation over (tx, bucket, stack) ----

fn top_entry<'a>(
    tx: &'a Transaction<'_>,
    bref: BucketRef<'a>,
    stack: &Stack,
) -> Result<(u32, &'a [u8], &'a [u8])> {
    let frame = stack.last().ok_or_else(|| eyre::Report::new(Error::NotFound))?;
    let pon = resolve_frame(tx, bref, frame.fr)?;
    ensure!(pon.is_leaf()?, Error::Corruption);
    ensure!(frame.index < pon.count(), Error::NotFound);
    pon.leaf_entry(frame.index)
}

/// Descends from the current top along the `index`-selected edges to a
/// leaf, pushing a frame per level (leftmost when `last` is false).
fn descend(
    tx: &Transaction<'_>,
    bref: BucketRef<'_>,
    stack: &mut Stack,
    last: bool,
) -> Result<()> {
    loop {
        let frame = *stack.last().expect("descend from a pushed root");
        let pon = resolve_frame(tx, bref, frame.fr)?;
        if pon.is_leaf()? {
            return Ok(());
        }
        ensure!(frame.index < pon.count(), Error::Corruption);
        let child = pon.branch_pgid(frame.index)?;
        let child_pon = resolve_frame(tx, bref, FrameRef::Page(child))?;
        let index = if last {
            child_pon.count().saturating_sub(1)
        } else {
            0
        };
        stack.push(Frame {
            fr: FrameRef::Page(child),
            index,
        });
    }
}

fn nav_first<'a>(
    tx: &'a Transaction<'_>,
    bref: BucketRef<'a>,
    stack: &mut Stack,
) -> Result<Option<(u32, &'a [u8], &'a [u8])>> {
    stack.clear();
    let root = root_frame(bref, tx);
    let count = resolve_frame(tx, bref, root)?.count();
    stack.push(Frame { fr: root, index: 0 });
    if count == 0 && !resolve_frame(tx, bref, root)?.is_leaf()? {
        bail!(Error::Corruption);
    }
    descend(tx, bref, stack, false)?;
    let top = resolve_frame(tx, bref, stack.last().expect("root frame").fr)?;
    if top.count() == 0 {
        return nav_next(tx, bref, stack);
    }
    top_entry(tx, bref, stack).map(Some)
}

fn nav_last<'a>(
    tx: &'a Transaction<'_>,
    bref: BucketRef<'a>,
    stack: &mut Stack,
) -> Result<Option<(u32, &'a [u8], &'a [u8])>> {
    stack.clear();
    let root = root_frame(bref, tx);
    let count = resolve_frame(tx, bref, root)?.count();
    stack.push(Frame {
        fr: root,
        index: count.saturating_sub(1),
    });
    descend(tx, bref, stack, true)?;
    let top = resolve_frame(tx, bref, stack.last().expect("root frame").fr)?;
    if top.count() == 0 {
        return nav_prev(tx, bref, stack);
    }
    top_entry(tx, bref, stack).map(Some)
}

fn nav_next<'a>(
    tx: &'a Transaction<'_>,
    bref: BucketRef<'a>,
    stack: &mut Stack,
) -> Result<Option<(u32, &'a [u8], &'a [u8])>> {
    loop {
        // Deepest frame that still has an element to its right.
        let mut level = stack.len();
        while level > 0 {
            let frame = stack[level - 1];
            let count = resolve_frame(tx, bref, frame.fr)?.count();
            if frame.index + 1 < count {
                break;
            }
            level -= 1;
        }
        if level == 0 {
            return Ok(None);
        }

        stack[level - 1].index += 1;
        stack.truncate(level);
        descend(tx, bref, stack, false)?;

        let top = resolve_frame(tx, bref, stack.last().expect("nonempty stack").fr)?;
        if top.count() > 0 {
            return top_entry(tx, bref, stack).map(Some);
        }
        // Empty leaf left by a same-transaction delete: keep walking.
    }
}

fn nav_prev<'a>(
    tx: &'a Transaction<'_>,
    bref: BucketRef<'a>,
    stack: &mut Stack,
) -> Result<Option<(u32, &'a [u8], &'a [u8])>> {
    loop {
        let mut level = stack.len();
        while level > 0 {
            if stack[level - 1].index > 0 {
                break;
            }
            level -= 1;
        }
        if level == 0 {
            return Ok(None);
        }

        stack[level - 1].index -= 1;
        stack.truncate(level);
        descend(tx, bref, stack, true)?;

        let top = resolve_frame(tx, bref, stack.last().expect("nonempty stack").fr)?;
        if top.count() > 0 {
            return top_entry(tx, bref, stack).map(Some);
        }
    }
}

fn nav_seek<'a>(
    tx: &'a Transaction<'_>,
    bref: BucketRef<'a>,
    stack: &mut Stack,
    key: &[u8],
) -> Result<Option<(u32, &'a [u8], &'a [u8])>> {
    seek_to(tx, bref, stack, key)?;
    let frame = *stack.last().expect("seek pushed a root");
    let count = resolve_frame(tx, bref, frame.fr)?.count();
    if frame.index >= count {
        // Ran off the right edge of this leaf; the successor (if any)
        // lives under a later branch.
        return nav_next(tx, bref, stack);
    }
    top_entry(tx, bref, stack).map(Some)
}

/// Positions the stack at the first leaf slot with key ≥ target (the slot
/// may be one past the end of the leaf).
fn seek_to(tx: &Transaction<'_>, bref: BucketRef<'_>, stack: &mut Stack, key: &[u8]) -> Result<()> {
    stack.clear();
    let mut fr = root_frame(bref, tx);
    loop {
        let pon = resolve_frame(tx, bref, fr)?;
        if pon.is_leaf()? {
            let index = match pon.leaf_search(key)? {
                Ok(i) => i,
                Err(i) => i,
            };
            stack.push(Frame { fr, index });
            return Ok(());
        }
        ensure!(pon.count() > 0, Error::Corruption);
        let index = pon.branch_lookup(key)?;
        let child = pon.branch_pgid(index)?;
        stack.push(Frame { fr, index });
        fr = FrameRef::Page(child);
    }
}

/// Exact-match lookup used by bucket `get` and sub-bucket resolution.
pub(crate) fn seek_exact<'a>(
    tx: &'a Transaction<'_>,
    bref: BucketRef<'a>,
    key: &[u8],
) -> Result<Option<(u32, &'a [u8], &'a [u8])>> {
    let mut stack = Stack::new();
    seek_to(tx, bref, &mut stack, key)?;
    let frame = *stack.last().expect("seek pushed a root");
    let pon = resolve_frame(tx, bref, frame.fr)?;
    if frame.index >= pon.count() {
        return Ok(None);
    }
    let (flags, found, value) = pon.leaf_entry(frame.index)?;
    if found == key {
        Ok(Some((flags, found, value)))
    } else {
        Ok(None)
    }
}

/// Read cursor over one bucket's subtree.
pub struct Cursor<'a, 'db> {
    tx: &'a Transaction<'db>,
    bref: BucketRef<'a>,
    stack: Stack,
}

impl<'a, 'db> Cursor<'a, 'db> {
    pub(crate) fn new(tx: &'a Transaction<'db>, bref: BucketRef<'a>) -> Self {
        Self {
            tx,
            bref,
            stack: Stack::new(),
        }
    }

    pub fn first(&mut self) -> Result<Option<Entry<'a>>> {
        Ok(nav_first(self.tx, self.bref, &mut self.stack)?.map(entry_from))
    }

    pub fn last(&mut self) -> Result<Option<Entry<'a>>> {
        Ok(nav_last(self.tx, self.bref, &mut self.stack)?.map(entry_from))
    }

    pub fn next(&mut self) -> Result<Option<Entry<'a>>> {
        if self.stack.is_empty() {
            return self.first();
        }
        Ok(nav_next(self.tx, self.bref, &mut self.stack)?.map(entry_from))
    }

    pub fn prev(&mut self) -> Result<Option<Entry<'a>>> {
        if self.stack.is_empty() {
            return self.last();
        }
        Ok(nav_prev(self.tx, self.bref, &mut self.stack)?.map(entry_from))
    }

    pub fn seek(&mut self, key: &[u8]) -> Result<Option<Entry<'a>>> {
        Ok(nav_seek(self.tx, self.bref, &mut self.stack, key)?.map(entry_from))
    }
}

/// Cursor over a writable bucket; adds `delete`.
pub struct CursorMut<'a, 'db> {
    tx: &'a mut Transaction<'db>,
    bucket: BucketId,
    stack: Stack,
}

impl<'a, 'db> CursorMut<'a, 'db> {
    pub(crate) fn new(tx: &'a mut Transaction<'db>, bucket: BucketId) -> Self {
        Self {
            tx,
            bucket,
            stack: Stack::new(),
        }
    }

    pub fn first(&mut self) -> Result<Option<Entry<'_>>> {
        let bref = BucketRef::Cached(self.bucket);
        Ok(nav_first(&*self.tx, bref, &mut self.stack)?.map(entry_from))
    }

    pub fn last(&mut self) -> Result<Option<Entry<'_>>> {
        let bref = BucketRef::Cached(self.bucket);
        Ok(nav_last(&*self.tx, bref, &mut self.stack)?.map(entry_from))
    }

    pub fn next(&mut self) -> Result<Option<Entry<'_>>> {
        let bref = BucketRef::Cached(self.bucket);
        if self.stack.is_empty() {
            return Ok(nav_first(&*self.tx, bref, &mut self.stack)?.map(entry_from));
        }
        Ok(nav_next(&*self.tx, bref, &mut self.stack)?.map(entry_from))
    }

    pub fn prev(&mut self) -> Result<Option<Entry<'_>>> {
        let bref = BucketRef::Cached(self.bucket);
        if self.stack.is_empty() {
            return Ok(nav_last(&*self.tx, bref, &mut self.stack)?.map(entry_from));
        }
        Ok(nav_prev(&*self.tx, bref, &mut self.stack)?.map(entry_from))
    }

    pub fn seek(&mut self, key: &[u8]) -> Result<Option<Entry<'_>>> {
        let bref = BucketRef::Cached(self.bucket);
        Ok(nav_seek(&*self.tx, bref, &mut self.stack, key)?.map(entry_from))
    }

    /// Removes the element under the cursor. Valid only when positioned on
    /// a plain leaf element. The cursor position afterwards is unspecified.
    pub fn delete(&mut self) -> Result<()> {
        self.tx.require_writable()?;
        let (flags, key) = {
            let bref = BucketRef::Cached(self.bucket);
            let (flags, key, _) = top_entry(&*self.tx, bref, &self.stack)?;
            (flags, key.to_vec())
        };
        ensure!(flags & LEAF_FLAG_BUCKET == 0, Error::BucketNameConflict);

        // Materialize the node path recorded in the stack.
        let mut parent: Option<NodeId> = None;
        for frame in self.stack.clone() {
            let pgid = match frame.fr {
                FrameRef::Inline => 0,
                FrameRef::Page(pgid) => pgid,
            };
            let id = self.tx.node_for(self.bucket, pgid, parent)?;
            parent = Some(id);
        }
        let leaf = parent.ok_or_else(|| eyre::Report::new(Error::NotFound))?;
        ensure!(self.tx.node(leaf).is_leaf, Error::Corruption);
        ensure!(self.tx.node_del(leaf, &key), Error::NotFound);
        Ok(())
    }
}
