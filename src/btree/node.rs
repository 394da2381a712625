//! # Nodes
//!
//! A node is the in-memory, mutable image of one B+tree page, materialized
//! on demand inside a write transaction. Reads never build nodes; they walk
//! pages directly. Writes descend the tree materializing only the path they
//! touch, mutate the leaf's inode list, and at commit the dirty subtree is
//! rebalanced and spilled back into freshly allocated pages.
//!
//! ## Arena
//!
//! All nodes of a transaction live in one `Vec<Node>` owned by the write
//! state; `NodeId` indices stand in for pointers. Parent and child links are
//! ids, so the parent/child graph needs no reference counting and no
//! unsafe back-pointers. Orphaned nodes (merged away during rebalance) just
//! stay in the arena unused until the transaction ends.
//!
//! ## Rebalance
//!
//! Runs once per commit over every node a delete marked `unbalanced`:
//!
//! - empty node: removed from its parent, page freed
//! - root branch holding one inode: its only child is promoted into it
//! - single child of a non-root parent: hoisted into the parent
//! - serialized size below ¼ page (or too few keys): merged into its left
//!   sibling, or absorbed from the right sibling when it is leftmost
//!
//! The root itself is never merged sideways.
//!
//! ## Spill
//!
//! Depth-first, children before parents. A node larger than
//! `page_size * (1 + fill_percent)` splits: cut the smallest prefix that
//! holds at least the minimum fill (10% of a page) and at least two keys,
//! repeat on the suffix. Every resulting node gets a fresh pgid (its old
//! page moves to this transaction's pending list), is serialized into a
//! dirty buffer, and re-registers itself under its parent with its new
//! first key. A split of the root grows the tree by one level.

use eyre::{ensure, Result};

use crate::database::transaction::{BucketId, NodeId, Transaction};
use crate::error::Error;
use crate::storage::{
    BranchElem, LeafElem, PageHeader, PageKind, PageView, Pgid, BRANCH_ELEM_SIZE, LEAF_ELEM_SIZE,
    PAGE_HEADER_SIZE,
};

/// Minimum keys on either side of a split cut.
pub(crate) const MIN_KEYS_PER_PAGE: usize = 2;

/// Soft fill target for spilled pages.
pub(crate) const DEFAULT_FILL_PERCENT: f64 = 0.5;

const MIN_FILL_PERCENT: f64 = 0.1;
const MAX_FILL_PERCENT: f64 = 1.0;

#[derive(Debug, Clone)]
pub(crate) struct Inode {
    pub(crate) flags: u32,
    pub(crate) pgid: Pgid,
    pub(crate) key: Vec<u8>,
    pub(crate) value: Vec<u8>,
}

impl Inode {
    fn elem_size(&self, is_leaf: bool) -> usize {
        if is_leaf {
            LEAF_ELEM_SIZE + self.key.len() + self.value.len()
        } else {
            BRANCH_ELEM_SIZE + self.key.len()
        }
    }
}

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) bucket: BucketId,
    pub(crate) is_leaf: bool,
    pub(crate) unbalanced: bool,
    pub(crate) spilled: bool,
    /// Pgid of the page this node was read from; 0 for nodes created in
    /// this transaction (and for inline bucket roots).
    pub(crate) pgid: Pgid,
    pub(crate) parent: Option<NodeId>,
    /// Materialized children, maintained for spill ordering.
    pub(crate) children: Vec<NodeId>,
    /// First key at materialization time; matches the parent's separator.
    pub(crate) key: Vec<u8>,
    pub(crate) inodes: Vec<Inode>,
}

impl Node {
    pub(crate) fn new(bucket: BucketId, is_leaf: bool) -> Self {
        Self {
            bucket,
            is_leaf,
            unbalanced: false,
            spilled: false,
            pgid: 0,
            parent: None,
            children: Vec::new(),
            key: Vec::new(),
            inodes: Vec::new(),
        }
    }

    /// Serialized size: header, element records, key/value payloads.
    pub(crate) fn size(&self) -> usize {
        PAGE_HEADER_SIZE
            + self
                .inodes
                .iter()
                .map(|inode| inode.elem_size(self.is_leaf))
                .sum::<usize>()
    }

    pub(crate) fn min_keys(&self) -> usize {
        if self.is_leaf {
            1
        } else {
            2
        }
    }

    /// Exact binary search among inode keys.
    pub(crate) fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.inodes.binary_search_by(|inode| inode.key.as_slice().cmp(key))
    }

    /// Index of the child to descend into: greatest separator ≤ `key`, or
    /// the leftmost child when `key` precedes every separator.
    pub(crate) fn branch_lookup(&self, key: &[u8]) -> usize {
        self.inodes
            .partition_point(|inode| inode.key.as_slice() <= key)
            .saturating_sub(1)
    }
}

fn clamp_fill(fill: f64) -> f64 {
    fill.clamp(MIN_FILL_PERCENT, MAX_FILL_PERCENT)
}

/// Serializes a node into page buffers, overflow included.
pub(crate) fn serialize_node(node: &Node, pgid: Pgid, page_size: usize) -> Vec<u8> {
    let size = node.size();
    let pages = size.div_ceil(page_size);
    let mut buf = vec![0u8; pages * page_size];

    debug_assert!(node.inodes.len() <= u16::MAX as usize);
    let kind = if node.is_leaf {
        PageKind::Leaf
    } else {
        PageKind::Branch
    };
    let mut header = PageHeader::new(pgid, kind);
    header.set_count(node.inodes.len() as u16);
    header.set_overflow((pages - 1) as u32);
    header.write_to(&mut buf).expect("buffer sized for header");

    let elem_size = if node.is_leaf {
        LEAF_ELEM_SIZE
    } else {
        BRANCH_ELEM_SIZE
    };
    let mut data_off = PAGE_HEADER_SIZE + node.inodes.len() * elem_size;
    for (i, inode) in node.inodes.iter().enumerate() {
        let elem_off = PAGE_HEADER_SIZE + i * elem_size;
        let pos = (data_off - elem_off) as u32;
        if node.is_leaf {
            let elem = LeafElem::new(
                inode.flags,
                pos,
                inode.key.len() as u32,
                inode.value.len() as u32,
            );
            buf[elem_off..elem_off + LEAF_ELEM_SIZE]
                .copy_from_slice(zerocopy::IntoBytes::as_bytes(&elem));
        } else {
            let elem = BranchElem::new(pos, inode.key.len() as u32, inode.pgid);
            buf[elem_off..elem_off + BRANCH_ELEM_SIZE]
                .copy_from_slice(zerocopy::IntoBytes::as_bytes(&elem));
        }
        buf[data_off..data_off + inode.key.len()].copy_from_slice(&inode.key);
        data_off += inode.key.len();
        if node.is_leaf {
            buf[data_off..data_off + inode.value.len()].copy_from_slice(&inode.value);
            data_off += inode.value.len();
        }
    }
    buf
}

/// Decodes a branch or leaf page into owned inodes.
pub(crate) fn decode_node(view: PageView<'_>) -> Result<(bool, Vec<Inode>)> {
    let is_leaf = view.is_leaf()?;
    let count = view.count();
    let mut inodes = Vec::with_capacity(count);
    for i in 0..count {
        if is_leaf {
            let elem = view.leaf_elem(i)?;
            inodes.push(Inode {
                flags: elem.flags(),
                pgid: 0,
                key: view.leaf_key(i)?.to_vec(),
                value: view.leaf_value(i)?.to_vec(),
            });
        } else {
            inodes.push(Inode {
                flags: 0,
                pgid: view.branch_pgid(i)?,
                key: view.branch_key(i)?.to_vec(),
                value: Vec::new(),
            });
        }
    }
    Ok((is_leaf, inodes))
}

impl<'db> Transaction<'db> {
    pub(crate) fn push_node(&mut self, node: Node) -> NodeId {
        let nodes = &mut self.w_mut().nodes;
        nodes.push(node);
        nodes.len() - 1
    }

    /// Returns the cached node for `pgid`, materializing it from its page
    /// (or from the bucket's inline image when `pgid == 0`) on first use.
    pub(crate) fn node_for(
        &mut self,
        bucket: BucketId,
        pgid: Pgid,
        parent: Option<NodeId>,
    ) -> Result<NodeId> {
        if pgid == 0 {
            if let Some(root) = self.bucket_state(bucket).root_node {
                return Ok(root);
            }
            let (is_leaf, inodes) = {
                let state = self.bucket_state(bucket);
                let image = state
                    .inline_page
                    .as_deref()
                    .ok_or_else(|| eyre::Report::new(Error::Corruption))?;
                decode_node(PageView::for_inline(image)?)?
            };
            let mut node = Node::new(bucket, is_leaf);
            node.key = inodes.first().map(|inode| inode.key.clone()).unwrap_or_default();
            node.inodes = inodes;
            let id = self.push_node(node);
            self.bucket_state_mut(bucket).root_node = Some(id);
            return Ok(id);
        }

        if let Some(&id) = self.bucket_state(bucket).nodes.get(&pgid) {
            return Ok(id);
        }

        let (is_leaf, inodes) = decode_node(self.page_view(pgid)?)?;
        let mut node = Node::new(bucket, is_leaf);
        node.pgid = pgid;
        node.parent = parent;
        node.key = inodes.first().map(|inode| inode.key.clone()).unwrap_or_default();
        node.inodes = inodes;
        let id = self.push_node(node);

        self.bucket_state_mut(bucket).nodes.insert(pgid, id);
        match parent {
            Some(p) => self.node_mut(p).children.push(id),
            None => self.bucket_state_mut(bucket).root_node = Some(id),
        }
        Ok(id)
    }

    /// The bucket's root node, materialized.
    pub(crate) fn materialize_root(&mut self, bucket: BucketId) -> Result<NodeId> {
        if let Some(root) = self.bucket_state(bucket).root_node {
            return Ok(root);
        }
        let root_pgid = self.bucket_state(bucket).header.root();
        self.node_for(bucket, root_pgid, None)
    }

    /// Descends from the bucket root to the leaf responsible for `key`,
    /// materializing the whole path.
    pub(crate) fn materialize_leaf_for(&mut self, bucket: BucketId, key: &[u8]) -> Result<NodeId> {
        let mut id = self.materialize_root(bucket)?;
        loop {
            if self.node(id).is_leaf {
                return Ok(id);
            }
            ensure!(!self.node(id).inodes.is_empty(), Error::Corruption);
            let index = self.node(id).branch_lookup(key);
            let child = self.node(id).inodes[index].pgid;
            id = self.node_for(bucket, child, Some(id))?;
        }
    }

    /// Inserts or replaces an inode. `old_key` locates the slot (it differs
    /// from `new_key` when a spill re-registers a node under its new first
    /// key); `pgid` is set for branch entries, `value` for leaf entries.
    pub(crate) fn node_put(
        &mut self,
        id: NodeId,
        old_key: &[u8],
        new_key: &[u8],
        value: Vec<u8>,
        pgid: Pgid,
        flags: u32,
    ) -> Result<()> {
        ensure!(pgid < self.meta.pgid(), Error::Corruption);
        debug_assert!(!new_key.is_empty(), "inode keys are never empty");

        let node = self.node_mut(id);
        match node.search(old_key) {
            Ok(i) => {
                let inode = &mut node.inodes[i];
                inode.flags = flags;
                inode.pgid = pgid;
                inode.key = new_key.to_vec();
                inode.value = value;
            }
            Err(i) => node.inodes.insert(
                i,
                Inode {
                    flags,
                    pgid,
                    key: new_key.to_vec(),
                    value,
                },
            ),
        }
        Ok(())
    }

    /// Removes an inode by exact key; marks the node unbalanced. Returns
    /// whether the key existed.
    pub(crate) fn node_del(&mut self, id: NodeId, key: &[u8]) -> bool {
        let node = self.node_mut(id);
        match node.search(key) {
            Ok(i) => {
                node.inodes.remove(i);
                node.unbalanced = true;
                true
            }
            Err(_) => false,
        }
    }

    fn free_node_page(&mut self, id: NodeId) -> Result<()> {
        let pgid = self.node(id).pgid;
        if pgid > 0 {
            self.free(pgid)?;
            self.node_mut(id).pgid = 0;
        }
        Ok(())
    }

    fn remove_child(&mut self, parent: NodeId, child: NodeId) {
        self.node_mut(parent).children.retain(|&c| c != child);
    }

    /// Position of `child` under `parent`, located by the child's
    /// materialization-time first key (which is the parent's separator).
    fn child_index(&self, parent: NodeId, child: NodeId) -> Result<usize> {
        let key = &self.node(child).key;
        self.node(parent)
            .search(key)
            .map_err(|_| eyre::Report::new(Error::Corruption))
    }

    fn child_at(&mut self, bucket: BucketId, parent: NodeId, index: usize) -> Result<NodeId> {
        ensure!(index < self.node(parent).inodes.len(), Error::Corruption);
        let pgid = self.node(parent).inodes[index].pgid;
        self.node_for(bucket, pgid, Some(parent))
    }

    /// Follows parent links to the topmost node of a spilled/split tree.
    pub(crate) fn root_of(&self, mut id: NodeId) -> NodeId {
        while let Some(parent) = self.node(id).parent {
            id = parent;
        }
        id
    }

    // ---- rebalance ----

    pub(crate) fn rebalance_node(&mut self, id: NodeId) -> Result<()> {
        if !self.node(id).unbalanced {
            return Ok(());
        }
        self.node_mut(id).unbalanced = false;

        let threshold = self.page_size() / 4;
        {
            let node = self.node(id);
            if node.size() > threshold && node.inodes.len() > node.min_keys() {
                return Ok(());
            }
        }

        let bucket = self.node(id).bucket;
        let Some(parent) = self.node(id).parent else {
            // Root is never merged sideways; a branch root left with a
            // single inode promotes its only child (repeatedly, if whole
            // levels emptied out).
            while !self.node(id).is_leaf && self.node(id).inodes.len() == 1 {
                let child_pgid = self.node(id).inodes[0].pgid;
                let child = self.node_for(bucket, child_pgid, Some(id))?;
                self.adopt_into(id, child)?;
            }
            return Ok(());
        };

        if self.node(id).inodes.is_empty() {
            let key = self.node(id).key.clone();
            ensure!(self.node_del(parent, &key), Error::Corruption);
            self.remove_child(parent, id);
            let pgid = self.node(id).pgid;
            self.bucket_state_mut(bucket).nodes.remove(&pgid);
            self.free_node_page(id)?;
            return self.rebalance_node(parent);
        }

        if self.node(parent).inodes.len() == 1 {
            // Single child of a non-root parent: hoist into the parent.
            self.adopt_into(parent, id)?;
            return self.rebalance_node(parent);
        }

        let index = self.child_index(parent, id)?;
        let (from, to) = if index == 0 {
            // Leftmost: absorb the right sibling.
            (self.child_at(bucket, parent, index + 1)?, id)
        } else {
            // Merge into the left sibling.
            (id, self.child_at(bucket, parent, index - 1)?)
        };
        debug_assert!(self.node(from).is_leaf == self.node(to).is_leaf);

        let moved = std::mem::take(&mut self.node_mut(from).children);
        for &child in &moved {
            self.node_mut(child).parent = Some(to);
        }
        self.node_mut(to).children.extend(moved);

        let mut inodes = std::mem::take(&mut self.node_mut(from).inodes);
        self.node_mut(to).inodes.append(&mut inodes);

        let from_key = self.node(from).key.clone();
        ensure!(self.node_del(parent, &from_key), Error::Corruption);
        self.remove_child(parent, from);
        let from_pgid = self.node(from).pgid;
        self.bucket_state_mut(bucket).nodes.remove(&from_pgid);
        self.free_node_page(from)?;

        self.rebalance_node(parent)
    }

    /// Replaces `target`'s content with `source`'s, freeing `source`'s
    /// page and orphaning its node.
    fn adopt_into(&mut self, target: NodeId, source: NodeId) -> Result<()> {
        let bucket = self.node(target).bucket;
        let is_leaf = self.node(source).is_leaf;
        let inodes = std::mem::take(&mut self.node_mut(source).inodes);
        let children = std::mem::take(&mut self.node_mut(source).children);

        {
            let node = self.node_mut(target);
            node.is_leaf = is_leaf;
            node.inodes = inodes;
            node.children = children.clone();
        }
        for child in children {
            self.node_mut(child).parent = Some(target);
        }

        let source_pgid = self.node(source).pgid;
        self.bucket_state_mut(bucket).nodes.remove(&source_pgid);
        self.node_mut(source).parent = None;
        self.free_node_page(source)?;
        self.remove_child(target, source);
        Ok(())
    }

    // ---- spill ----

    /// Splits an oversized node into page-sized chunks sharing one parent,
    /// creating the parent when the node was a root. Returns the chunks in
    /// key order, the original node first.
    fn split_node(&mut self, id: NodeId) -> Result<Vec<NodeId>> {
        let fill = clamp_fill(self.bucket_state(self.node(id).bucket).fill_percent);
        let mut parts = vec![id];
        let mut current = id;
        while let Some(next) = self.split_two(current, fill)? {
            parts.push(next);
            current = next;
        }
        Ok(parts)
    }

    fn split_two(&mut self, id: NodeId, fill: f64) -> Result<Option<NodeId>> {
        let page_size = self.page_size();
        let split_index = {
            let node = self.node(id);
            if node.inodes.len() <= MIN_KEYS_PER_PAGE * 2 {
                return Ok(None);
            }
            let trigger = (page_size as f64 * (1.0 + fill)) as usize;
            if node.size() <= trigger {
                return Ok(None);
            }

            // Smallest prefix holding at least the minimum fill and at
            // least two keys; the suffix keeps at least two keys as well.
            let soft_cap = (page_size as f64 * fill) as usize;
            let min_fill_bytes = page_size / 10;
            let max_index = node.inodes.len() - MIN_KEYS_PER_PAGE;
            let mut acc = PAGE_HEADER_SIZE;
            let mut index = max_index;
            for (i, inode) in node.inodes.iter().enumerate() {
                let elem = inode.elem_size(node.is_leaf);
                if i >= MIN_KEYS_PER_PAGE && acc >= min_fill_bytes && acc + elem > soft_cap {
                    index = i;
                    break;
                }
                acc += elem;
            }
            index.clamp(MIN_KEYS_PER_PAGE, max_index)
        };

        let bucket = self.node(id).bucket;
        let parent = match self.node(id).parent {
            Some(p) => p,
            None => {
                let mut root = Node::new(bucket, false);
                root.children.push(id);
                let p = self.push_node(root);
                self.node_mut(id).parent = Some(p);
                p
            }
        };

        let is_leaf = self.node(id).is_leaf;
        let tail = self.node_mut(id).inodes.split_off(split_index);
        let mut sibling = Node::new(bucket, is_leaf);
        sibling.parent = Some(parent);
        sibling.inodes = tail;
        let sibling_id = self.push_node(sibling);
        self.node_mut(parent).children.push(sibling_id);
        Ok(Some(sibling_id))
    }

    /// Spills the subtree rooted at `id`: children first, then this node,
    /// splitting as needed; finally any parent chain a root split created.
    pub(crate) fn spill_node_tree(&mut self, id: NodeId) -> Result<()> {
        if self.node(id).spilled {
            return Ok(());
        }

        let mut kids = self.node(id).children.clone();
        kids.sort_by(|&a, &b| self.node(a).key.cmp(&self.node(b).key));
        for kid in kids {
            self.spill_node_tree(kid)?;
        }

        let parts = self.split_node(id)?;
        let page_size = self.page_size();
        for part in parts {
            let old = self.node(part).pgid;
            if old > 0 {
                self.free(old)?;
                self.node_mut(part).pgid = 0;
            }

            let pages = self.node(part).size().div_ceil(page_size);
            let pgid = self.allocate(pages)?;
            ensure!(pgid < self.meta.pgid(), Error::Corruption);

            let buf = serialize_node(self.node(part), pgid, page_size);
            self.w_mut().dirty.insert(pgid, buf);
            {
                let node = self.node_mut(part);
                node.pgid = pgid;
                node.spilled = true;
            }

            if let Some(parent) = self.node(part).parent {
                let node = self.node(part);
                let old_key = if node.key.is_empty() {
                    node.inodes[0].key.clone()
                } else {
                    node.key.clone()
                };
                let first = node.inodes[0].key.clone();
                self.node_put(parent, &old_key, &first, Vec::new(), pgid, 0)?;
                self.node_mut(part).key = first;
            }
        }

        // A root split minted a fresh parent (pgid 0); it holds the new
        // separators and spills in turn, possibly cascading upward.
        if let Some(parent) = self.node(id).parent {
            if self.node(parent).pgid == 0 && !self.node(parent).spilled {
                self.node_mut(id).children.clear();
                return self.spill_node_tree(parent);
            }
        }
        Ok(())
    }
}
