//! # Strict-Mode Verification
//!
//! Walks the tree reachable from this transaction's meta and verifies the
//! structural invariants the writer is supposed to maintain:
//!
//! - every reachable page id lies in `[2, high-water mark)`
//! - no page id is used twice, and none is also on the free list
//! - branch pages point at branch or leaf pages, never meta or freelist
//! - keys on every page ascend strictly
//! - nested bucket headers decode, and inline images are well-formed
//!
//! With `strict_mode(true)` this runs inside every commit, after the data
//! write and before the meta write-back, against the freshly written pages.
//! It is also callable directly; on a live write transaction it verifies
//! the committed snapshot (dirty nodes are not yet pages).

use eyre::{ensure, Result};
use hashbrown::HashSet;

use crate::database::transaction::Transaction;
use crate::error::Error;
use crate::storage::{BucketHeader, PageKind, PageView, Pgid, BUCKET_HEADER_SIZE};

impl Transaction<'_> {
    /// Verifies tree structure, ordering, and page ownership. See the
    /// module docs for the exact invariants.
    pub fn check(&self) -> Result<()> {
        self.require_active()?;

        let hwm = self.meta.pgid();
        let mut seen: HashSet<Pgid> = HashSet::new();

        // The freelist page owns its span.
        let freelist_pgid = self.meta.freelist();
        let view = self.page_view(freelist_pgid)?;
        view.expect_kind(PageKind::Freelist)?;
        for pgid in freelist_pgid..=freelist_pgid + view.overflow() as Pgid {
            ensure!(pgid >= 2 && pgid < hwm, Error::Corruption);
            ensure!(seen.insert(pgid), Error::Corruption);
        }

        let freed: HashSet<Pgid> = self.db.freelist.lock().all_tracked().into_iter().collect();
        for &pgid in &freed {
            ensure!(pgid >= 2 && pgid < hwm, Error::Corruption);
        }

        self.check_subtree(self.meta.root().root(), hwm, &freed, &mut seen)
    }

    fn check_subtree(
        &self,
        pgid: Pgid,
        hwm: Pgid,
        freed: &HashSet<Pgid>,
        seen: &mut HashSet<Pgid>,
    ) -> Result<()> {
        ensure!(pgid >= 2 && pgid < hwm, Error::Corruption);
        ensure!(!freed.contains(&pgid), Error::Corruption);

        let view = self.page_view(pgid)?;
        for span in pgid..=pgid + view.overflow() as Pgid {
            ensure!(span < hwm, Error::Corruption);
            ensure!(seen.insert(span), Error::Corruption);
        }

        if view.is_leaf()? {
            check_leaf(view)?;
            for i in 0..view.count() {
                if view.leaf_elem(i)?.is_bucket() {
                    let value = view.leaf_value(i)?;
                    let header = BucketHeader::from_bytes(value)?;
                    if header.is_inline() {
                        check_leaf(PageView::for_inline(&value[BUCKET_HEADER_SIZE..])?)?;
                    } else {
                        self.check_subtree(header.root(), hwm, freed, seen)?;
                    }
                }
            }
        } else {
            let mut prev: Option<&[u8]> = None;
            for i in 0..view.count() {
                let key = view.branch_key(i)?;
                ensure!(prev.map_or(true, |p| p < key), Error::Corruption);
                prev = Some(key);
            }
            for i in 0..view.count() {
                self.check_subtree(view.branch_pgid(i)?, hwm, freed, seen)?;
            }
        }
        Ok(())
    }
}

fn check_leaf(view: PageView<'_>) -> Result<()> {
    view.expect_kind(PageKind::Leaf)?;
    let mut prev: Option<&[u8]> = None;
    for i in 0..view.count() {
        let key = view.leaf_key(i)?;
        ensure!(prev.map_or(true, |p| p < key), Error::Corruption);
        prev = Some(key);
    }
    Ok(())
}
