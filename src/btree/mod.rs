//! # B+tree Layer
//!
//! The logical tree over the storage layer: lexicographically ordered keys
//! in leaf pages, separator keys and child pgids in branch pages, named
//! sub-trees (buckets) nesting recursively.
//!
//! Reads walk immutable pages straight out of the map. Writes materialize
//! the touched path into mutable [`node`] images owned by the transaction
//! and spill them into fresh pages at commit, which is what makes every
//! commit a copy-on-write snapshot.
//!
//! - `node`: mutable page images, rebalance, split, spill
//! - `bucket`: bucket headers, nesting, inline buckets, sequences
//! - `cursor`: ordered iteration and seeks over mixed page/node stacks

pub(crate) mod bucket;
pub(crate) mod cursor;
pub(crate) mod node;

pub use bucket::{Bucket, BucketMut, BucketStats};
pub use cursor::{Cursor, CursorMut, Entry};
