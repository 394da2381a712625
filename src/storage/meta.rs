//! # Meta Pages
//!
//! The first two pages of every database file hold alternating copies of the
//! meta record. A committing writer always overwrites the *inactive* copy
//! (the one with the lower txid), so a crash mid-commit can at worst tear a
//! meta that was already stale. On open, both copies are validated and the
//! valid one with the higher txid wins.
//!
//! ## Meta Body Layout (64 bytes at offset 16 of pages 0 and 1)
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  ------------------------------------------
//! 0       4     magic      0xED0CDAED
//! 4       4     version    2
//! 8       4     page_size  Fixed at create time
//! 12      4     flags      Reserved
//! 16      16    root       Root bucket header (pgid + sequence)
//! 32      8     freelist   Pgid of the serialized free list
//! 40      8     pgid       High-water mark (next never-allocated pgid)
//! 48      8     txid       Transaction id that wrote this meta
//! 56      8     checksum   FNV-1a-64 over bytes [0, 56)
//! ```
//!
//! ## Validation Order
//!
//! magic → version → checksum. A file that fails an earlier check reports
//! that kind even if later checks would also fail, so a foreign file is
//! `Invalid`, not `Checksum`.

use std::hash::Hasher;

use eyre::{ensure, Result};
use fnv::FnvHasher;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::Error;
use crate::storage::{BucketHeader, Pgid, Txid, PAGE_HEADER_SIZE};

/// `0xED0CDAED`, little-endian on disk.
pub const MAGIC: u32 = 0xED0C_DAED;

/// On-disk format version.
pub const VERSION: u32 = 2;

/// Size of the meta body, checksum included.
pub const META_BODY_SIZE: usize = 64;

const CHECKSUM_RANGE: usize = 56;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Meta {
    magic: U32,
    version: U32,
    page_size: U32,
    flags: U32,
    root: BucketHeader,
    freelist: U64,
    pgid: U64,
    txid: U64,
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<Meta>() == META_BODY_SIZE);

impl Meta {
    pub fn new(page_size: u32, root: Pgid, freelist: Pgid, pgid: Pgid, txid: Txid) -> Self {
        let mut meta = Self {
            magic: U32::new(MAGIC),
            version: U32::new(VERSION),
            page_size: U32::new(page_size),
            flags: U32::new(0),
            root: BucketHeader::new(root, 0),
            freelist: U64::new(freelist),
            pgid: U64::new(pgid),
            txid: U64::new(txid),
            checksum: U64::new(0),
        };
        meta.update_checksum();
        meta
    }

    /// Decodes the meta body from a full meta page (header + body).
    pub fn from_page(page: &[u8]) -> Result<Self> {
        ensure!(
            page.len() >= PAGE_HEADER_SIZE + META_BODY_SIZE,
            Error::Invalid
        );
        let body = &page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_BODY_SIZE];
        let meta = Self::read_from_bytes(body).expect("64-byte unaligned read cannot fail");
        meta.validate()?;
        Ok(meta)
    }

    /// magic → version → checksum, in that order.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.magic.get() == MAGIC, Error::Invalid);
        ensure!(self.version.get() == VERSION, Error::VersionMismatch);
        ensure!(self.checksum.get() == self.compute_checksum(), Error::Checksum);
        Ok(())
    }

    /// FNV-1a-64 over the 56 bytes preceding the checksum field.
    pub fn compute_checksum(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write(&self.as_bytes()[..CHECKSUM_RANGE]);
        hasher.finish()
    }

    pub fn update_checksum(&mut self) {
        self.checksum = U64::new(self.compute_checksum());
    }

    /// Serializes this meta into a full page buffer (header + body).
    pub fn write_to_page(&self, page: &mut [u8], id: Pgid) -> Result<()> {
        ensure!(
            page.len() >= PAGE_HEADER_SIZE + META_BODY_SIZE,
            "buffer too small for meta page: {} < {}",
            page.len(),
            PAGE_HEADER_SIZE + META_BODY_SIZE
        );
        let header = super::PageHeader::new(id, super::PageKind::Meta);
        header.write_to(page)?;
        page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_BODY_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn root(&self) -> BucketHeader {
        self.root
    }

    pub fn set_root(&mut self, root: BucketHeader) {
        self.root = root;
    }

    pub fn freelist(&self) -> Pgid {
        self.freelist.get()
    }

    pub fn set_freelist(&mut self, pgid: Pgid) {
        self.freelist = U64::new(pgid);
    }

    pub fn pgid(&self) -> Pgid {
        self.pgid.get()
    }

    pub fn set_pgid(&mut self, pgid: Pgid) {
        self.pgid = U64::new(pgid);
    }

    pub fn txid(&self) -> Txid {
        self.txid.get()
    }

    pub fn set_txid(&mut self, txid: Txid) {
        self.txid = U64::new(txid);
    }

    /// The meta slot (pgid 0 or 1) this meta belongs in: even txids live in
    /// page 0, odd txids in page 1.
    pub fn slot(&self) -> Pgid {
        self.txid.get() % 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PageKind;

    #[test]
    fn meta_body_is_64_bytes() {
        assert_eq!(std::mem::size_of::<Meta>(), META_BODY_SIZE);
    }

    #[test]
    fn magic_bytes_on_disk() {
        let meta = Meta::new(4096, 3, 2, 4, 0);
        let bytes = meta.as_bytes();

        assert_eq!(&bytes[0..4], &[0xED, 0xDA, 0x0C, 0xED]);
        assert_eq!(&bytes[4..8], &[0x02, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn checksum_roundtrip() {
        let meta = Meta::new(4096, 3, 2, 4, 9);

        assert!(meta.validate().is_ok());
        assert_eq!(meta.txid(), 9);
        assert_eq!(meta.slot(), 1);
    }

    #[test]
    fn corrupted_body_fails_checksum() {
        let mut meta = Meta::new(4096, 3, 2, 4, 9);
        meta.pgid = U64::new(1000); // stale checksum now

        let err = meta.validate().unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some(&Error::Checksum));
    }

    #[test]
    fn wrong_magic_reported_before_checksum() {
        let mut meta = Meta::new(4096, 3, 2, 4, 9);
        meta.magic = U32::new(0xDEADBEEF);
        // Checksum is also stale; magic must still win.

        let err = meta.validate().unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some(&Error::Invalid));
    }

    #[test]
    fn wrong_version_reported_before_checksum() {
        let mut meta = Meta::new(4096, 3, 2, 4, 9);
        meta.version = U32::new(99);

        let err = meta.validate().unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some(&Error::VersionMismatch));
    }

    #[test]
    fn page_roundtrip_preserves_fields() {
        let mut meta = Meta::new(4096, 3, 2, 4, 8);
        meta.set_root(BucketHeader::new(17, 5));
        meta.set_freelist(12);
        meta.set_pgid(42);
        meta.update_checksum();

        let mut page = vec![0u8; 4096];
        meta.write_to_page(&mut page, meta.slot()).unwrap();

        let header = crate::storage::PageHeader::from_bytes(&page).unwrap();
        assert_eq!(header.kind(), Some(PageKind::Meta));
        assert_eq!(header.id(), 0);

        let decoded = Meta::from_page(&page).unwrap();
        assert_eq!(decoded.root().root(), 17);
        assert_eq!(decoded.root().sequence(), 5);
        assert_eq!(decoded.freelist(), 12);
        assert_eq!(decoded.pgid(), 42);
        assert_eq!(decoded.txid(), 8);
    }
}
