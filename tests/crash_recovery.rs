//! Torn-meta recovery: a commit is only real once its meta page survives
//! validation, and the previous snapshot stays reachable until then.

use std::path::Path;

use burrowdb::error::kind_of;
use burrowdb::{Database, Error};

const PAGE_SIZE: usize = 4096;
const META_OFFSET: usize = 16;

fn meta_offset(slot: usize) -> usize {
    slot * PAGE_SIZE + META_OFFSET
}

fn meta_txid(bytes: &[u8], slot: usize) -> u64 {
    let off = meta_offset(slot) + 48;
    u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap())
}

fn newer_meta_slot(bytes: &[u8]) -> usize {
    if meta_txid(bytes, 0) > meta_txid(bytes, 1) {
        0
    } else {
        1
    }
}

fn build_two_generations(path: &Path) {
    let db = Database::builder().path(path).page_size(PAGE_SIZE).open().unwrap();
    db.update(|tx| {
        tx.create_bucket(b"state")?.put(b"k", b"one")?;
        Ok(())
    })
    .unwrap();
    db.update(|tx| {
        tx.bucket_mut(b"state")?.put(b"k", b"two")?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn torn_newest_meta_falls_back_to_prior_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("torn.db");
    build_two_generations(&path);

    let mut bytes = std::fs::read(&path).unwrap();
    let newer = newer_meta_slot(&bytes);
    let older_txid = meta_txid(&bytes, 1 - newer);

    // Tear the newest meta: flip a byte inside its checksummed region, as
    // if the crash hit between the data fsync and the meta fsync.
    bytes[meta_offset(newer) + 32] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let db = Database::open(&path).unwrap();
    db.view(|tx| {
        assert_eq!(tx.bucket(b"state")?.get(b"k")?, Some(&b"one"[..]));
        Ok(())
    })
    .unwrap();

    // The next writer continues from the surviving snapshot.
    let tx = db.begin(true).unwrap();
    assert_eq!(tx.id(), older_txid + 1);
    tx.rollback().unwrap();
}

#[test]
fn committed_state_reopens_intact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("intact.db");
    build_two_generations(&path);

    let db = Database::open(&path).unwrap();
    db.view(|tx| {
        assert_eq!(tx.bucket(b"state")?.get(b"k")?, Some(&b"two"[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn recovered_database_accepts_new_commits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recommit.db");
    build_two_generations(&path);

    let mut bytes = std::fs::read(&path).unwrap();
    let newer = newer_meta_slot(&bytes);
    bytes[meta_offset(newer) + 56] ^= 0x01; // corrupt the stored checksum
    std::fs::write(&path, &bytes).unwrap();

    let db = Database::open(&path).unwrap();
    db.update(|tx| {
        tx.bucket_mut(b"state")?.put(b"k", b"three")?;
        Ok(())
    })
    .unwrap();

    drop(db);
    let db = Database::open(&path).unwrap();
    db.view(|tx| {
        assert_eq!(tx.bucket(b"state")?.get(b"k")?, Some(&b"three"[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn both_metas_with_bad_magic_report_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("magic.db");
    build_two_generations(&path);

    let mut bytes = std::fs::read(&path).unwrap();
    for slot in 0..2 {
        let off = meta_offset(slot);
        bytes[off..off + 4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    }
    std::fs::write(&path, &bytes).unwrap();

    let err = Database::open(&path).unwrap_err();
    assert_eq!(kind_of(&err), Some(&Error::Invalid));
}

#[test]
fn both_metas_with_bad_version_report_version_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("version.db");
    build_two_generations(&path);

    let mut bytes = std::fs::read(&path).unwrap();
    for slot in 0..2 {
        let off = meta_offset(slot) + 4;
        bytes[off..off + 4].copy_from_slice(&99u32.to_le_bytes());
    }
    std::fs::write(&path, &bytes).unwrap();

    // The checksum is stale too; version must be reported first.
    let err = Database::open(&path).unwrap_err();
    assert_eq!(kind_of(&err), Some(&Error::VersionMismatch));
}

#[test]
fn both_metas_with_bad_checksum_report_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checksum.db");
    build_two_generations(&path);

    let mut bytes = std::fs::read(&path).unwrap();
    for slot in 0..2 {
        bytes[meta_offset(slot) + 40] ^= 0xFF; // high-water mark field
    }
    std::fs::write(&path, &bytes).unwrap();

    let err = Database::open(&path).unwrap_err();
    assert_eq!(kind_of(&err), Some(&Error::Checksum));
}
