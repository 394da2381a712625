//! # Error Kinds
//!
//! Fallible operations across the crate return `eyre::Result`, which carries
//! rich context for diagnostics (file paths, page numbers, byte offsets).
//! Conditions a caller is expected to branch on are raised as the [`Error`]
//! enum below and travel inside the `eyre::Report`, so they can be recovered
//! with `report.downcast_ref::<Error>()`:
//!
//! ```ignore
//! match db.update(|tx| tx.create_bucket(b"jobs").map(|_| ())) {
//!     Err(e) if e.downcast_ref::<Error>() == Some(&Error::BucketExists) => {}
//!     other => other?,
//! }
//! ```
//!
//! Failures of the underlying file (open, pwrite, fsync, mmap) surface as
//! the `Io` kind wrapping the `std::io::Error`, with path/operation context
//! layered on top by the storage code.
//!
//! ## Open-time validation order
//!
//! A malformed file reports the *first* inapplicable check, in the order
//! magic → version → checksum. A file with a wrong magic is `Invalid` even
//! if its checksum would also fail.
//!
//! ## Poisoning
//!
//! An I/O failure during commit leaves the on-disk state at the previous
//! snapshot but poisons the in-process handle: subsequent write attempts
//! fail with `Closed` until the database is reopened. Readers that were
//! already attached keep their snapshot.

use std::io;

use thiserror::Error;

/// Conditions callers branch on, carried inside `eyre::Report`.
#[derive(Debug, Error)]
pub enum Error {
    /// The file is not a burrowdb database (magic mismatch).
    #[error("invalid database file: magic mismatch")]
    Invalid,
    /// The file was written by an incompatible format version.
    #[error("version mismatch: file is not a supported format version")]
    VersionMismatch,
    /// A meta page failed checksum verification.
    #[error("meta checksum mismatch")]
    Checksum,
    /// A page failed structural decoding (wrong flags for its context,
    /// out-of-bounds elements, broken ordering).
    #[error("database corruption detected")]
    Corruption,
    /// The underlying file failed (open, read, pwrite, fsync, mmap).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The database file is not open.
    #[error("database file is not open")]
    FileNotOpen,
    /// The database handle has been closed or poisoned by a commit failure.
    #[error("database is closed")]
    Closed,
    /// The database was opened read-only.
    #[error("database is in read-only mode")]
    ReadOnly,
    /// The transaction has already been committed or rolled back.
    #[error("transaction is closed")]
    TxClosed,
    /// A mutation was attempted through a read-only transaction.
    #[error("transaction is not writable")]
    TxNotWritable,
    /// `create_bucket` on a name that already names a bucket.
    #[error("bucket already exists")]
    BucketExists,
    /// The named bucket does not exist.
    #[error("bucket not found")]
    BucketNotFound,
    /// The key names an entry of the other kind (bucket vs plain value).
    #[error("incompatible value: key is used by the other entry kind")]
    BucketNameConflict,
    /// Keys must be non-empty.
    #[error("key required")]
    KeyRequired,
    /// Key exceeds the 32 KiB limit.
    #[error("key too large")]
    KeyTooLarge,
    /// Value exceeds the 2^31 - 2 byte limit.
    #[error("value too large")]
    ValueTooLarge,
    /// The key does not exist.
    #[error("key not found")]
    NotFound,
    /// The managed transaction's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,
    /// The managed transaction's context deadline passed.
    #[error("operation timed out")]
    Timeout,
}

/// Kinds compare as kinds: two `Io` errors are equal when their
/// `io::ErrorKind`s match, every other variant by variant alone.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::Io(a), Error::Io(b)) => a.kind() == b.kind(),
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl Eq for Error {}

/// Returns the typed [`Error`] kind inside a report, if any.
pub fn kind_of(report: &eyre::Report) -> Option<&Error> {
    report.downcast_ref::<Error>()
}

/// True when the report carries exactly the given kind.
pub fn is_kind(report: &eyre::Report, kind: Error) -> bool {
    kind_of(report) == Some(&kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_report_roundtrip() {
        let report = eyre::Report::new(Error::KeyTooLarge);

        assert_eq!(kind_of(&report), Some(&Error::KeyTooLarge));
        assert!(is_kind(&report, Error::KeyTooLarge));
        assert!(!is_kind(&report, Error::KeyRequired));
    }

    #[test]
    fn kind_absent_for_adhoc_report() {
        let report = eyre::eyre!("some io-level failure");

        assert_eq!(kind_of(&report), None);
    }

    #[test]
    fn io_failures_carry_the_io_kind() {
        let io = io::Error::new(io::ErrorKind::WriteZero, "disk full");
        let report = eyre::Report::new(Error::from(io));

        assert!(matches!(kind_of(&report), Some(Error::Io(_))));
        assert!(is_kind(
            &report,
            Error::Io(io::ErrorKind::WriteZero.into())
        ));
        assert!(!is_kind(
            &report,
            Error::Io(io::ErrorKind::NotFound.into())
        ));
    }

    #[test]
    fn io_kind_survives_context_wrapping() {
        let io = io::Error::new(io::ErrorKind::Other, "pwrite failed");
        let report = eyre::Report::new(Error::from(io)).wrap_err("failed to write page 7");

        assert!(matches!(kind_of(&report), Some(Error::Io(_))));
        assert!(report.to_string().contains("failed to write page 7"));
    }

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(Error::Invalid.to_string(), "invalid database file: magic mismatch");
        assert_eq!(Error::TxNotWritable.to_string(), "transaction is not writable");
        assert_eq!(Error::KeyRequired.to_string(), "key required");
    }
}
