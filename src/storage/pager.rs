//! # Pager
//!
//! The pager owns the database `File` and a read-only memory map over it.
//! It translates pgids into byte slices, grows the file when the high-water
//! mark moves past the end, remaps when the mark crosses the mapped region,
//! and issues positioned writes and fsync for commits.
//!
//! ## Map Discipline
//!
//! The map is read-only; every mutation goes through `write_at` on the file
//! descriptor. A shared file mapping observes those writes coherently, so
//! after a commit's pwrite+fsync the new pages are readable through the same
//! map without remapping.
//!
//! The mapped region may be *larger* than the file: growth rounds the map up
//! ahead of the file (doubling from 32 KiB to 1 GiB, then 1 GiB steps), and
//! callers never read a page that lies beyond the current file length. This
//! keeps remaps — the only operation that needs exclusive access — rare.
//!
//! ```text
//! page(&self)        shared   zero-copy slice, bounds-checked on file len
//! write_page(&self)  shared   pwrite; the single writer serializes callers
//! grow_file(&self)   shared   set_len + optional fsync; len is atomic
//! remap(&mut self)   exclusive  replaces the map; waits out all readers
//! ```
//!
//! The transaction layer enforces "exclusive" by holding the pager behind a
//! `parking_lot::RwLock`: readers keep read guards for their lifetime and
//! the writer upgrades its guard only around `remap`.
//!
//! ## File Locking
//!
//! The file carries an OS lock for the life of the pager: exclusive for
//! writable handles, shared for read-only ones. A second writable open on
//! the same file fails fast instead of corrupting it.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::{Mmap, MmapOptions};

use crate::error::Error;
use crate::storage::{
    Meta, Pgid, MAX_MMAP_STEP, MAX_PAGE_SIZE, MIN_MMAP_SIZE, MIN_PAGE_SIZE, PAGE_HEADER_SIZE,
};

#[cfg(unix)]
use std::os::unix::fs::FileExt as _;
#[cfg(windows)]
use std::os::windows::fs::FileExt as _;

#[derive(Debug, Clone)]
pub struct PagerOptions {
    pub read_only: bool,
    pub initial_mmap_size: u64,
    pub no_grow_sync: bool,
    /// Ask the kernel to pre-fault the mapping (`MAP_POPULATE` where
    /// supported). A platform hint only; harmless elsewhere.
    pub populate: bool,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            initial_mmap_size: 0,
            no_grow_sync: false,
            populate: false,
        }
    }
}

#[derive(Debug)]
pub struct Pager {
    file: File,
    mmap: Mmap,
    page_size: usize,
    file_len: AtomicU64,
    mapped_len: u64,
    read_only: bool,
    no_grow_sync: bool,
    populate: bool,
    path: PathBuf,
}

impl Pager {
    /// Opens an existing database file. The file must already contain the
    /// bootstrap pages (see `Database::open`, which initializes fresh
    /// files before handing them here).
    pub fn open<P: AsRef<Path>>(path: P, opts: &PagerOptions) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(!opts.read_only)
            .open(path)
            .map_err(Error::Io)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        if opts.read_only {
            fs2::FileExt::try_lock_shared(&file)
        } else {
            fs2::FileExt::try_lock_exclusive(&file)
        }
        .map_err(Error::Io)
        .wrap_err_with(|| {
            format!("database file '{}' is locked by another process", path.display())
        })?;

        let file_len = file
            .metadata()
            .map_err(Error::Io)
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(file_len > 0, Error::Invalid);

        let page_size = read_page_size(&file)?;

        ensure!(
            file_len % page_size as u64 == 0,
            "database file '{}' length {} is not a multiple of page size {}",
            path.display(),
            file_len,
            page_size
        );
        ensure!(file_len >= 4 * page_size as u64, Error::Invalid);

        let mapped_len = mmap_size_for(
            file_len.max(opts.initial_mmap_size),
            page_size,
        );

        let mmap = map(&file, mapped_len, opts.populate, path)?;

        tracing::debug!(
            path = %path.display(),
            page_size,
            file_len,
            mapped_len,
            read_only = opts.read_only,
            "opened database file"
        );

        Ok(Self {
            file,
            mmap,
            page_size,
            file_len: AtomicU64::new(file_len),
            mapped_len,
            read_only: opts.read_only,
            no_grow_sync: opts.no_grow_sync,
            populate: opts.populate,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn file_len(&self) -> u64 {
        self.file_len.load(Ordering::Acquire)
    }

    pub fn mapped_len(&self) -> u64 {
        self.mapped_len
    }

    /// Base slice of a single page, without overflow.
    pub fn page(&self, id: Pgid) -> Result<&[u8]> {
        self.span(id, 1)
    }

    /// Slice of a logical page including its overflow pages, as declared by
    /// the page's own header.
    pub fn page_span(&self, id: Pgid) -> Result<&[u8]> {
        let base = self.page(id)?;
        let header = super::PageHeader::from_bytes(base)?;
        self.span(id, 1 + header.overflow() as u64)
    }

    fn span(&self, id: Pgid, pages: u64) -> Result<&[u8]> {
        let start = id
            .checked_mul(self.page_size as u64)
            .ok_or_else(|| eyre::Report::new(Error::Corruption))?;
        let len = pages * self.page_size as u64;
        let end = start
            .checked_add(len)
            .ok_or_else(|| eyre::Report::new(Error::Corruption))?;
        let file_len = self.file_len();
        ensure!(
            end <= file_len && end <= self.mapped_len,
            "page {} (+{} pages) escapes the file ({} > {})",
            id,
            pages - 1,
            end,
            file_len.min(self.mapped_len)
        );
        Ok(&self.mmap[start as usize..end as usize])
    }

    /// Positioned write of one logical page (header + overflow) at
    /// `id * page_size`. The caller must have grown the file first.
    pub fn write_page(&self, id: Pgid, data: &[u8]) -> Result<()> {
        ensure!(!self.read_only, Error::ReadOnly);
        let offset = id * self.page_size as u64;
        ensure!(
            offset + data.len() as u64 <= self.file_len(),
            "write of page {} escapes the file",
            id
        );
        write_all_at(&self.file, data, offset)
            .map_err(Error::Io)
            .wrap_err_with(|| format!("failed to write page {} to '{}'", id, self.path.display()))
    }

    /// fsync the data file.
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(Error::Io)
            .wrap_err_with(|| format!("failed to fsync '{}'", self.path.display()))
    }

    /// Extends the file to hold at least `min_pages` pages, with the same
    /// doubling-then-1-GiB-steps policy as the map so growth stays rare.
    /// No-op when the file is already long enough; never shrinks.
    pub fn grow_file(&self, min_pages: u64) -> Result<()> {
        ensure!(!self.read_only, Error::ReadOnly);
        let needed = min_pages * self.page_size as u64;
        if needed <= self.file_len() {
            return Ok(());
        }
        let target = mmap_size_for(needed, self.page_size);

        self.file
            .set_len(target)
            .map_err(Error::Io)
            .wrap_err_with(|| format!("failed to grow '{}' to {} bytes", self.path.display(), target))?;
        if !self.no_grow_sync {
            self.sync()?;
        }
        self.file_len.store(target, Ordering::Release);
        tracing::debug!(bytes = target, "grew database file");
        Ok(())
    }

    /// True when `min_pages` pages fit inside the current map; when false
    /// the caller must acquire exclusive access and [`Pager::remap`].
    pub fn is_mapped(&self, min_pages: u64) -> bool {
        min_pages * self.page_size as u64 <= self.mapped_len
    }

    /// Replaces the map with one covering at least `min_pages` pages.
    /// Requires exclusive access: the borrow rules guarantee no slice
    /// handed out by [`Pager::page`] survives this call.
    pub fn remap(&mut self, min_pages: u64) -> Result<()> {
        let required = min_pages * self.page_size as u64;
        if required <= self.mapped_len {
            return Ok(());
        }
        let mapped_len = mmap_size_for(required, self.page_size);
        self.mmap = map(&self.file, mapped_len, self.populate, &self.path)?;
        self.mapped_len = mapped_len;
        tracing::debug!(bytes = mapped_len, "remapped database file");
        Ok(())
    }
}

fn map(file: &File, len: u64, populate: bool, path: &Path) -> Result<Mmap> {
    let mut options = MmapOptions::new();
    options.len(len as usize);
    #[cfg(unix)]
    if populate {
        options.populate();
    }
    #[cfg(not(unix))]
    let _ = populate;

    // SAFETY: Mmap::map is unsafe because the underlying file could be
    // truncated or modified externally, invalidating the mapping. This is
    // safe because:
    // 1. The file carries an OS lock (exclusive for writers, shared for
    //    readers), so no other process mutates it.
    // 2. This process only ever extends the file, never truncates it.
    // 3. All slice access is bounds-checked against the live file length.
    let mmap = unsafe {
        options
            .map(file)
            .map_err(Error::Io)
            .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
    };

    #[cfg(unix)]
    mmap.advise(memmap2::Advice::Random)
        .map_err(Error::Io)
        .wrap_err("failed to advise random access on map")?;

    Ok(mmap)
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> std::io::Result<()> {
    while !data.is_empty() {
        let n = file.seek_write(data, offset)?;
        data = &data[n..];
        offset += n as u64;
    }
    Ok(())
}

/// Growth policy for the mapped region: double from 32 KiB up to 1 GiB,
/// then step in whole GiB; always at least two pages and page-aligned.
fn mmap_size_for(required: u64, page_size: usize) -> u64 {
    let floor = (2 * page_size as u64).max(MIN_MMAP_SIZE);
    let required = required.max(floor);
    if required <= MAX_MMAP_STEP {
        let mut size = MIN_MMAP_SIZE;
        while size < required {
            size *= 2;
        }
        return size.max(floor);
    }
    required.div_ceil(MAX_MMAP_STEP) * MAX_MMAP_STEP
}

/// Recovers the page size from an existing file: meta page 0 when intact,
/// otherwise a scan of candidate page sizes against meta page 1.
fn read_page_size(file: &File) -> Result<usize> {
    let file_len = file.metadata().map_err(Error::Io)?.len() as usize;
    let mut probe = vec![0u8; (2 * MAX_PAGE_SIZE).min(file_len)];
    read_exact_at(file, &mut probe, 0)
        .map_err(Error::Io)
        .wrap_err("failed to read database header")?;

    if let Ok(meta) = Meta::from_page(&probe) {
        let ps = meta.page_size() as usize;
        ensure!(
            (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&ps) && ps.is_power_of_two(),
            Error::Invalid
        );
        return Ok(ps);
    }

    // Meta 0 is torn; meta 1 lives one page in, wherever that is.
    let mut candidate = MIN_PAGE_SIZE;
    while candidate <= MAX_PAGE_SIZE {
        if probe.len() >= candidate + PAGE_HEADER_SIZE + super::META_BODY_SIZE {
            if let Ok(meta) = Meta::from_page(&probe[candidate..]) {
                if meta.page_size() as usize == candidate {
                    return Ok(candidate);
                }
            }
        }
        candidate *= 2;
    }

    // Neither meta validated; surface meta 0's verdict.
    match Meta::from_page(&probe) {
        Err(e) => Err(e),
        Ok(_) => bail!(Error::Invalid),
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{PageHeader, PageKind, DEFAULT_PAGE_SIZE};

    fn bootstrap_file(path: &Path, page_size: usize) {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .unwrap();
        let mut buf = vec![0u8; 4 * page_size];
        for slot in 0..2u64 {
            let meta = Meta::new(page_size as u32, 3, 2, 4, slot);
            let off = slot as usize * page_size;
            meta.write_to_page(&mut buf[off..off + page_size], slot).unwrap();
        }
        PageHeader::new(2, PageKind::Freelist)
            .write_to(&mut buf[2 * page_size..])
            .unwrap();
        PageHeader::new(3, PageKind::Leaf)
            .write_to(&mut buf[3 * page_size..])
            .unwrap();
        write_all_at(&file, &buf, 0).unwrap();
        file.sync_all().unwrap();
    }

    #[test]
    fn mmap_size_doubles_then_steps() {
        assert_eq!(mmap_size_for(1, 4096), MIN_MMAP_SIZE);
        assert_eq!(mmap_size_for(MIN_MMAP_SIZE, 4096), MIN_MMAP_SIZE);
        assert_eq!(mmap_size_for(MIN_MMAP_SIZE + 1, 4096), MIN_MMAP_SIZE * 2);
        assert_eq!(mmap_size_for(1 << 20, 4096), 1 << 20);
        assert_eq!(mmap_size_for((1 << 20) + 1, 4096), 1 << 21);
        assert_eq!(mmap_size_for(MAX_MMAP_STEP, 4096), MAX_MMAP_STEP);
        assert_eq!(mmap_size_for(MAX_MMAP_STEP + 1, 4096), 2 * MAX_MMAP_STEP);
    }

    #[test]
    fn open_reads_page_size_and_bounds_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.db");
        bootstrap_file(&path, DEFAULT_PAGE_SIZE);

        let pager = Pager::open(&path, &PagerOptions::default()).unwrap();

        assert_eq!(pager.page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(pager.file_len(), 4 * DEFAULT_PAGE_SIZE as u64);
        assert_eq!(pager.page(3).unwrap().len(), DEFAULT_PAGE_SIZE);
        assert!(pager.page(4).is_err());
    }

    #[test]
    fn open_empty_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.db");
        std::fs::File::create(&path).unwrap();

        let err = Pager::open(&path, &PagerOptions::default()).unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some(&Error::Invalid));
    }

    #[test]
    fn open_garbage_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.db");
        std::fs::write(&path, vec![0xABu8; 4 * DEFAULT_PAGE_SIZE]).unwrap();

        let err = Pager::open(&path, &PagerOptions::default()).unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some(&Error::Invalid));
    }

    #[test]
    fn second_writable_open_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.db");
        bootstrap_file(&path, DEFAULT_PAGE_SIZE);

        let _first = Pager::open(&path, &PagerOptions::default()).unwrap();
        let second = Pager::open(&path, &PagerOptions::default());

        assert!(second.is_err());
        assert!(second.unwrap_err().to_string().contains("locked"));
    }

    #[test]
    fn read_only_openers_share_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        bootstrap_file(&path, DEFAULT_PAGE_SIZE);

        let ro = PagerOptions {
            read_only: true,
            ..Default::default()
        };
        let _a = Pager::open(&path, &ro).unwrap();
        let _b = Pager::open(&path, &ro).unwrap();

        let writable = Pager::open(&path, &PagerOptions::default());
        assert!(writable.is_err());
    }

    #[test]
    fn grow_then_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.db");
        bootstrap_file(&path, DEFAULT_PAGE_SIZE);
        let pager = Pager::open(&path, &PagerOptions::default()).unwrap();

        pager.grow_file(6).unwrap();
        // Growth rounds up by policy; at least the requested pages exist.
        assert!(pager.file_len() >= 6 * DEFAULT_PAGE_SIZE as u64);
        assert_eq!(pager.file_len() % DEFAULT_PAGE_SIZE as u64, 0);

        let mut page = vec![0u8; DEFAULT_PAGE_SIZE];
        PageHeader::new(5, PageKind::Leaf).write_to(&mut page).unwrap();
        pager.write_page(5, &page).unwrap();

        let read = pager.page(5).unwrap();
        let header = PageHeader::from_bytes(read).unwrap();
        assert_eq!(header.id(), 5);
        assert_eq!(header.kind(), Some(PageKind::Leaf));
    }

    #[test]
    fn write_refused_on_read_only_pager() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.db");
        bootstrap_file(&path, DEFAULT_PAGE_SIZE);
        let ro = PagerOptions {
            read_only: true,
            ..Default::default()
        };
        let pager = Pager::open(&path, &ro).unwrap();

        let err = pager.write_page(3, &[0u8; DEFAULT_PAGE_SIZE]).unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some(&Error::ReadOnly));
    }
}
