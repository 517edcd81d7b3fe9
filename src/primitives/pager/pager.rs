use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock,
};
use tracing::{debug, warn};

use super::frame::Frame;
use crate::primitives::bytes::put_u32;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{
    page::{self, PageHeader, DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE, PAGE_HDR_LEN},
    page_crc32, PageId, Result, TreeError,
};

const MAX_PAGE_SIZE: u32 = 1 << 16;

/// Configuration for a [`Pager`].
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Page size used when creating a new file. Existing files keep their own size.
    pub page_size: u32,
    /// Soft limit on cached pages; pinned pages may push the cache past it.
    pub cache_pages: usize,
    /// Verify page checksums when loading from disk.
    pub verify_checksums: bool,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: 1024,
            verify_checksums: true,
        }
    }
}

/// Access mode requested for a page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageIntent {
    /// Shared access; many readers may hold the same page.
    Read,
    /// Exclusive access; marks the page dirty.
    Write,
}

/// Fixed-size page access through scoped cursors.
pub trait PageStore: Send + Sync + 'static {
    /// Returns the page size in bytes.
    fn page_size(&self) -> u32;
    /// Returns the per-file salt stamped into page headers.
    fn salt(&self) -> u64;
    /// Latches `id` for the requested access. The latch is released when the cursor drops.
    fn acquire_cursor(&self, id: PageId, intent: PageIntent) -> Result<PageCursor>;
    /// Number of pages that exist on disk or have been written in memory.
    fn page_count(&self) -> u64;
    /// Writes every dirty page back and syncs the file.
    fn flush(&self) -> Result<()>;
}

enum Access {
    Read(ArcRwLockReadGuard<RawRwLock, Box<[u8]>>),
    Write(ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>),
}

/// A latched page.
///
/// Field order matters: the latch is released before the frame pin.
pub struct PageCursor {
    id: PageId,
    access: Access,
    _frame: Arc<Frame>,
}

impl PageCursor {
    /// Page this cursor is positioned on.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Access mode the cursor was acquired with.
    pub fn intent(&self) -> PageIntent {
        match self.access {
            Access::Read(_) => PageIntent::Read,
            Access::Write(_) => PageIntent::Write,
        }
    }

    /// Full page image.
    pub fn data(&self) -> &[u8] {
        match &self.access {
            Access::Read(guard) => &guard[..],
            Access::Write(guard) => &guard[..],
        }
    }

    /// Mutable page image; fails for read cursors.
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.access {
            Access::Read(_) => Err(TreeError::Invalid("page cursor opened for read")),
            Access::Write(guard) => Ok(&mut guard[..]),
        }
    }

    /// Copies `dst.len()` bytes starting at `off` out of the page.
    pub fn get_bytes(&self, off: usize, dst: &mut [u8]) -> Result<()> {
        let src = off
            .checked_add(dst.len())
            .and_then(|end| self.data().get(off..end))
            .ok_or(TreeError::Invalid("page read out of bounds"))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Copies `src` into the page starting at `off`.
    pub fn put_bytes(&mut self, off: usize, src: &[u8]) -> Result<()> {
        let page = self.data_mut()?;
        let dst = off
            .checked_add(src.len())
            .and_then(|end| page.get_mut(off..end))
            .ok_or(TreeError::Invalid("page write out of bounds"))?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

impl fmt::Debug for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCursor")
            .field("id", &self.id)
            .field("intent", &self.intent())
            .finish()
    }
}

/// Point-in-time pager counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PagerStats {
    /// Cursor acquisitions served from cache.
    pub hits: u64,
    /// Cursor acquisitions that loaded from disk.
    pub misses: u64,
    /// Frames dropped from the cache.
    pub evictions: u64,
    /// Dirty pages written to the file.
    pub write_backs: u64,
}

#[derive(Default)]
struct PagerCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    write_backs: AtomicU64,
}

struct PageCache {
    frames: LruCache<PageId, Arc<Frame>>,
    capacity: usize,
}

/// File-backed [`PageStore`] with an LRU write-back cache.
pub struct Pager {
    io: Arc<dyn FileIo>,
    page_size: u32,
    salt: u64,
    verify_checksums: bool,
    cache: Mutex<PageCache>,
    high_water: AtomicU64,
    counters: PagerCounters,
}

impl Pager {
    /// Opens `path`, creating an empty store file when it does not exist.
    pub fn open(path: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        let io = StdFileIo::open(path)?;
        Self::with_io(Arc::new(io), options)
    }

    /// Builds a pager over an arbitrary [`FileIo`].
    ///
    /// A file whose first page was never formatted is treated as empty and truncated.
    pub fn with_io(io: Arc<dyn FileIo>, options: PagerOptions) -> Result<Self> {
        let len = io.len()?;
        let mut head = [0u8; PAGE_HDR_LEN];
        let existing = if len >= PAGE_HDR_LEN as u64 {
            io.read_at(0, &mut head)?;
            !page::is_unformatted(&head)
        } else {
            false
        };
        let (page_size, salt, pages) = if existing {
            let header = PageHeader::decode(&head)?;
            if !valid_page_size(header.page_size) {
                return Err(TreeError::Corruption("store page size out of range"));
            }
            let pages = len.div_ceil(header.page_size as u64);
            (header.page_size, header.salt, pages)
        } else {
            if !valid_page_size(options.page_size) {
                return Err(TreeError::Invalid(
                    "page size must be a multiple of 512 between 512 and 65536",
                ));
            }
            if len > 0 {
                io.truncate(0)?;
            }
            (options.page_size, rand::random::<u64>(), 0)
        };
        debug!(page_size, pages, existing, "pager.open");
        Ok(Self {
            io,
            page_size,
            salt,
            verify_checksums: options.verify_checksums,
            cache: Mutex::new(PageCache {
                frames: LruCache::unbounded(),
                capacity: options.cache_pages.max(8),
            }),
            high_water: AtomicU64::new(pages),
            counters: PagerCounters::default(),
        })
    }

    /// Returns a snapshot of cache counters.
    pub fn stats(&self) -> PagerStats {
        PagerStats {
            hits: self.counters.hits.load(AtomicOrdering::Relaxed),
            misses: self.counters.misses.load(AtomicOrdering::Relaxed),
            evictions: self.counters.evictions.load(AtomicOrdering::Relaxed),
            write_backs: self.counters.write_backs.load(AtomicOrdering::Relaxed),
        }
    }

    /// Number of frames currently cached.
    pub fn cached_pages(&self) -> usize {
        self.cache.lock().frames.len()
    }

    fn frame(&self, id: PageId) -> Result<Arc<Frame>> {
        let mut cache = self.cache.lock();
        if let Some(frame) = cache.frames.get(&id) {
            self.counters.hits.fetch_add(1, AtomicOrdering::Relaxed);
            return Ok(Arc::clone(frame));
        }
        self.counters.misses.fetch_add(1, AtomicOrdering::Relaxed);
        let frame = Arc::new(Frame::new(self.load_image(id)?));
        cache.frames.put(id, Arc::clone(&frame));
        self.evict_over_capacity(&mut cache)?;
        Ok(frame)
    }

    fn evict_over_capacity(&self, cache: &mut PageCache) -> Result<()> {
        while cache.frames.len() > cache.capacity {
            let victim = cache
                .frames
                .iter()
                .rev()
                .find(|(_, frame)| Arc::strong_count(frame) == 1)
                .map(|(id, _)| *id);
            let Some(victim) = victim else {
                break;
            };
            let Some(frame) = cache.frames.pop(&victim) else {
                break;
            };
            if frame.take_dirty() {
                if let Err(err) = self.write_back(victim, &frame) {
                    warn!(page = victim.0, error = %err, "pager.evict.write_back_failed");
                    frame.mark_dirty();
                    cache.frames.put(victim, frame);
                    return Err(err);
                }
            }
            self.counters.evictions.fetch_add(1, AtomicOrdering::Relaxed);
        }
        Ok(())
    }

    fn load_image(&self, id: PageId) -> Result<Box<[u8]>> {
        let size = self.page_size as u64;
        let mut image = vec![0u8; size as usize].into_boxed_slice();
        let off = id
            .0
            .checked_mul(size)
            .ok_or(TreeError::Invalid("page id overflows file offset"))?;
        if off + size <= self.io.len()? {
            self.io.read_at(off, &mut image)?;
            self.verify(id, &image)?;
        }
        Ok(image)
    }

    fn verify(&self, id: PageId, image: &[u8]) -> Result<()> {
        if page::is_unformatted(image) {
            return Ok(());
        }
        let header = PageHeader::decode(image)?;
        if header.page_no != id {
            return Err(TreeError::Corruption("page number mismatch"));
        }
        if header.salt != self.salt {
            return Err(TreeError::Corruption("page salt mismatch"));
        }
        if self.verify_checksums {
            let mut scratch = image.to_vec();
            page::clear_crc32(&mut scratch)?;
            if page_crc32(id.0, self.salt, &scratch) != header.crc32 {
                return Err(TreeError::Corruption("page checksum mismatch"));
            }
        }
        Ok(())
    }

    fn write_back(&self, id: PageId, frame: &Frame) -> Result<()> {
        let mut image = frame.buf.read().to_vec();
        if !page::is_unformatted(&image) {
            page::clear_crc32(&mut image)?;
            let crc = page_crc32(id.0, self.salt, &image);
            put_u32(&mut image, page::header::CRC32, crc);
        }
        self.io.write_at(id.0 * self.page_size as u64, &image)?;
        self.counters.write_backs.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }
}

impl PageStore for Pager {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn salt(&self) -> u64 {
        self.salt
    }

    fn acquire_cursor(&self, id: PageId, intent: PageIntent) -> Result<PageCursor> {
        let frame = self.frame(id)?;
        let access = match intent {
            PageIntent::Read => Access::Read(frame.buf.read_arc()),
            PageIntent::Write => {
                let guard = frame.buf.write_arc();
                frame.mark_dirty();
                self.high_water.fetch_max(id.0 + 1, AtomicOrdering::AcqRel);
                Access::Write(guard)
            }
        };
        Ok(PageCursor {
            id,
            access,
            _frame: frame,
        })
    }

    fn page_count(&self) -> u64 {
        self.high_water.load(AtomicOrdering::Acquire)
    }

    fn flush(&self) -> Result<()> {
        let mut dirty: Vec<(PageId, Arc<Frame>)> = {
            let cache = self.cache.lock();
            cache
                .frames
                .iter()
                .filter(|(_, frame)| frame.is_dirty())
                .map(|(id, frame)| (*id, Arc::clone(frame)))
                .collect()
        };
        dirty.sort_unstable_by_key(|(id, _)| *id);
        let mut written = 0usize;
        for (id, frame) in &dirty {
            if !frame.take_dirty() {
                continue;
            }
            if let Err(err) = self.write_back(*id, frame) {
                frame.mark_dirty();
                return Err(err);
            }
            written += 1;
        }
        self.io.sync_all()?;
        debug!(pages = written, "pager.flush");
        Ok(())
    }
}

fn valid_page_size(size: u32) -> bool {
    (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) && size % MIN_PAGE_SIZE == 0
}
