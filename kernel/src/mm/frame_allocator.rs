//! Physical frame manager.
//!
//! Tracks every 4 KiB physical frame with a bitmap as the single source of
//! truth, and layers a small LIFO cache of free single frames on top so the
//! overwhelmingly common single-frame allocation (page faults, page-table
//! frames) doesn't have to scan the bitmap. The cache is advisory: it is
//! only ever populated from frames the bitmap already marks free, and it is
//! drained under a low-memory watermark so it can never be the reason an
//! allocation under memory pressure fails.

extern crate alloc;

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

pub const FRAME_SIZE: usize = 4096;
const BITS_PER_WORD: usize = 64;

/// Frames cached above this watermark are returned to the bitmap instead of
/// the hot cache, and the cache is drained entirely once free frames drop
/// below it, so a best-fit multi-frame request always sees the true count.
const LOW_MEMORY_WATERMARK_FRAMES: usize = 256;

/// Hot cache never holds more than this many frames; extra single-frame
/// frees go straight back to the bitmap.
const HOT_CACHE_CAPACITY: usize = 64;

/// A physical address, frame-aligned or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn frame_number(&self) -> FrameNumber {
        FrameNumber((self.0 / FRAME_SIZE as u64) as usize)
    }
}

/// Index of a physical frame (physical address / `FRAME_SIZE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(pub usize);

impl FrameNumber {
    pub fn address(&self) -> PhysicalAddress {
        PhysicalAddress((self.0 * FRAME_SIZE) as u64)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

/// A contiguous, inclusive range of physical memory reserved at boot time
/// (kernel image, multiboot info structure, BIOS-reserved ranges) that must
/// never be handed out.
#[derive(Debug, Clone, Copy)]
pub struct ReservedRegion {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameAllocatorStats {
    pub total_frames: usize,
    pub free_frames: usize,
    pub hot_cache_len: usize,
    pub hot_cache_hits: u64,
    pub bitmap_scans: u64,
}

struct Bitmap {
    words: alloc::vec::Vec<u64>,
    total_frames: usize,
}

impl Bitmap {
    fn new(total_frames: usize) -> Self {
        let word_count = total_frames.div_ceil(BITS_PER_WORD);
        // Start fully reserved; `mark_free` opens up usable ranges.
        Self {
            words: alloc::vec![u64::MAX; word_count],
            total_frames,
        }
    }

    fn is_free(&self, frame: usize) -> bool {
        if frame >= self.total_frames {
            return false;
        }
        let word = self.words[frame / BITS_PER_WORD];
        word & (1 << (frame % BITS_PER_WORD)) != 0
    }

    fn set_free(&mut self, frame: usize, free: bool) {
        let idx = frame / BITS_PER_WORD;
        let bit = 1u64 << (frame % BITS_PER_WORD);
        if free {
            self.words[idx] |= bit;
        } else {
            self.words[idx] &= !bit;
        }
    }

    /// Finds the smallest free run of at least `count` frames whose length
    /// is closest to `count` (best-fit), scanning the whole bitmap once.
    /// Returns the starting frame number of the chosen run.
    fn best_fit(&self, count: usize) -> Option<usize> {
        let mut best_start: Option<usize> = None;
        let mut best_len = usize::MAX;

        let mut run_start: Option<usize> = None;
        let mut run_len = 0usize;

        for frame in 0..self.total_frames {
            if self.is_free(frame) {
                if run_start.is_none() {
                    run_start = Some(frame);
                    run_len = 0;
                }
                run_len += 1;
            } else if let Some(start) = run_start.take() {
                if run_len >= count && run_len < best_len {
                    best_start = Some(start);
                    best_len = run_len;
                }
            }
        }
        if let Some(start) = run_start {
            if run_len >= count && run_len < best_len {
                best_start = Some(start);
            }
        }
        best_start
    }
}

struct Inner {
    bitmap: Bitmap,
    hot_cache: alloc::vec::Vec<FrameNumber>,
    stats: FrameAllocatorStats,
}

impl Inner {
    fn allocate_one(&mut self) -> Option<FrameNumber> {
        if let Some(frame) = self.hot_cache.pop() {
            self.stats.hot_cache_hits += 1;
            self.stats.free_frames -= 1;
            return Some(frame);
        }
        self.stats.bitmap_scans += 1;
        let start = self.bitmap.best_fit(1)?;
        self.bitmap.set_free(start, false);
        self.stats.free_frames -= 1;
        Some(FrameNumber(start))
    }

    fn allocate_contiguous(&mut self, count: usize) -> Option<FrameNumber> {
        if count == 1 {
            return self.allocate_one();
        }
        self.stats.bitmap_scans += 1;
        let start = self.bitmap.best_fit(count)?;
        for frame in start..start + count {
            self.bitmap.set_free(frame, false);
        }
        self.stats.free_frames -= count;
        Some(FrameNumber(start))
    }

    fn free_one(&mut self, frame: FrameNumber) {
        debug_assert!(!self.bitmap.is_free(frame.0), "double free of {}", frame);
        self.stats.free_frames += 1;
        if self.stats.free_frames > LOW_MEMORY_WATERMARK_FRAMES
            && self.hot_cache.len() < HOT_CACHE_CAPACITY
        {
            self.hot_cache.push(frame);
        } else {
            self.bitmap.set_free(frame.0, true);
        }
    }

    fn free_contiguous(&mut self, start: FrameNumber, count: usize) {
        if count == 1 {
            self.free_one(start);
            return;
        }
        for frame in start.0..start.0 + count {
            self.bitmap.set_free(frame, true);
        }
        self.stats.free_frames += count;
    }

    /// Drops every cached frame back into the bitmap. Called once free
    /// memory falls to the watermark so a subsequent best-fit scan sees
    /// the true free set.
    fn drain_hot_cache(&mut self) {
        for frame in self.hot_cache.drain(..) {
            self.bitmap.set_free(frame.0, true);
        }
    }
}

static ALLOCATOR: Mutex<Option<Inner>> = Mutex::new(None);
static TOTAL_FRAMES: AtomicUsize = AtomicUsize::new(0);

/// Initializes the frame allocator over `total_frames` physical frames,
/// marking `reserved` ranges (kernel image, multiboot structures) as never
/// free. Must be called exactly once, before any other `mm` init.
pub fn init(total_frames: usize, reserved: &[ReservedRegion]) {
    let mut bitmap = Bitmap::new(total_frames);
    for frame in 0..total_frames {
        bitmap.set_free(frame, true);
    }
    let mut free_frames = total_frames;
    for region in reserved {
        let start = (region.start.as_u64() / FRAME_SIZE as u64) as usize;
        let end = region.end.as_u64().div_ceil(FRAME_SIZE as u64) as usize;
        for frame in start..end.min(total_frames) {
            if bitmap.is_free(frame) {
                bitmap.set_free(frame, false);
                free_frames -= 1;
            }
        }
    }
    TOTAL_FRAMES.store(total_frames, Ordering::SeqCst);
    *ALLOCATOR.lock() = Some(Inner {
        bitmap,
        hot_cache: alloc::vec::Vec::with_capacity(HOT_CACHE_CAPACITY),
        stats: FrameAllocatorStats {
            total_frames,
            free_frames,
            ..Default::default()
        },
    });
}

fn with_allocator<R>(f: impl FnOnce(&mut Inner) -> R) -> KernelResult<R> {
    let mut guard = ALLOCATOR.lock();
    let inner = guard.as_mut().ok_or(KernelError::NotInitialized {
        subsystem: "mm::frame_allocator",
    })?;
    Ok(f(inner))
}

/// Allocates a single physical frame. Served from the hot cache when
/// available, otherwise from a bitmap best-fit scan of length 1.
pub fn allocate_frame() -> KernelResult<FrameNumber> {
    with_allocator(|inner| inner.allocate_one())?.ok_or_else(|| KernelError::OutOfMemory {
        requested: FRAME_SIZE,
        available: free_frames() * FRAME_SIZE,
    })
}

/// Allocates `count` physically contiguous frames via best-fit. `count`
/// must be at least 1; for `count == 1` this is identical to
/// [`allocate_frame`].
pub fn allocate_contiguous(count: usize) -> KernelResult<FrameNumber> {
    if count == 0 {
        return Err(KernelError::InvalidArgument {
            name: "count",
            value: "zero",
        });
    }
    with_allocator(|inner| inner.allocate_contiguous(count))?.ok_or_else(|| {
        KernelError::OutOfMemory {
            requested: count * FRAME_SIZE,
            available: free_frames() * FRAME_SIZE,
        }
    })
}

/// Frees a single frame. Frees below the watermark go straight back to the
/// bitmap; frees above it populate the hot cache (LIFO) up to its capacity.
pub fn free_frame(frame: FrameNumber) {
    let _ = with_allocator(|inner| {
        inner.free_one(frame);
        if inner.stats.free_frames <= LOW_MEMORY_WATERMARK_FRAMES {
            inner.drain_hot_cache();
        }
    });
}

/// Frees `count` contiguous frames starting at `start`.
pub fn free_contiguous(start: FrameNumber, count: usize) {
    let _ = with_allocator(|inner| inner.free_contiguous(start, count));
}

pub fn free_frames() -> usize {
    with_allocator(|inner| inner.stats.free_frames).unwrap_or(0)
}

pub fn total_frames() -> usize {
    TOTAL_FRAMES.load(Ordering::SeqCst)
}

pub fn stats() -> FrameAllocatorStats {
    with_allocator(|inner| FrameAllocatorStats {
        hot_cache_len: inner.hot_cache.len(),
        ..inner.stats
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset(total: usize) {
        init(total, &[]);
    }

    #[test]
    fn single_frame_roundtrip_uses_hot_cache_when_above_watermark() {
        reset(LOW_MEMORY_WATERMARK_FRAMES + 16);
        let f = allocate_frame().unwrap();
        free_frame(f);
        let stats_before = stats();
        assert_eq!(stats_before.hot_cache_len, 1);
        let f2 = allocate_frame().unwrap();
        assert_eq!(f, f2);
        assert_eq!(stats().hot_cache_hits, 1);
    }

    #[test]
    fn best_fit_picks_smallest_sufficient_run() {
        reset(64);
        let mut held = alloc::vec::Vec::new();
        for _ in 0..64 {
            held.push(allocate_frame().unwrap());
        }
        // Free frames [10..20) (10 frames) and [30..34) (4 frames); a
        // 4-frame ask must land in the tighter [30..34) window.
        for f in &held[10..20] {
            free_frame(*f);
        }
        for f in &held[30..34] {
            free_frame(*f);
        }
        let got = allocate_contiguous(4).unwrap();
        assert_eq!(got.0, 30);
    }

    #[test]
    fn out_of_memory_when_no_run_fits() {
        reset(4);
        assert!(allocate_contiguous(5).is_err());
    }

    #[test]
    fn reserved_regions_are_never_allocated() {
        let reserved = [ReservedRegion {
            start: PhysicalAddress::new(0),
            end: PhysicalAddress::new(FRAME_SIZE as u64 * 4),
        }];
        init(16, &reserved);
        for _ in 0..12 {
            let f = allocate_frame().unwrap();
            assert!(f.0 >= 4);
        }
        assert!(allocate_frame().is_err());
    }

    #[test]
    fn low_memory_watermark_drains_hot_cache() {
        reset(LOW_MEMORY_WATERMARK_FRAMES + 4);
        let mut held = alloc::vec::Vec::new();
        for _ in 0..LOW_MEMORY_WATERMARK_FRAMES + 4 {
            held.push(allocate_frame().unwrap());
        }
        for f in held.drain(..4) {
            free_frame(f);
        }
        assert_eq!(stats().hot_cache_len, 0);
    }
}
