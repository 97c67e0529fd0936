//! Kernel heap: a SLUB-style size-class slab allocator.
//!
//! Each size class owns a list of slabs backed by physically contiguous
//! frames from the frame manager. Free objects are threaded into a
//! singly-linked free list stored in the object's own first words — no
//! separate free-list storage is needed. A slab starts with just enough
//! objects to fill one frame and doubles its frame count each time a new
//! slab is added for that class, so classes under light use stay small.
//!
//! `free()` takes only a pointer, not a size, matching `GlobalAlloc`'s
//! `dealloc` contract even though `Layout` is also passed: the class is
//! recovered independently of `Layout` via a frame-to-class index, so a
//! caller that (incorrectly) passes a stale layout still frees correctly.

extern crate alloc;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use alloc::collections::BTreeMap;
use spin::Mutex;

use super::frame_allocator::{self, FrameNumber, FRAME_SIZE};
use crate::error::{KernelError, KernelResult};

/// Size classes, smallest to largest. Below 16 bytes there's nowhere to
/// store both the free-list pointer and keep a class usable for its
/// nominal size on a 64-bit target, so 16 is the floor.
const SIZE_CLASSES: [usize; 9] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

fn class_for_size(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&c| size <= c)
}

struct FreeNode {
    next: Option<NonNull<FreeNode>>,
}

struct Slab {
    base: FrameNumber,
    frame_count: usize,
    object_size: usize,
    free_list: Option<NonNull<FreeNode>>,
    free_count: usize,
    total_objects: usize,
}

// SAFETY: Slab is only ever touched through the SlabHeap's Mutex.
unsafe impl Send for Slab {}

impl Slab {
    fn new(object_size: usize, frame_count: usize) -> KernelResult<Self> {
        let base = frame_allocator::allocate_contiguous(frame_count)?;
        let region_len = frame_count * FRAME_SIZE;
        let total_objects = region_len / object_size;
        let base_addr = super::phys_to_virt_addr(base.address().as_u64()) as usize;

        let mut free_list: Option<NonNull<FreeNode>> = None;
        for i in (0..total_objects).rev() {
            let obj_addr = base_addr + i * object_size;
            let node_ptr = obj_addr as *mut FreeNode;
            // SAFETY: obj_addr lies within the freshly allocated, unmapped
            // (to any other owner) region, is aligned (object_size is a
            // multiple of 16), and large enough for a FreeNode.
            unsafe {
                (*node_ptr).next = free_list;
                free_list = Some(NonNull::new_unchecked(node_ptr));
            }
        }

        Ok(Self {
            base,
            frame_count,
            object_size,
            free_list,
            free_count: total_objects,
            total_objects,
        })
    }

    fn alloc_one(&mut self) -> Option<NonNull<u8>> {
        let node = self.free_list.take()?;
        // SAFETY: node came from this slab's free list, which only ever
        // holds live, exclusively-owned object addresses.
        unsafe {
            self.free_list = (*node.as_ptr()).next;
        }
        self.free_count -= 1;
        Some(node.cast())
    }

    fn free_one(&mut self, ptr: NonNull<u8>) {
        let node_ptr = ptr.cast::<FreeNode>();
        // SAFETY: ptr was handed out by this slab's alloc_one and the
        // caller guarantees it is not freed twice concurrently.
        unsafe {
            (*node_ptr.as_ptr()).next = self.free_list;
        }
        self.free_list = Some(node_ptr);
        self.free_count += 1;
    }

    fn is_full(&self) -> bool {
        self.free_count == 0
    }

    fn is_empty(&self) -> bool {
        self.free_count == self.total_objects
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        frame_allocator::free_contiguous(self.base, self.frame_count);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HeapStats {
    pub allocation_count: u64,
    pub free_count: u64,
    pub bytes_in_use: usize,
    pub large_allocations: u64,
}

struct SizeClassPool {
    object_size: usize,
    slabs: alloc::vec::Vec<Slab>,
    next_slab_frames: usize,
}

impl SizeClassPool {
    fn new(object_size: usize) -> Self {
        Self {
            object_size,
            slabs: alloc::vec::Vec::new(),
            next_slab_frames: 1,
        }
    }

    fn alloc(&mut self, frame_index: &mut BTreeMap<usize, u8>, class_idx: u8) -> KernelResult<NonNull<u8>> {
        if let Some(slab) = self.slabs.iter_mut().find(|s| !s.is_full()) {
            return Ok(slab.alloc_one().expect("slab reported non-full but had no free object"));
        }
        // Every existing slab is full: grow. Slab population doubles each
        // time so a class under sustained load amortizes allocator calls.
        let mut slab = Slab::new(self.object_size, self.next_slab_frames)?;
        for f in slab.base.0..slab.base.0 + slab.frame_count {
            frame_index.insert(f, class_idx);
        }
        let ptr = slab.alloc_one().expect("freshly built slab has free objects");
        self.next_slab_frames = (self.next_slab_frames * 2).min(256);
        self.slabs.push(slab);
        Ok(ptr)
    }

    fn free(&mut self, ptr: NonNull<u8>, frame: FrameNumber) {
        if let Some(slab) = self
            .slabs
            .iter_mut()
            .find(|s| frame.0 >= s.base.0 && frame.0 < s.base.0 + s.frame_count)
        {
            slab.free_one(ptr);
        }
        // Reclaim fully-idle slabs beyond the first, so a burst of
        // allocation followed by a long idle period returns memory.
        if self.slabs.len() > 1 {
            self.slabs.retain(|s| !s.is_empty());
        }
    }
}

struct HeapInner {
    pools: [SizeClassPool; SIZE_CLASSES.len()],
    frame_index: BTreeMap<usize, u8>,
    stats: HeapStats,
}

pub struct KernelHeap {
    inner: Mutex<Option<HeapInner>>,
}

impl KernelHeap {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn init(&self) {
        let pools = core::array::from_fn(|i| SizeClassPool::new(SIZE_CLASSES[i]));
        *self.inner.lock() = Some(HeapInner {
            pools,
            frame_index: BTreeMap::new(),
            stats: HeapStats::default(),
        });
    }

    pub fn stats(&self) -> HeapStats {
        self.inner
            .lock()
            .as_ref()
            .map(|i| i.stats)
            .unwrap_or_default()
    }

    fn alloc_small(&self, class_idx: usize, size: usize) -> *mut u8 {
        let mut guard = self.inner.lock();
        let Some(inner) = guard.as_mut() else {
            return core::ptr::null_mut();
        };
        let HeapInner {
            pools,
            frame_index,
            stats,
        } = inner;
        match pools[class_idx].alloc(frame_index, class_idx as u8) {
            Ok(ptr) => {
                stats.allocation_count += 1;
                stats.bytes_in_use += size;
                ptr.as_ptr()
            }
            Err(_) => core::ptr::null_mut(),
        }
    }

    fn alloc_large(&self, layout: Layout) -> *mut u8 {
        let frames = layout.size().div_ceil(FRAME_SIZE);
        match frame_allocator::allocate_contiguous(frames) {
            Ok(start) => {
                let mut guard = self.inner.lock();
                if let Some(inner) = guard.as_mut() {
                    inner.stats.large_allocations += 1;
                    inner.stats.bytes_in_use += frames * FRAME_SIZE;
                }
                super::phys_to_virt_addr(start.address().as_u64()) as *mut u8
            }
            Err(_) => core::ptr::null_mut(),
        }
    }

    fn free_small(&self, ptr: NonNull<u8>, class_idx: usize, frame: FrameNumber, size: usize) {
        let mut guard = self.inner.lock();
        if let Some(inner) = guard.as_mut() {
            inner.pools[class_idx].free(ptr, frame);
            inner.stats.free_count += 1;
            inner.stats.bytes_in_use = inner.stats.bytes_in_use.saturating_sub(size);
        }
    }

    fn free_large(&self, ptr: NonNull<u8>, layout: Layout) {
        let phys = super::virt_to_phys_addr(ptr.as_ptr() as u64);
        let frame = FrameNumber((phys / FRAME_SIZE as u64) as usize);
        let frames = layout.size().div_ceil(FRAME_SIZE);
        frame_allocator::free_contiguous(frame, frames);
        let mut guard = self.inner.lock();
        if let Some(inner) = guard.as_mut() {
            inner.stats.free_count += 1;
            inner.stats.bytes_in_use = inner.stats.bytes_in_use.saturating_sub(frames * FRAME_SIZE);
        }
    }

    fn class_of(&self, frame: FrameNumber) -> Option<usize> {
        self.inner
            .lock()
            .as_ref()
            .and_then(|inner| inner.frame_index.get(&frame.0).map(|&c| c as usize))
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: GlobalAlloc requires alloc/dealloc be safe to call concurrently;
// all mutable state lives behind `inner`'s Mutex.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(layout.align());
        match class_for_size(size) {
            Some(idx) => self.alloc_small(idx, size),
            None => self.alloc_large(layout),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(nn) = NonNull::new(ptr) else { return };
        let phys = super::virt_to_phys_addr(ptr as u64);
        let frame = FrameNumber((phys / FRAME_SIZE as u64) as usize);
        match self.class_of(frame) {
            Some(class_idx) => {
                let size = layout.size().max(layout.align());
                self.free_small(nn, class_idx, frame, size);
            }
            None => self.free_large(nn, layout),
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: KernelHeap = KernelHeap::new();

/// Brings the global heap allocator online. Must run after the frame
/// manager is initialized and before the first heap allocation.
pub fn init() -> KernelResult<()> {
    if frame_allocator::total_frames() == 0 {
        return Err(KernelError::NotInitialized {
            subsystem: "mm::frame_allocator",
        });
    }
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ALLOCATOR.init();
    crate::println!("[HEAP] kernel heap online: {} size classes", SIZE_CLASSES.len());
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame_allocator as pfm;

    fn fresh_heap() -> KernelHeap {
        crate::mm::test_arena::install();
        pfm::init(crate::mm::test_arena::frame_capacity(), &[]);
        let heap = KernelHeap::new();
        heap.init();
        heap
    }

    #[test]
    fn small_allocation_round_trips_through_same_class() {
        let heap = fresh_heap();
        let layout = Layout::from_size_align(24, 8).unwrap();
        let ptr = unsafe { heap.alloc(layout) };
        assert!(!ptr.is_null());
        unsafe { heap.dealloc(ptr, layout) };
        assert_eq!(heap.stats().allocation_count, 1);
        assert_eq!(heap.stats().free_count, 1);
    }

    #[test]
    fn slab_grows_when_exhausted() {
        let heap = fresh_heap();
        let layout = Layout::from_size_align(16, 16).unwrap();
        let mut ptrs = alloc::vec::Vec::new();
        // One frame of 16-byte objects is 256 objects; allocate enough to
        // force a second, larger slab.
        for _ in 0..300 {
            let p = unsafe { heap.alloc(layout) };
            assert!(!p.is_null());
            ptrs.push(p);
        }
        assert_eq!(heap.stats().allocation_count, 300);
        for p in ptrs {
            unsafe { heap.dealloc(p, layout) };
        }
    }

    #[test]
    fn large_allocation_bypasses_slabs() {
        let heap = fresh_heap();
        let layout = Layout::from_size_align(FRAME_SIZE * 3, FRAME_SIZE).unwrap();
        let ptr = unsafe { heap.alloc(layout) };
        assert!(!ptr.is_null());
        assert_eq!(heap.stats().large_allocations, 1);
        unsafe { heap.dealloc(ptr, layout) };
    }

    #[test]
    fn class_for_size_floors_at_smallest_sufficient_class() {
        assert_eq!(class_for_size(1), Some(0));
        assert_eq!(class_for_size(16), Some(0));
        assert_eq!(class_for_size(17), Some(1));
        assert_eq!(class_for_size(4096), Some(8));
        assert_eq!(class_for_size(4097), None);
    }
}
