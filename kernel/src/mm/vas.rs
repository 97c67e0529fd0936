//! Virtual address space: the sorted, non-overlapping list of VMAs backing
//! one process's memory map, and the `mmap`/`munmap`/`brk` operations over
//! it. Actual page-table mutation is delegated to
//! [`super::page_table::AddressSpaceRoot`]; this module owns the
//! bookkeeping layer on top (what's mapped where, with what permissions
//! and backing).

extern crate alloc;
use alloc::vec::Vec;

use bitflags::bitflags;

use super::frame_allocator::FrameNumber;
use super::page_table::{AddressSpaceRoot, PageFlags};
use super::{VirtualAddress, FRAME_SIZE};
use crate::error::{KernelError, KernelResult};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
        /// Writes are private to this address space (copy-on-write on
        /// fork); the alternative, shared mappings, is out of scope.
        const PRIVATE = 1 << 3;
    }
}

/// What a VMA's pages are backed by once faulted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaKind {
    /// Zero-filled anonymous memory (heap, anonymous mmap, stack).
    Anonymous,
    /// Backed by a block device registered with
    /// [`super::demand_paging::register_device`]; `file_offset` is the
    /// byte offset backing the VMA's first page, and each subsequent page
    /// reads `file_offset + (page − vma.start)` (spec formula for
    /// file-backed demand paging).
    File { device_id: u32, file_offset: u64 },
}

/// A virtual memory area: `[start, end)`, half-open, page-aligned.
#[derive(Debug, Clone)]
pub struct Vma {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub flags: VmaFlags,
    pub kind: VmaKind,
}

impl Vma {
    pub fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, addr: VirtualAddress) -> bool {
        addr.as_u64() >= self.start.as_u64() && addr.as_u64() < self.end.as_u64()
    }

    fn overlaps(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.start.as_u64() < end.as_u64() && start.as_u64() < self.end.as_u64()
    }
}

/// Default layout constants for a fresh user address space. Chosen so
/// `brk` and `mmap` regions can each grow for gigabytes without meeting.
const USER_HEAP_BASE: u64 = 0x0000_0001_0000_0000;
const USER_MMAP_BASE: u64 = 0x0000_0010_0000_0000;
const USER_STACK_TOP: u64 = 0x0000_7fff_ffff_f000;
const USER_STACK_SIZE: u64 = 8 * 1024 * 1024;

/// One process's memory map: the page-table root plus the VMA list that
/// describes what should be mapped into it.
pub struct AddressSpace {
    pub root: AddressSpaceRoot,
    vmas: Vec<Vma>,
    brk_start: VirtualAddress,
    brk_current: VirtualAddress,
    mmap_cursor: VirtualAddress,
}

impl AddressSpace {
    /// Creates a fresh address space sharing the kernel's upper half, with
    /// a guard-less fixed-size stack already mapped as an anonymous VMA
    /// (pages are still demand-faulted in, not populated eagerly) and an
    /// empty brk region.
    pub fn new(kernel_root: super::frame_allocator::PhysicalAddress) -> KernelResult<Self> {
        let root = AddressSpaceRoot::new_with_shared_kernel(kernel_root)?;
        let mut vmas = Vec::new();
        vmas.push(Vma {
            start: VirtualAddress::new(USER_STACK_TOP - USER_STACK_SIZE),
            end: VirtualAddress::new(USER_STACK_TOP),
            flags: VmaFlags::READ | VmaFlags::WRITE | VmaFlags::PRIVATE,
            kind: VmaKind::Anonymous,
        });
        Ok(Self {
            root,
            vmas,
            brk_start: VirtualAddress::new(USER_HEAP_BASE),
            brk_current: VirtualAddress::new(USER_HEAP_BASE),
            mmap_cursor: VirtualAddress::new(USER_MMAP_BASE),
        })
    }

    pub fn vmas(&self) -> &[Vma] {
        &self.vmas
    }

    pub fn vmas_mut(&mut self) -> &mut [Vma] {
        &mut self.vmas
    }

    /// Finds the VMA containing `addr`, if any. VMAs are kept sorted by
    /// `start` so this is a binary search.
    pub fn find_vma(&self, addr: VirtualAddress) -> Option<&Vma> {
        let idx = self
            .vmas
            .partition_point(|v| v.end.as_u64() <= addr.as_u64());
        self.vmas.get(idx).filter(|v| v.contains(addr))
    }

    fn insert_sorted(&mut self, vma: Vma) -> KernelResult<()> {
        if self.vmas.iter().any(|v| v.overlaps(vma.start, vma.end)) {
            return Err(KernelError::InvalidArgument {
                name: "vma",
                value: "overlaps an existing mapping",
            });
        }
        let idx = self
            .vmas
            .partition_point(|v| v.start.as_u64() < vma.start.as_u64());
        self.vmas.insert(idx, vma);
        Ok(())
    }

    /// Anonymous or file-backed `mmap`. Picks the next free address at or
    /// above the mmap cursor when `hint` is `None`; honors `hint` exactly
    /// (fixed mapping) when given, failing if it overlaps.
    pub fn mmap(
        &mut self,
        hint: Option<VirtualAddress>,
        len: u64,
        flags: VmaFlags,
        kind: VmaKind,
    ) -> KernelResult<VirtualAddress> {
        let page_len = len.div_ceil(FRAME_SIZE as u64) * FRAME_SIZE as u64;
        let start = match hint {
            Some(addr) => addr.align_down(FRAME_SIZE as u64),
            None => self.mmap_cursor,
        };
        let end = VirtualAddress::new(start.as_u64() + page_len);
        self.insert_sorted(Vma {
            start,
            end,
            flags,
            kind,
        })?;
        if hint.is_none() {
            self.mmap_cursor = end;
        }
        Ok(start)
    }

    /// Unmaps `[addr, addr+len)`. Only whole-VMA unmaps are supported;
    /// partial unmaps (splitting a VMA) are rejected as `InvalidArgument`
    /// since no user of this kernel currently needs them.
    pub fn munmap(&mut self, addr: VirtualAddress, len: u64) -> KernelResult<()> {
        let page_len = len.div_ceil(FRAME_SIZE as u64) * FRAME_SIZE as u64;
        let end = VirtualAddress::new(addr.as_u64() + page_len);
        let idx = self
            .vmas
            .iter()
            .position(|v| v.start.as_u64() == addr.as_u64() && v.end.as_u64() == end.as_u64())
            .ok_or(KernelError::InvalidArgument {
                name: "addr",
                value: "no matching whole-VMA mapping",
            })?;
        let vma = self.vmas.remove(idx);
        let mut virt = vma.start;
        while virt.as_u64() < vma.end.as_u64() {
            if let Some(frame) = self.root.unmap(virt) {
                super::clock::forget(self.root.pml4, virt);
                maybe_free_frame(frame);
            }
            virt = VirtualAddress::new(virt.as_u64() + FRAME_SIZE as u64);
        }
        Ok(())
    }

    /// Grows or shrinks the brk (anonymous heap) VMA to end at
    /// `new_brk`, returning the resulting break address. Called with
    /// `new_brk == brk_current` to just query the current break.
    pub fn brk(&mut self, new_brk: Option<VirtualAddress>) -> KernelResult<VirtualAddress> {
        let Some(target) = new_brk else {
            return Ok(self.brk_current);
        };
        let target = target.align_up(FRAME_SIZE as u64);
        if target.as_u64() < self.brk_start.as_u64() {
            return Err(KernelError::InvalidArgument {
                name: "brk",
                value: "below heap start",
            });
        }

        let brk_idx = self.vmas.iter().position(|v| {
            v.start.as_u64() == self.brk_start.as_u64() && matches!(v.kind, VmaKind::Anonymous)
        });

        if target.as_u64() > self.brk_current.as_u64() {
            // Growing: extend the existing brk VMA, or create it on first growth.
            match brk_idx {
                Some(idx) => {
                    if self
                        .vmas
                        .iter()
                        .enumerate()
                        .any(|(i, v)| i != idx && v.overlaps(self.brk_current, target))
                    {
                        return Err(KernelError::OutOfMemory {
                            requested: (target.as_u64() - self.brk_current.as_u64()) as usize,
                            available: 0,
                        });
                    }
                    self.vmas[idx].end = target;
                }
                None => {
                    self.insert_sorted(Vma {
                        start: self.brk_start,
                        end: target,
                        flags: VmaFlags::READ | VmaFlags::WRITE | VmaFlags::PRIVATE,
                        kind: VmaKind::Anonymous,
                    })?;
                }
            }
        } else if target.as_u64() < self.brk_current.as_u64() {
            // Shrinking: unmap the pages being released and trim the VMA.
            if let Some(idx) = brk_idx {
                let mut virt = target;
                while virt.as_u64() < self.brk_current.as_u64() {
                    if let Some(frame) = self.root.unmap(virt) {
                        super::clock::forget(self.root.pml4, virt);
                        maybe_free_frame(frame);
                    }
                    virt = VirtualAddress::new(virt.as_u64() + FRAME_SIZE as u64);
                }
                if target.as_u64() == self.brk_start.as_u64() {
                    self.vmas.remove(idx);
                } else {
                    self.vmas[idx].end = target;
                }
            }
        }
        self.brk_current = target;
        Ok(self.brk_current)
    }
}

/// Frame refcounting for copy-on-write lives in `page_fault`; plain
/// single-owner unmaps (munmap/brk shrink/process teardown) free
/// unconditionally unless the frame is still shared.
fn maybe_free_frame(frame: FrameNumber) {
    if super::page_fault::cow_refcount(frame) <= 1 {
        super::frame_allocator::free_frame(frame);
        super::page_fault::clear_cow_refcount(frame);
    } else {
        super::page_fault::dec_cow_refcount(frame);
    }
}

pub fn vma_flags_to_page_flags(flags: VmaFlags) -> PageFlags {
    let mut pf = PageFlags::USER;
    if flags.contains(VmaFlags::WRITE) {
        pf |= PageFlags::WRITABLE;
    }
    if !flags.contains(VmaFlags::EXEC) {
        pf |= PageFlags::NO_EXECUTE;
    }
    pf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame_allocator;

    fn fresh_space() -> AddressSpace {
        crate::mm::test_arena::install();
        frame_allocator::init(crate::mm::test_arena::frame_capacity(), &[]);
        let kernel_root = AddressSpaceRoot::new().unwrap();
        AddressSpace::new(kernel_root.pml4).unwrap()
    }

    #[test]
    fn mmap_picks_next_free_address_and_find_vma_locates_it() {
        let mut space = fresh_space();
        let addr = space
            .mmap(None, 4096 * 3, VmaFlags::READ | VmaFlags::WRITE, VmaKind::Anonymous)
            .unwrap();
        assert!(space.find_vma(addr).is_some());
        assert!(space
            .find_vma(VirtualAddress::new(addr.as_u64() + 4096 * 3))
            .is_none());
    }

    #[test]
    fn mmap_rejects_overlap_with_fixed_hint() {
        let mut space = fresh_space();
        let addr = space
            .mmap(None, 4096, VmaFlags::READ, VmaKind::Anonymous)
            .unwrap();
        let overlap = space.mmap(Some(addr), 4096, VmaFlags::READ, VmaKind::Anonymous);
        assert!(overlap.is_err());
    }

    #[test]
    fn brk_grows_then_shrinks() {
        let mut space = fresh_space();
        let base = space.brk(None).unwrap();
        let grown = space
            .brk(Some(VirtualAddress::new(base.as_u64() + 4096 * 4)))
            .unwrap();
        assert_eq!(grown.as_u64(), base.as_u64() + 4096 * 4);
        let shrunk = space.brk(Some(base)).unwrap();
        assert_eq!(shrunk, base);
        assert!(space.find_vma(base).is_none());
    }

    #[test]
    fn munmap_removes_vma() {
        let mut space = fresh_space();
        let addr = space
            .mmap(None, 4096, VmaFlags::READ | VmaFlags::WRITE, VmaKind::Anonymous)
            .unwrap();
        space.munmap(addr, 4096).unwrap();
        assert!(space.find_vma(addr).is_none());
    }
}
