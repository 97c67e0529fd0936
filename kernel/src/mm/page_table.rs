//! Four-level x86_64 page tables (PML4 -> PDPT -> PD -> PT), 4 KiB pages
//! only. Tables are walked through the physical-memory window
//! (`phys_to_virt_addr`) so every level can be read and written as a plain
//! Rust reference once its physical address is known.

use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use super::frame_allocator::{self, FrameNumber, PhysicalAddress};
use super::{phys_to_virt_addr, VirtualAddress};
use crate::error::{KernelError, KernelResult};

pub const ENTRIES_PER_TABLE: usize = 512;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT    = 1 << 0;
        const WRITABLE   = 1 << 1;
        const USER       = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE   = 1 << 4;
        const ACCESSED   = 1 << 5;
        const DIRTY      = 1 << 6;
        const HUGE       = 1 << 7;
        const GLOBAL     = 1 << 8;
        /// Software bit: set on a page deliberately made read-only so a
        /// write fault on it is recognized as a copy-on-write request
        /// rather than a real protection violation.
        const COW        = 1 << 9;
        const NO_EXECUTE = 1 << 63;
    }
}

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct Entry(u64);

impl Entry {
    pub const EMPTY: Entry = Entry(0);

    pub fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    pub fn addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & ADDR_MASK)
    }

    pub fn frame(&self) -> FrameNumber {
        self.addr().frame_number()
    }

    pub fn set(&mut self, addr: PhysicalAddress, flags: PageFlags) {
        self.0 = (addr.as_u64() & ADDR_MASK) | flags.bits();
    }

    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & ADDR_MASK) | flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

#[repr(align(4096))]
pub struct Table {
    entries: [Entry; ENTRIES_PER_TABLE],
}

impl Index<usize> for Table {
    type Output = Entry;
    fn index(&self, i: usize) -> &Entry {
        &self.entries[i]
    }
}

impl IndexMut<usize> for Table {
    fn index_mut(&mut self, i: usize) -> &mut Entry {
        &mut self.entries[i]
    }
}

/// The four indices (PML4, PDPT, PD, PT) a virtual address decomposes into.
fn table_indices(virt: VirtualAddress) -> [usize; 4] {
    let v = virt.as_u64();
    [
        ((v >> 39) & 0x1ff) as usize,
        ((v >> 30) & 0x1ff) as usize,
        ((v >> 21) & 0x1ff) as usize,
        ((v >> 12) & 0x1ff) as usize,
    ]
}

/// # Safety
/// `phys` must be the physical address of a frame this module formatted as
/// a page table (or a fresh, zeroed frame about to become one), and no
/// other thread may concurrently mutate it.
unsafe fn table_at(phys: PhysicalAddress) -> &'static mut Table {
    let virt = phys_to_virt_addr(phys.as_u64());
    // SAFETY: delegated to caller; the physical-memory window covers all
    // of RAM, so this cast always lands on mapped memory.
    unsafe { &mut *(virt as *mut Table) }
}

fn new_table() -> KernelResult<(PhysicalAddress, &'static mut Table)> {
    let frame = frame_allocator::allocate_frame()?;
    let addr = frame.address();
    // SAFETY: frame was just allocated and is exclusively owned here.
    let table = unsafe { table_at(addr) };
    for i in 0..ENTRIES_PER_TABLE {
        table[i].clear();
    }
    Ok((addr, table))
}

/// A mapper bound to one address space's PML4 root.
pub struct AddressSpaceRoot {
    pub pml4: PhysicalAddress,
}

impl AddressSpaceRoot {
    /// Allocates a fresh, empty PML4.
    pub fn new() -> KernelResult<Self> {
        let (addr, _) = new_table()?;
        Ok(Self { pml4: addr })
    }

    /// Builds a root that shares the kernel's higher-half mappings (PML4
    /// entries 256..512) with `kernel_root`, so every process sees the same
    /// kernel text/data without copying the lower levels. Entries 0..256
    /// (user space) start empty.
    pub fn new_with_shared_kernel(kernel_root: PhysicalAddress) -> KernelResult<Self> {
        let (addr, table) = new_table()?;
        // SAFETY: kernel_root is the live kernel PML4, read here only.
        let kernel_table = unsafe { table_at(kernel_root) };
        for i in 256..ENTRIES_PER_TABLE {
            table[i] = kernel_table[i];
        }
        Ok(Self { pml4: addr })
    }

    fn walk_create(&self, indices: [usize; 4]) -> KernelResult<&'static mut Table> {
        // SAFETY: self.pml4 is this address space's live root.
        let mut table = unsafe { table_at(self.pml4) };
        for level_index in &indices[..3] {
            let entry = &mut table[*level_index];
            let next_phys = if entry.is_present() {
                entry.addr()
            } else {
                let (addr, _) = new_table()?;
                entry.set(
                    addr,
                    PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
                );
                addr
            };
            // SAFETY: next_phys is a table this function itself created or
            // verified present above.
            table = unsafe { table_at(next_phys) };
        }
        Ok(table)
    }

    /// Maps a single 4 KiB page, allocating any intermediate page-table
    /// levels that don't yet exist.
    pub fn map(&self, virt: VirtualAddress, frame: FrameNumber, flags: PageFlags) -> KernelResult<()> {
        let indices = table_indices(virt);
        let pt = self.walk_create(indices)?;
        pt[indices[3]].set(frame.address(), flags | PageFlags::PRESENT);
        Ok(())
    }

    /// Looks up the mapping for `virt`, if present.
    pub fn translate(&self, virt: VirtualAddress) -> Option<(FrameNumber, PageFlags)> {
        let indices = table_indices(virt);
        // SAFETY: self.pml4 is this address space's live root.
        let mut table = unsafe { table_at(self.pml4) };
        for level_index in &indices[..3] {
            let entry = &table[*level_index];
            if !entry.is_present() {
                return None;
            }
            // SAFETY: entry.addr() is a page table this mapper created.
            table = unsafe { table_at(entry.addr()) };
        }
        let leaf = &table[indices[3]];
        if !leaf.is_present() {
            return None;
        }
        Some((leaf.frame(), leaf.flags()))
    }

    /// Changes the flags of an existing mapping without touching its frame,
    /// e.g. clearing `WRITABLE | COW` after a copy-on-write fault resolves.
    pub fn set_flags(&self, virt: VirtualAddress, flags: PageFlags) -> KernelResult<()> {
        let indices = table_indices(virt);
        // SAFETY: self.pml4 is this address space's live root.
        let mut table = unsafe { table_at(self.pml4) };
        for level_index in &indices[..3] {
            let entry = &table[*level_index];
            if !entry.is_present() {
                return Err(KernelError::UnmappedMemory {
                    addr: virt.as_u64() as usize,
                });
            }
            // SAFETY: entry.addr() is a page table this mapper created.
            table = unsafe { table_at(entry.addr()) };
        }
        let leaf = &mut table[indices[3]];
        if !leaf.is_present() {
            return Err(KernelError::UnmappedMemory {
                addr: virt.as_u64() as usize,
            });
        }
        leaf.set_flags(flags | PageFlags::PRESENT);
        Ok(())
    }

    /// Unmaps a single page, returning the frame it pointed at, if any.
    /// Does not free the frame: callers that need refcounted (COW) frames
    /// decide whether to free it themselves.
    pub fn unmap(&self, virt: VirtualAddress) -> Option<FrameNumber> {
        let indices = table_indices(virt);
        // SAFETY: self.pml4 is this address space's live root.
        let mut table = unsafe { table_at(self.pml4) };
        for level_index in &indices[..3] {
            let entry = &table[*level_index];
            if !entry.is_present() {
                return None;
            }
            // SAFETY: entry.addr() is a page table this mapper created.
            table = unsafe { table_at(entry.addr()) };
        }
        let leaf = &mut table[indices[3]];
        if !leaf.is_present() {
            return None;
        }
        let frame = leaf.frame();
        leaf.clear();
        #[cfg(target_os = "none")]
        crate::arch::x86_64::mmu::flush_tlb_address(virt.as_u64());
        Some(frame)
    }

    /// Walks every present leaf entry in the user half (PML4 0..256),
    /// invoking `f(virt, frame)` for each, then frees every page-table
    /// frame (levels 1-3) that belonged only to the user half. Used when
    /// tearing down a process's address space; the kernel half (256..512)
    /// is shared and never touched.
    pub fn free_user_mappings(&self, mut f: impl FnMut(VirtualAddress, FrameNumber)) {
        // SAFETY: self.pml4 is this address space's live root, about to be
        // torn down; no other thread may reference it concurrently.
        let pml4 = unsafe { table_at(self.pml4) };
        for l4 in 0..256 {
            let l4_entry = pml4[l4];
            if !l4_entry.is_present() {
                continue;
            }
            let l3_phys = l4_entry.addr();
            // SAFETY: l3_phys was created by walk_create for this root.
            let l3 = unsafe { table_at(l3_phys) };
            for l3i in 0..ENTRIES_PER_TABLE {
                let l3_entry = l3[l3i];
                if !l3_entry.is_present() {
                    continue;
                }
                let l2_phys = l3_entry.addr();
                // SAFETY: l2_phys was created by walk_create for this root.
                let l2 = unsafe { table_at(l2_phys) };
                for l2i in 0..ENTRIES_PER_TABLE {
                    let l2_entry = l2[l2i];
                    if !l2_entry.is_present() {
                        continue;
                    }
                    let l1_phys = l2_entry.addr();
                    // SAFETY: l1_phys was created by walk_create for this root.
                    let l1 = unsafe { table_at(l1_phys) };
                    for l1i in 0..ENTRIES_PER_TABLE {
                        let leaf = l1[l1i];
                        if leaf.is_present() {
                            let virt = VirtualAddress::new(
                                ((l4 as u64) << 39)
                                    | ((l3i as u64) << 30)
                                    | ((l2i as u64) << 21)
                                    | ((l1i as u64) << 12),
                            );
                            f(virt, leaf.frame());
                        }
                    }
                    frame_allocator::free_frame(l1_phys.frame_number());
                }
                frame_allocator::free_frame(l2_phys.frame_number());
            }
            frame_allocator::free_frame(l3_phys.frame_number());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        crate::mm::test_arena::install();
        frame_allocator::init(crate::mm::test_arena::frame_capacity(), &[]);
    }

    #[test]
    fn map_then_translate_round_trips() {
        setup();
        let root = AddressSpaceRoot::new().unwrap();
        let frame = frame_allocator::allocate_frame().unwrap();
        let virt = VirtualAddress::new(0x0000_1234_5000);
        root.map(virt, frame, PageFlags::WRITABLE | PageFlags::USER)
            .unwrap();
        let (got_frame, flags) = root.translate(virt).unwrap();
        assert_eq!(got_frame, frame);
        assert!(flags.contains(PageFlags::WRITABLE));
        assert!(flags.contains(PageFlags::PRESENT));
    }

    #[test]
    fn unmap_clears_translation() {
        setup();
        let root = AddressSpaceRoot::new().unwrap();
        let frame = frame_allocator::allocate_frame().unwrap();
        let virt = VirtualAddress::new(0x2000);
        root.map(virt, frame, PageFlags::WRITABLE).unwrap();
        assert!(root.unmap(virt).is_some());
        assert!(root.translate(virt).is_none());
    }

    #[test]
    fn shared_kernel_half_is_visible_in_child_root() {
        setup();
        let kernel_root = AddressSpaceRoot::new().unwrap();
        let kframe = frame_allocator::allocate_frame().unwrap();
        let kvirt = VirtualAddress::new(0xFFFF_8000_0000_0000);
        kernel_root
            .map(kvirt, kframe, PageFlags::WRITABLE)
            .unwrap();

        let child = AddressSpaceRoot::new_with_shared_kernel(kernel_root.pml4).unwrap();
        let (frame, _) = child.translate(kvirt).unwrap();
        assert_eq!(frame, kframe);
    }
}
