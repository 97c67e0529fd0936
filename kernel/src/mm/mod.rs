//! Memory management: physical frames, the kernel heap, and the virtual
//! memory manager (address spaces, paging, demand paging, copy-on-write).

#![allow(dead_code)]

use core::sync::atomic::{AtomicU64, Ordering};

pub mod bootloader;
pub mod clock;
pub mod demand_paging;
pub mod frame_allocator;
pub mod heap;
pub mod page_fault;
pub mod page_table;
pub mod user_validation;
pub mod vas;

pub use frame_allocator::{FrameNumber, PhysicalAddress, FRAME_SIZE};
pub use vas::{AddressSpace, Vma, VmaFlags, VmaKind};

/// A physical memory region, used when reporting the memory map discovered
/// at boot (see `bootstrap::x86_64_multiboot_regions`).
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: PhysicalAddress,
    pub len: u64,
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn add(&self, offset: usize) -> Self {
        Self(self.0 + offset as u64)
    }

    pub fn align_down(&self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    pub fn align_up(&self, align: u64) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }

    pub fn page_offset(&self) -> u64 {
        self.0 & (FRAME_SIZE as u64 - 1)
    }
}

/// Page sizes the x86_64 page table format supports. Only `Small` is used
/// for demand-paged user mappings; `Large`/`Huge` are recognized when
/// walking tables built by the bootloader but never constructed here.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Small = 4096,
    Large = 2 * 1024 * 1024,
    Huge = 1024 * 1024 * 1024,
}

/// Offset added to a physical address to reach the kernel's identity
/// window onto all physical memory (the bootloader maps all of RAM at this
/// offset, per the `bootloader_api` "map physical memory" feature). Set
/// once during boot; read-mostly afterward, so a relaxed `AtomicU64` is
/// precise enough and avoids a lock on every page-table walk.
pub static PHYS_MEM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Converts a physical address to the kernel virtual address that maps it,
/// via the bootloader's physical-memory window.
pub fn phys_to_virt_addr(phys: u64) -> u64 {
    phys + PHYS_MEM_OFFSET.load(Ordering::Relaxed)
}

/// Inverse of [`phys_to_virt_addr`] for addresses known to lie inside the
/// physical-memory window (kernel heap and page-table allocations; never
/// user-space addresses).
pub fn virt_to_phys_addr(virt: u64) -> u64 {
    virt - PHYS_MEM_OFFSET.load(Ordering::Relaxed)
}

/// Sets the physical memory window offset. Called once from the boot
/// sequence with the value the bootloader reports.
pub fn set_phys_mem_offset(offset: u64) {
    PHYS_MEM_OFFSET.store(offset, Ordering::Relaxed);
}

/// Initializes the memory subsystems in dependency order: frame manager,
/// then kernel heap, then the boot (kernel) address space.
pub fn init(
    total_frames: usize,
    reserved: &[frame_allocator::ReservedRegion],
    phys_mem_offset: u64,
) -> crate::error::KernelResult<()> {
    set_phys_mem_offset(phys_mem_offset);
    frame_allocator::init(total_frames, reserved);
    heap::init()?;
    println!(
        "[MM] online: {} frames ({} MiB), {} reserved region(s)",
        total_frames,
        total_frames * FRAME_SIZE / (1024 * 1024),
        reserved.len()
    );
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod test_arena {
    //! Backs `phys_to_virt_addr` with a real heap-allocated arena on host
    //! test builds, so unit tests that exercise the slab allocator and page
    //! tables can safely dereference the "physical" addresses the frame
    //! manager hands out. On the bare-metal target, physical memory is
    //! real and this module is unused.
    use super::*;
    use std::sync::Once;

    const ARENA_FRAMES: usize = 8192; // 32 MiB

    static INIT: Once = Once::new();

    pub fn install() {
        INIT.call_once(|| {
            let layout =
                std::alloc::Layout::from_size_align(ARENA_FRAMES * FRAME_SIZE, FRAME_SIZE)
                    .unwrap();
            // SAFETY: layout is non-zero sized and properly aligned; this
            // arena is leaked for the lifetime of the test process, which
            // is the intended "physical memory" for all mm unit tests.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            set_phys_mem_offset(ptr as u64);
        });
    }

    pub fn frame_capacity() -> usize {
        ARENA_FRAMES
    }
}
