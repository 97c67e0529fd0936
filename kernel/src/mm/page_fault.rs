//! Page fault dispatch.
//!
//! Architecture trap handlers decode the raw fault into a [`PageFaultInfo`]
//! and call [`handle_page_fault`], which tries, in order: demand paging
//! (the address is in a valid VMA but unmapped), copy-on-write (a write to
//! a page shared by `fork`), stack growth (a guard-page access just below
//! the mapped stack), and finally signals SIGSEGV-equivalent failure.

extern crate alloc;
use alloc::collections::BTreeMap;

use spin::Mutex;

use super::frame_allocator::{self, FrameNumber};
use super::page_table::PageFlags;
use super::vas::{vma_flags_to_page_flags, AddressSpace, VmaKind};
use super::{phys_to_virt_addr, VirtualAddress, FRAME_SIZE};
use crate::error::KernelError;

/// Reason a page fault occurred, decoded by the architecture trap handler
/// from the raw hardware error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultReason {
    NotPresent,
    ProtectionViolation,
}

#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    pub faulting_address: u64,
    pub reason: PageFaultReason,
    pub was_write: bool,
    pub was_user_mode: bool,
    pub instruction_pointer: u64,
}

impl PageFaultInfo {
    /// Decodes an x86_64 `#PF` error code (pushed by the CPU) plus the
    /// faulting address from `CR2`.
    pub fn from_x86_64(error_code: u64, cr2: u64, rip: u64) -> Self {
        let present = error_code & 0x1 != 0;
        Self {
            faulting_address: cr2,
            reason: if present {
                PageFaultReason::ProtectionViolation
            } else {
                PageFaultReason::NotPresent
            },
            was_write: error_code & 0x2 != 0,
            was_user_mode: error_code & 0x4 != 0,
            instruction_pointer: rip,
        }
    }
}

/// Per-frame reference count for frames shared copy-on-write across a
/// `fork`. Frames not present here have an implicit refcount of 1 (singly
/// owned); this keeps the common, non-forked case free of bookkeeping.
static COW_REFCOUNTS: Mutex<BTreeMap<usize, u32>> = Mutex::new(BTreeMap::new());

pub fn cow_refcount(frame: FrameNumber) -> u32 {
    COW_REFCOUNTS.lock().get(&frame.0).copied().unwrap_or(1)
}

pub fn inc_cow_refcount(frame: FrameNumber) {
    let mut map = COW_REFCOUNTS.lock();
    let count = map.entry(frame.0).or_insert(1);
    *count += 1;
}

pub fn dec_cow_refcount(frame: FrameNumber) {
    let mut map = COW_REFCOUNTS.lock();
    if let Some(count) = map.get_mut(&frame.0) {
        if *count > 1 {
            *count -= 1;
        } else {
            map.remove(&frame.0);
        }
    }
}

pub fn clear_cow_refcount(frame: FrameNumber) {
    COW_REFCOUNTS.lock().remove(&frame.0);
}

/// The address space the currently running task is mapped under. The
/// scheduler updates this on every context switch; the `#PF` trap handler
/// reads it to know which [`AddressSpace`] a fault should be resolved
/// against, since the hardware only hands the handler a faulting address.
static CURRENT_ADDRESS_SPACE: Mutex<Option<AddressSpace>> = Mutex::new(None);

/// Installs the address space the next page fault should be resolved
/// against. Called by the scheduler (see `sched::scheduler::switch_to`)
/// whenever it switches to a task carrying its own address space.
pub fn set_current_address_space(space: AddressSpace) {
    *CURRENT_ADDRESS_SPACE.lock() = Some(space);
}

/// Removes and returns whatever address space is currently installed, if
/// any. Called by the scheduler when switching away from a task, so the
/// address space can be handed back to that task's TCB rather than left
/// installed for whatever runs next.
pub fn take_current_address_space() -> Option<AddressSpace> {
    CURRENT_ADDRESS_SPACE.lock().take()
}

/// Dispatches a page fault against whichever address space is currently
/// installed via [`set_current_address_space`]. Used directly by the
/// architecture trap handler, which has no other way to reach the running
/// task's address space.
pub fn handle_current_page_fault(info: PageFaultInfo) -> Result<(), KernelError> {
    let mut guard = CURRENT_ADDRESS_SPACE.lock();
    let space = guard.as_mut().ok_or(KernelError::NotInitialized {
        subsystem: "current address space",
    })?;
    handle_page_fault(space, info)
}

/// Runs `f` against the currently installed address space. Used by syscall
/// handlers (`mmap`/`munmap`/`brk`) that need to mutate the running task's
/// VMAs, for the same reason [`handle_current_page_fault`] does.
pub fn with_current_address_space<T>(
    f: impl FnOnce(&mut AddressSpace) -> Result<T, KernelError>,
) -> Result<T, KernelError> {
    let mut guard = CURRENT_ADDRESS_SPACE.lock();
    let space = guard.as_mut().ok_or(KernelError::NotInitialized {
        subsystem: "current address space",
    })?;
    f(space)
}

const STACK_GUARD_SIZE: u64 = FRAME_SIZE as u64;
const MAX_STACK_GROWTH: u64 = 128 * 1024;

/// Dispatches a page fault against `space`. Returns `Ok(())` once the
/// fault is resolved and the faulting instruction can safely be retried;
/// `Err` means the access is illegal and the caller should deliver a fatal
/// signal / terminate the task.
pub fn handle_page_fault(space: &mut AddressSpace, info: PageFaultInfo) -> Result<(), KernelError> {
    match info.reason {
        PageFaultReason::NotPresent => {
            if try_demand_page(space, &info).is_ok() {
                return Ok(());
            }
            if try_stack_growth(space, &info).is_ok() {
                return Ok(());
            }
        }
        PageFaultReason::ProtectionViolation => {
            if info.was_write && try_copy_on_write(space, &info).is_ok() {
                return Ok(());
            }
        }
    }
    Err(KernelError::InvalidAddress {
        addr: info.faulting_address as usize,
    })
}

fn page_of(addr: u64) -> VirtualAddress {
    VirtualAddress::new(addr & !(FRAME_SIZE as u64 - 1))
}

/// The address is inside a VMA but has no physical frame yet: allocate
/// one, zero it (or read it in from the VMA's file backing), and map it.
fn try_demand_page(space: &mut AddressSpace, info: &PageFaultInfo) -> Result<(), KernelError> {
    let vaddr = VirtualAddress::new(info.faulting_address);
    let vma = space
        .find_vma(vaddr)
        .ok_or(KernelError::UnmappedMemory {
            addr: info.faulting_address as usize,
        })?
        .clone();

    if space.root.translate(page_of(info.faulting_address)).is_some() {
        return Err(KernelError::InvalidAddress {
            addr: info.faulting_address as usize,
        });
    }

    let frame = frame_allocator::allocate_frame()?;
    zero_frame(frame);
    if let VmaKind::File { device_id, file_offset } = vma.kind {
        let page_index = (page_of(info.faulting_address).as_u64() - vma.start.as_u64()) / FRAME_SIZE as u64;
        let offset = file_offset + page_index * FRAME_SIZE as u64;
        super::demand_paging::populate_vma_page(device_id, offset, frame)?;
    }

    let flags = vma_flags_to_page_flags(vma.flags);
    let page = page_of(info.faulting_address);
    space.root.map(page, frame, flags)?;
    super::clock::register(super::clock::ClockEntry {
        root: space.root.pml4,
        vaddr: page,
        frame,
    });
    Ok(())
}

/// The page is present but read-only and shared (fork'd): give the
/// faulting task a private writable copy.
fn try_copy_on_write(space: &mut AddressSpace, info: &PageFaultInfo) -> Result<(), KernelError> {
    let vaddr = page_of(info.faulting_address);
    let vma = space
        .find_vma(VirtualAddress::new(info.faulting_address))
        .ok_or(KernelError::UnmappedMemory {
            addr: info.faulting_address as usize,
        })?;
    if !vma.flags.contains(super::vas::VmaFlags::WRITE) {
        return Err(KernelError::PermissionDenied {
            operation: "write to read-only mapping",
        });
    }

    let (old_frame, flags) = space
        .root
        .translate(vaddr)
        .ok_or(KernelError::UnmappedMemory {
            addr: info.faulting_address as usize,
        })?;
    if !flags.contains(PageFlags::COW) {
        return Err(KernelError::PermissionDenied {
            operation: "write fault on non-COW read-only page",
        });
    }

    if cow_refcount(old_frame) <= 1 {
        // We're the sole owner; just flip the page writable in place.
        space
            .root
            .set_flags(vaddr, (flags & !PageFlags::COW) | PageFlags::WRITABLE)?;
        return Ok(());
    }

    let new_frame = frame_allocator::allocate_frame()?;
    copy_frame(old_frame, new_frame);
    dec_cow_refcount(old_frame);
    space.root.unmap(vaddr);
    let new_flags = (flags & !PageFlags::COW) | PageFlags::WRITABLE;
    space.root.map(vaddr, new_frame, new_flags)?;
    Ok(())
}

/// A write or read just below the mapped stack, within the allowed growth
/// window: extend the stack VMA downward by one page and demand-page it.
fn try_stack_growth(space: &mut AddressSpace, info: &PageFaultInfo) -> Result<(), KernelError> {
    let fault = info.faulting_address;
    // The stack is the topmost user mapping; picking the writable anonymous
    // VMA with the highest `end` distinguishes it from brk/mmap regions,
    // which always sit below `USER_MMAP_BASE`.
    let stack_vma = space
        .vmas()
        .iter()
        .filter(|v| matches!(v.kind, VmaKind::Anonymous) && v.flags.contains(super::vas::VmaFlags::WRITE))
        .max_by_key(|v| v.end.as_u64())
        .cloned()
        .ok_or(KernelError::UnmappedMemory {
            addr: fault as usize,
        })?;

    let gap = stack_vma.start.as_u64().saturating_sub(fault);
    if fault >= stack_vma.start.as_u64() || gap > MAX_STACK_GROWTH + STACK_GUARD_SIZE {
        return Err(KernelError::InvalidAddress {
            addr: fault as usize,
        });
    }

    let new_start = page_of(fault);
    let frame = frame_allocator::allocate_frame()?;
    zero_frame(frame);
    let flags = vma_flags_to_page_flags(stack_vma.flags);
    space.root.map(new_start, frame, flags)?;

    if let Some(vma) = space
        .vmas_mut()
        .iter_mut()
        .find(|v| v.start.as_u64() == stack_vma.start.as_u64())
    {
        vma.start = new_start;
    }
    Ok(())
}

fn zero_frame(frame: FrameNumber) {
    let virt = phys_to_virt_addr(frame.address().as_u64()) as *mut u8;
    // SAFETY: frame was just allocated and is exclusively owned here; the
    // physical-memory window maps it as a writable `FRAME_SIZE` region.
    unsafe {
        core::ptr::write_bytes(virt, 0, FRAME_SIZE);
    }
}

fn copy_frame(src: FrameNumber, dst: FrameNumber) {
    let src_virt = phys_to_virt_addr(src.address().as_u64()) as *const u8;
    let dst_virt = phys_to_virt_addr(dst.address().as_u64()) as *mut u8;
    // SAFETY: both frames are valid, `FRAME_SIZE`-long, non-overlapping
    // (freshly allocated) regions mapped through the physical window.
    unsafe {
        core::ptr::copy_nonoverlapping(src_virt, dst_virt, FRAME_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::page_table::AddressSpaceRoot;
    use crate::mm::vas::VmaFlags;

    fn fresh_space() -> AddressSpace {
        crate::mm::test_arena::install();
        frame_allocator::init(crate::mm::test_arena::frame_capacity(), &[]);
        let kernel_root = AddressSpaceRoot::new().unwrap();
        AddressSpace::new(kernel_root.pml4).unwrap()
    }

    #[test]
    fn demand_page_maps_a_fresh_zeroed_frame() {
        let mut space = fresh_space();
        let addr = space
            .mmap(None, FRAME_SIZE as u64, VmaFlags::READ | VmaFlags::WRITE, VmaKind::Anonymous)
            .unwrap();
        let info = PageFaultInfo {
            faulting_address: addr.as_u64(),
            reason: PageFaultReason::NotPresent,
            was_write: true,
            was_user_mode: true,
            instruction_pointer: 0,
        };
        handle_page_fault(&mut space, info).unwrap();
        assert!(space.root.translate(addr).is_some());
    }

    #[test]
    fn cow_fault_gives_private_copy_when_shared() {
        let mut space = fresh_space();
        let addr = space
            .mmap(None, FRAME_SIZE as u64, VmaFlags::READ | VmaFlags::WRITE, VmaKind::Anonymous)
            .unwrap();
        // Fault it in, then mark it COW-shared as fork() would.
        let info = PageFaultInfo {
            faulting_address: addr.as_u64(),
            reason: PageFaultReason::NotPresent,
            was_write: true,
            was_user_mode: true,
            instruction_pointer: 0,
        };
        handle_page_fault(&mut space, info).unwrap();
        let (frame, flags) = space.root.translate(addr).unwrap();
        space
            .root
            .set_flags(addr, (flags & !PageFlags::WRITABLE) | PageFlags::COW)
            .unwrap();
        inc_cow_refcount(frame);

        let write_info = PageFaultInfo {
            faulting_address: addr.as_u64(),
            reason: PageFaultReason::ProtectionViolation,
            was_write: true,
            was_user_mode: true,
            instruction_pointer: 0,
        };
        handle_page_fault(&mut space, write_info).unwrap();
        let (new_frame, new_flags) = space.root.translate(addr).unwrap();
        assert_ne!(new_frame, frame);
        assert!(new_flags.contains(PageFlags::WRITABLE));
    }

    #[test]
    fn file_backed_fault_populates_from_registered_device() {
        extern crate alloc;
        use crate::fs::blockdev::RamBlockDevice;

        let mut space = fresh_space();
        let mut dev = RamBlockDevice::new(alloc::string::String::from("disk"), 512, 64);
        let pattern = alloc::vec![0x42u8; FRAME_SIZE];
        dev.write_sectors(0, &pattern).unwrap();
        crate::mm::demand_paging::register_device(1, alloc::sync::Arc::new(dev));

        let addr = space
            .mmap(
                None,
                FRAME_SIZE as u64,
                VmaFlags::READ,
                VmaKind::File {
                    device_id: 1,
                    file_offset: 0,
                },
            )
            .unwrap();
        let info = PageFaultInfo {
            faulting_address: addr.as_u64(),
            reason: PageFaultReason::NotPresent,
            was_write: false,
            was_user_mode: true,
            instruction_pointer: 0,
        };
        handle_page_fault(&mut space, info).unwrap();

        let (frame, _) = space.root.translate(addr).unwrap();
        let virt = phys_to_virt_addr(frame.address().as_u64()) as *const u8;
        let read_back = unsafe { core::slice::from_raw_parts(virt, FRAME_SIZE) };
        assert_eq!(read_back, pattern.as_slice());

        crate::mm::demand_paging::unregister_device(1);
    }

    #[test]
    fn unmapped_address_with_no_vma_is_rejected() {
        let mut space = fresh_space();
        let info = PageFaultInfo {
            faulting_address: 0xdead_0000,
            reason: PageFaultReason::NotPresent,
            was_write: false,
            was_user_mode: true,
            instruction_pointer: 0,
        };
        assert!(handle_page_fault(&mut space, info).is_err());
    }
}
