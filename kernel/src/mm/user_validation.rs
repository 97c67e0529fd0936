//! User pointer validation for syscall argument handling.
//!
//! Every syscall that receives a user-space pointer and length must run it
//! through [`validate_user_range`] before the kernel dereferences it: a
//! user task can pass any garbage value, and the kernel must never trust
//! it is mapped, readable, or writable without checking the active
//! address space's page tables first.

use super::page_table::{AddressSpaceRoot, PageFlags};
use super::vas::AddressSpace;
use super::{VirtualAddress, FRAME_SIZE};
use crate::error::KernelError;

/// Upper bound of user-space addresses (x86_64 canonical lower half).
pub const USER_SPACE_LIMIT: u64 = 0x0000_8000_0000_0000;

pub fn is_user_addr_valid(addr: u64) -> bool {
    addr < USER_SPACE_LIMIT
}

/// Validates that every page covering `[addr, addr + len)` lies below the
/// user/kernel split, is present in `space`'s page tables, and permits the
/// requested access (`need_write` for writes).
pub fn validate_user_range(
    space: &AddressSpace,
    addr: u64,
    len: usize,
    need_write: bool,
) -> Result<(), KernelError> {
    if len == 0 {
        return Ok(());
    }
    let end = addr
        .checked_add(len as u64)
        .ok_or(KernelError::InvalidAddress { addr: addr as usize })?;
    if end > USER_SPACE_LIMIT {
        return Err(KernelError::InvalidAddress { addr: addr as usize });
    }

    let first_page = addr & !(FRAME_SIZE as u64 - 1);
    let mut page = first_page;
    while page < end {
        let flags = space
            .root
            .translate(VirtualAddress::new(page))
            .map(|(_, flags)| flags)
            .ok_or(KernelError::UnmappedMemory { addr: page as usize })?;
        if !flags.contains(PageFlags::USER) {
            return Err(KernelError::PermissionDenied {
                operation: "access kernel-only page from user pointer",
            });
        }
        if need_write && !flags.contains(PageFlags::WRITABLE) {
            return Err(KernelError::PermissionDenied {
                operation: "write to read-only user page",
            });
        }
        page += FRAME_SIZE as u64;
    }
    Ok(())
}

/// Looks up the page-table flags backing a user virtual address in an
/// arbitrary address space root, without needing the full [`AddressSpace`]
/// bookkeeping layer (used by diagnostics and `/proc`-style introspection).
pub fn translate_in(root: &AddressSpaceRoot, addr: u64) -> Option<PageFlags> {
    root.translate(VirtualAddress::new(addr)).map(|(_, f)| f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame_allocator;
    use crate::mm::page_table::AddressSpaceRoot;
    use crate::mm::vas::VmaFlags;

    fn fresh_space() -> AddressSpace {
        crate::mm::test_arena::install();
        frame_allocator::init(crate::mm::test_arena::frame_capacity(), &[]);
        let kernel_root = AddressSpaceRoot::new().unwrap();
        AddressSpace::new(kernel_root.pml4).unwrap()
    }

    #[test]
    fn unmapped_user_range_is_rejected() {
        let space = fresh_space();
        assert!(validate_user_range(&space, 0x5000, 16, false).is_err());
    }

    #[test]
    fn kernel_half_address_is_rejected() {
        let space = fresh_space();
        assert!(!is_user_addr_valid(0xFFFF_8000_0000_0000));
        assert!(validate_user_range(&space, 0xFFFF_8000_0000_0000, 16, false).is_err());
    }

    #[test]
    fn mapped_writable_range_passes_write_check() {
        let mut space = fresh_space();
        let addr = space
            .mmap(None, FRAME_SIZE as u64, VmaFlags::READ | VmaFlags::WRITE, crate::mm::vas::VmaKind::Anonymous)
            .unwrap();
        let frame = frame_allocator::allocate_frame().unwrap();
        space
            .root
            .map(addr, frame, PageFlags::USER | PageFlags::WRITABLE)
            .unwrap();
        assert!(validate_user_range(&space, addr.as_u64(), 64, true).is_ok());
    }
}
