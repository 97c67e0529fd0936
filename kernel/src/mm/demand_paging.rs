//! File-backed demand paging: populating a freshly allocated frame from a
//! block device for the `VmaKind::File` case in [`super::page_fault`].
//!
//! Anonymous pages are zero-filled directly in `page_fault`; this module
//! exists for the one case that needs an actual I/O round trip.

extern crate alloc;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::fs::blockdev::BlockDevice;

use super::frame_allocator::FrameNumber;
use super::{phys_to_virt_addr, FRAME_SIZE};

/// Block devices available as VMA backing, keyed by the small id a
/// `VmaKind::File` carries (not a pointer, so the enum stays `Copy`).
static DEVICES: Mutex<BTreeMap<u32, Arc<dyn BlockDevice>>> = Mutex::new(BTreeMap::new());

/// Makes `device` available as a file-backing target for `mmap`, returning
/// the id to put in `VmaKind::File`. Distinct from the VFS's own mount
/// table: a VMA reads a flat device byte range directly, with no
/// filesystem (path, cluster chain) indirection in between.
pub fn register_device(id: u32, device: Arc<dyn BlockDevice>) {
    DEVICES.lock().insert(id, device);
}

pub fn unregister_device(id: u32) {
    DEVICES.lock().remove(&id);
}

fn lookup_device(id: u32) -> Option<Arc<dyn BlockDevice>> {
    DEVICES.lock().get(&id).cloned()
}

/// Reads the `FRAME_SIZE` bytes starting at `file_offset` from `device`
/// into `frame`, which must already be exclusively owned by the caller
/// (freshly allocated, not yet mapped into any page table).
///
/// `file_offset` need not be sector-aligned: the read is expanded to whole
/// sectors and the requested window copied out of a scratch buffer.
pub fn populate_file_page(
    frame: FrameNumber,
    device: &dyn BlockDevice,
    file_offset: u64,
) -> KernelResult<()> {
    let sector_size = device.sector_size() as u64;
    if sector_size == 0 || !sector_size.is_power_of_two() {
        return Err(KernelError::InvalidArgument {
            name: "sector_size",
            value: "not a power of two",
        });
    }

    let start_sector = file_offset / sector_size;
    let sector_offset = (file_offset % sector_size) as usize;
    let sectors_needed = (sector_offset + FRAME_SIZE).div_ceil(sector_size as usize);

    let dest = phys_to_virt_addr(frame.address().as_u64()) as *mut u8;
    // SAFETY: `frame` is exclusively owned by the caller and backed by a
    // full `FRAME_SIZE` region through the physical-memory window.
    let dest_slice = unsafe { core::slice::from_raw_parts_mut(dest, FRAME_SIZE) };

    if sector_offset == 0 && sectors_needed * sector_size as usize == FRAME_SIZE {
        device.read_sectors(start_sector, dest_slice)?;
        return Ok(());
    }

    // Unaligned or short read: stage through a scratch buffer sized to the
    // whole sectors actually touched, then copy the requested window out.
    let scratch_len = sectors_needed * sector_size as usize;
    let mut scratch = alloc::vec![0u8; scratch_len];
    device.read_sectors(start_sector, &mut scratch)?;
    let copy_len = FRAME_SIZE.min(scratch_len - sector_offset);
    dest_slice[..copy_len].copy_from_slice(&scratch[sector_offset..sector_offset + copy_len]);
    if copy_len < FRAME_SIZE {
        dest_slice[copy_len..].fill(0);
    }
    Ok(())
}

/// Looks up `device_id` and reads the page at `file_offset` into `frame`.
/// Returns `Err` if no device is registered under that id -- the caller
/// (`page_fault::try_demand_page`) treats that as an unresolvable fault
/// rather than silently zero-filling, since a dangling device id means
/// the VMA's backing went away out from under it.
pub fn populate_vma_page(device_id: u32, file_offset: u64, frame: FrameNumber) -> KernelResult<()> {
    let device = lookup_device(device_id).ok_or(KernelError::NotFound {
        resource: "block device",
        id: u64::from(device_id),
    })?;
    populate_file_page(frame, &*device, file_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::blockdev::RamBlockDevice;
    use crate::mm::frame_allocator;

    fn fresh_frame() -> FrameNumber {
        crate::mm::test_arena::install();
        frame_allocator::init(crate::mm::test_arena::frame_capacity(), &[]);
        frame_allocator::allocate_frame().unwrap()
    }

    #[test]
    fn aligned_read_fills_whole_frame() {
        let frame = fresh_frame();
        let mut dev = RamBlockDevice::new(alloc::string::String::from("disk"), 512, 64);
        let mut pattern = alloc::vec![0u8; FRAME_SIZE];
        for (i, b) in pattern.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        dev.write_sectors(0, &pattern).unwrap();

        populate_file_page(frame, &dev, 0).unwrap();
        let virt = phys_to_virt_addr(frame.address().as_u64()) as *const u8;
        let read_back = unsafe { core::slice::from_raw_parts(virt, FRAME_SIZE) };
        assert_eq!(read_back, pattern.as_slice());
    }

    #[test]
    fn unaligned_offset_reads_correct_window() {
        let frame = fresh_frame();
        let mut dev = RamBlockDevice::new(alloc::string::String::from("disk"), 512, 64);
        let mut pattern = alloc::vec![0u8; 512 * 16];
        for (i, b) in pattern.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        dev.write_sectors(0, &pattern).unwrap();

        let file_offset = 200u64;
        populate_file_page(frame, &dev, file_offset).unwrap();
        let virt = phys_to_virt_addr(frame.address().as_u64()) as *const u8;
        let read_back = unsafe { core::slice::from_raw_parts(virt, FRAME_SIZE) };
        let expected = &pattern[file_offset as usize..file_offset as usize + FRAME_SIZE];
        assert_eq!(read_back, expected);
    }

    #[test]
    fn populate_vma_page_reads_through_registered_device() {
        let frame = fresh_frame();
        let mut dev = RamBlockDevice::new(alloc::string::String::from("disk"), 512, 64);
        let pattern = alloc::vec![0x5au8; FRAME_SIZE];
        dev.write_sectors(0, &pattern).unwrap();
        register_device(7, Arc::new(dev));

        populate_vma_page(7, 0, frame).unwrap();
        let virt = phys_to_virt_addr(frame.address().as_u64()) as *const u8;
        let read_back = unsafe { core::slice::from_raw_parts(virt, FRAME_SIZE) };
        assert_eq!(read_back, pattern.as_slice());

        unregister_device(7);
        assert!(populate_vma_page(7, 0, frame).is_err());
    }
}
