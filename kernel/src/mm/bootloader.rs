//! Bridges `bootloader_api`'s memory map into the frame manager's own
//! [`ReservedRegion`] vocabulary.
//!
//! The bootloader hands us a flat list of physical memory regions tagged
//! `Usable`, `Bootloader` (kernel image, boot info, page tables it built),
//! or various firmware-reserved kinds. We fold the non-usable kinds into
//! reserved ranges and treat the highest usable address as the frame
//! manager's total frame count, matching how the frame manager itself
//! expects a dense `[0, total_frames)` index space with holes punched out
//! by `reserved`.

extern crate alloc;

use alloc::vec::Vec;

use bootloader_api::info::{MemoryRegion, MemoryRegionKind};
use bootloader_api::BootInfo;

use super::frame_allocator::ReservedRegion;
use super::{PhysicalAddress, FRAME_SIZE};
use crate::error::KernelResult;

/// Builds the reserved-region list and total frame count the frame
/// manager needs from a raw `bootloader_api` memory map.
fn reserved_regions_and_frame_count(regions: &[MemoryRegion]) -> (Vec<ReservedRegion>, usize) {
    let mut reserved = Vec::new();
    let mut max_frame = 0usize;

    for region in regions.iter() {
        let end_frame = (region.end / FRAME_SIZE as u64) as usize;
        match region.kind {
            MemoryRegionKind::Usable => {
                max_frame = max_frame.max(end_frame);
            }
            _ => {
                reserved.push(ReservedRegion {
                    start: PhysicalAddress(region.start & !(FRAME_SIZE as u64 - 1)),
                    end: PhysicalAddress(region.end.div_ceil(FRAME_SIZE as u64) * FRAME_SIZE as u64),
                });
            }
        }
    }

    // The first megabyte carries the real-mode IVT, BDA, and (on BIOS
    // boots) video memory; the bootloader sometimes reports it `Usable`
    // even though nothing should ever hand those frames out.
    reserved.push(ReservedRegion {
        start: PhysicalAddress(0),
        end: PhysicalAddress(0x10_0000),
    });

    (reserved, max_frame)
}

/// Initializes the memory subsystem from the `BootInfo` the bootloader
/// passes to the kernel entry point. Must run before any other subsystem
/// that allocates memory.
pub fn init_from_boot_info(boot_info: &'static mut BootInfo) -> KernelResult<()> {
    let phys_mem_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("bootloader must be configured to map all physical memory");

    let (reserved, total_frames) = reserved_regions_and_frame_count(&boot_info.memory_regions[..]);

    println!(
        "[BOOT] {} MiB addressable, {} reserved region(s), phys_mem_offset=0x{:x}",
        total_frames * FRAME_SIZE / (1024 * 1024),
        reserved.len(),
        phys_mem_offset
    );

    super::init(total_frames, &reserved, phys_mem_offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: u64, end: u64, kind: MemoryRegionKind) -> MemoryRegion {
        MemoryRegion { start, end, kind }
    }

    #[test]
    fn usable_region_sets_total_frame_count() {
        let regions = [
            region(0, 0x10_0000, MemoryRegionKind::Bootloader),
            region(0x10_0000, 0x400_0000, MemoryRegionKind::Usable),
        ];
        let (_reserved, total_frames) = reserved_regions_and_frame_count(&regions);
        assert_eq!(total_frames, (0x400_0000u64 / FRAME_SIZE as u64) as usize);
    }

    #[test]
    fn non_usable_region_is_reserved() {
        let regions = [
            region(0x10_0000, 0x20_0000, MemoryRegionKind::Bootloader),
            region(0x20_0000, 0x400_0000, MemoryRegionKind::Usable),
        ];
        let (reserved, _total_frames) = reserved_regions_and_frame_count(&regions);
        assert!(reserved
            .iter()
            .any(|r| r.start.as_u64() == 0x10_0000 && r.end.as_u64() == 0x20_0000));
    }
}
