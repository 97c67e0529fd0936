//! CLOCK (second-chance) page replacement.
//!
//! Tracks a fixed-capacity ring of resident user pages across all address
//! spaces. When the frame manager runs low, [`ClockRing::reclaim_one`]
//! walks the ring from its hand: a page whose `ACCESSED` bit is set gets
//! the bit cleared and a second chance; the first page found with the bit
//! already clear is evicted. The ring itself is a fixed-size circular
//! buffer with a write head, the same shape as the kernel log's ring
//! buffer, just holding page records instead of log entries.

use super::frame_allocator::{FrameNumber, PhysicalAddress};
use super::page_table::{AddressSpaceRoot, PageFlags};
use super::VirtualAddress;

const CLOCK_RING_CAPACITY: usize = 4096;

/// One resident page tracked for reclaim: which address space it belongs
/// to (by PML4 physical address), its virtual address, and the frame it's
/// currently backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockEntry {
    pub root: PhysicalAddress,
    pub vaddr: VirtualAddress,
    pub frame: FrameNumber,
}

/// Fixed-capacity circular buffer of [`ClockEntry`] plus the reclaim hand.
pub struct ClockRing {
    entries: [Option<ClockEntry>; CLOCK_RING_CAPACITY],
    /// Index of the next slot a new registration writes to.
    head: usize,
    count: usize,
    /// Index the reclaim scan resumes from; persists across calls so the
    /// hand sweeps the ring exactly once per full pass.
    hand: usize,
}

impl ClockRing {
    pub const fn new() -> Self {
        Self {
            entries: [None; CLOCK_RING_CAPACITY],
            head: 0,
            count: 0,
            hand: 0,
        }
    }

    /// Registers a newly faulted-in page. If the ring is full, the oldest
    /// entry is dropped (it is assumed already paged out or about to be
    /// reclaimed anyway).
    pub fn register(&mut self, entry: ClockEntry) {
        self.entries[self.head] = Some(entry);
        self.head = (self.head + 1) % CLOCK_RING_CAPACITY;
        if self.count < CLOCK_RING_CAPACITY {
            self.count += 1;
        }
    }

    /// Removes a page from tracking without reclaiming it (e.g. `munmap`
    /// unmapped it directly).
    pub fn forget(&mut self, root: PhysicalAddress, vaddr: VirtualAddress) {
        for slot in self.entries.iter_mut() {
            if let Some(e) = slot {
                if e.root.as_u64() == root.as_u64() && e.vaddr.as_u64() == vaddr.as_u64() {
                    *slot = None;
                }
            }
        }
    }

    /// Runs the CLOCK algorithm until a victim is found and evicted from
    /// the tracking ring, or the ring has no trackable entries left.
    /// Returns the evicted entry; the caller is responsible for actually
    /// unmapping it and freeing or paging out the frame.
    pub fn reclaim_one(&mut self) -> Option<ClockEntry> {
        if self.count == 0 {
            return None;
        }
        // One full revolution is always enough: every live entry gets at
        // most one second chance before this loop returns it.
        for _ in 0..(2 * CLOCK_RING_CAPACITY) {
            let idx = self.hand;
            self.hand = (self.hand + 1) % CLOCK_RING_CAPACITY;
            let Some(entry) = self.entries[idx] else {
                continue;
            };
            let root = AddressSpaceRoot { pml4: entry.root };
            let Some((frame, flags)) = root.translate(entry.vaddr) else {
                // Already unmapped by some other path; drop the stale entry.
                self.entries[idx] = None;
                self.count -= 1;
                continue;
            };
            if flags.contains(PageFlags::ACCESSED) {
                let _ = root.set_flags(entry.vaddr, flags & !PageFlags::ACCESSED);
                continue;
            }
            self.entries[idx] = None;
            self.count -= 1;
            return Some(ClockEntry {
                frame,
                ..entry
            });
        }
        None
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for ClockRing {
    fn default() -> Self {
        Self::new()
    }
}

static CLOCK: spin::Mutex<ClockRing> = spin::Mutex::new(ClockRing::new());

pub fn register(entry: ClockEntry) {
    CLOCK.lock().register(entry);
}

pub fn forget(root: PhysicalAddress, vaddr: VirtualAddress) {
    CLOCK.lock().forget(root, vaddr);
}

pub fn reclaim_one() -> Option<ClockEntry> {
    CLOCK.lock().reclaim_one()
}

pub fn tracked_count() -> usize {
    CLOCK.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame_allocator;

    fn setup() -> PhysicalAddress {
        crate::mm::test_arena::install();
        frame_allocator::init(crate::mm::test_arena::frame_capacity(), &[]);
        AddressSpaceRoot::new().unwrap().pml4
    }

    #[test]
    fn accessed_page_gets_second_chance_before_eviction() {
        let root_addr = setup();
        let root = AddressSpaceRoot { pml4: root_addr };
        let frame = frame_allocator::allocate_frame().unwrap();
        let vaddr = VirtualAddress::new(0x1000);
        root.map(vaddr, frame, PageFlags::WRITABLE | PageFlags::ACCESSED)
            .unwrap();

        let mut ring = ClockRing::new();
        ring.register(ClockEntry {
            root: root_addr,
            vaddr,
            frame,
        });

        // The hand clears ACCESSED on its first pass over the only entry,
        // then evicts it on the second pass within the same call.
        let victim = ring.reclaim_one().expect("should evict after second chance");
        assert_eq!(victim.frame, frame);
    }

    #[test]
    fn unaccessed_page_is_evicted_immediately() {
        let root_addr = setup();
        let root = AddressSpaceRoot { pml4: root_addr };
        let frame = frame_allocator::allocate_frame().unwrap();
        let vaddr = VirtualAddress::new(0x2000);
        root.map(vaddr, frame, PageFlags::WRITABLE).unwrap();

        let mut ring = ClockRing::new();
        ring.register(ClockEntry {
            root: root_addr,
            vaddr,
            frame,
        });

        let victim = ring.reclaim_one().expect("should evict the only tracked page");
        assert_eq!(victim.frame, frame);
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn forget_removes_entry_without_eviction() {
        let root_addr = setup();
        let root = AddressSpaceRoot { pml4: root_addr };
        let frame = frame_allocator::allocate_frame().unwrap();
        let vaddr = VirtualAddress::new(0x3000);
        root.map(vaddr, frame, PageFlags::WRITABLE).unwrap();

        let mut ring = ClockRing::new();
        ring.register(ClockEntry {
            root: root_addr,
            vaddr,
            frame,
        });
        ring.forget(root_addr, vaddr);
        assert_eq!(ring.len(), 0);
        assert!(ring.reclaim_one().is_none());
    }
}
