//! Physical frame allocator.
//!
//! Frames come from two places: an intrusive LIFO free list threaded through
//! the first pointer-sized word of each freed frame, and a set of lazily
//! consumed ranges cut from the usable boot memory map (each tracked as
//! {start, end, cursor}; no per-page touching at init). Every handout is
//! translated through the HHDM, so callers receive a virtual pointer they
//! may dereference immediately.
//!
//! A frame is always in exactly one of three states: not yet handed out
//! (inside `[cursor, end)` of some range), on the free list, or owned by a
//! caller.

use meson_core::addr::VirtAddr;
use meson_core::sync::SpinLock;

use super::{PAGE_MASK, PAGE_SIZE, PhysMemoryRegion, align_down, align_up};

/// Maximum usable ranges tracked. Excess ranges are dropped at init (boot
/// keeps working with less memory under management).
const MAX_RANGES: usize = 128;

#[derive(Debug, Clone, Copy)]
struct FrameRange {
    /// Inclusive physical start, page-aligned.
    start: u64,
    /// Exclusive physical end, page-aligned.
    end: u64,
    /// Next physical address to hand out.
    cursor: u64,
}

const EMPTY_RANGE: FrameRange = FrameRange {
    start: 0,
    end: 0,
    cursor: 0,
};

struct PallocInner {
    ranges: [FrameRange; MAX_RANGES],
    range_count: usize,
    /// Index of the range the cursor path is currently draining.
    range_curr: usize,
    /// Head of the free list: HHDM virtual address of a free frame whose
    /// first word holds the next link. Zero when empty.
    free_head: u64,
    hhdm_offset: u64,
    total_pages: usize,
    free_pages: usize,
    used_pages: usize,
}

// SAFETY: The raw free-list pointers are only dereferenced under the lock.
unsafe impl Send for PallocInner {}

/// The frame allocator. One spinlock guards all state; lock-free observers
/// of the counters may race, the locked path is authoritative.
pub struct FrameAllocator {
    inner: SpinLock<PallocInner>,
}

impl FrameAllocator {
    /// Creates an empty allocator managing no memory.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(PallocInner {
                ranges: [EMPTY_RANGE; MAX_RANGES],
                range_count: 0,
                range_curr: 0,
                free_head: 0,
                hhdm_offset: 0,
                total_pages: 0,
                free_pages: 0,
                used_pages: 0,
            }),
        }
    }

    /// Initializes the allocator from the boot memory map.
    ///
    /// # Safety
    ///
    /// - `hhdm_offset` must be the live HHDM offset.
    /// - `regions` must describe physical memory truthfully; usable regions
    ///   must not overlap anything the kernel already owns.
    /// - Must be called exactly once, before any allocation.
    pub unsafe fn init(&self, regions: &[PhysMemoryRegion], hhdm_offset: u64) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.total_pages, 0, "palloc double init");
        inner.hhdm_offset = hhdm_offset;

        for region in regions.iter().filter(|r| r.usable) {
            let start = align_up(region.start.as_u64(), PAGE_SIZE as u64);
            let end = align_down(region.start.as_u64() + region.size, PAGE_SIZE as u64);
            if end <= start {
                continue;
            }
            let pages = ((end - start) / PAGE_SIZE as u64) as usize;
            inner.total_pages += pages;
            if inner.range_count < MAX_RANGES {
                let idx = inner.range_count;
                inner.ranges[idx] = FrameRange {
                    start,
                    end,
                    cursor: start,
                };
                inner.range_count += 1;
            }
        }
        // Everything starts free, either as untouched range space or (later)
        // as free-list entries.
        inner.free_pages = inner.total_pages;
    }

    /// Allocates one 4 KiB frame, returning its HHDM virtual address.
    ///
    /// Freed frames are reused first; otherwise the current range's cursor
    /// is bumped, moving to the next range when one drains. Returns `None`
    /// only when the free list is empty and every range is exhausted.
    pub fn alloc_frame(&self) -> Option<VirtAddr> {
        let mut inner = self.inner.lock();

        if inner.free_head != 0 {
            let page = inner.free_head;
            // SAFETY: Free-listed frames stay mapped through the HHDM and
            // their first word is the next link, written by free_frame.
            inner.free_head = unsafe { (page as *const u64).read() };
            inner.free_pages = inner.free_pages.saturating_sub(1);
            inner.used_pages += 1;
            return Some(VirtAddr::new_truncate(page));
        }

        while inner.range_curr < inner.range_count {
            let idx = inner.range_curr;
            let FrameRange { end, cursor, .. } = inner.ranges[idx];
            if cursor < end {
                inner.ranges[idx].cursor = cursor + PAGE_SIZE as u64;
                inner.free_pages = inner.free_pages.saturating_sub(1);
                inner.used_pages += 1;
                return Some(VirtAddr::new_truncate(cursor + inner.hhdm_offset));
            }
            inner.range_curr += 1;
        }

        None
    }

    /// Allocates one frame and zeroes it.
    pub fn alloc_zero_frame(&self) -> Option<VirtAddr> {
        let page = self.alloc_frame()?;
        // SAFETY: The frame was just handed out and is writable via the HHDM.
        unsafe { core::ptr::write_bytes(page.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
        Some(page)
    }

    /// Returns a frame to the free list.
    ///
    /// Unaligned pointers are ignored. Double frees are not detected.
    pub fn free_frame(&self, page: VirtAddr) {
        if page.as_u64() & PAGE_MASK != 0 {
            return;
        }
        let mut inner = self.inner.lock();
        // SAFETY: The caller returns a frame it owns; we repurpose its first
        // word as the free-list link.
        unsafe { (page.as_u64() as *mut u64).write(inner.free_head) };
        inner.free_head = page.as_u64();
        inner.free_pages += 1;
        inner.used_pages = inner.used_pages.saturating_sub(1);
    }

    /// Diagnostic: reports whether `page` is currently handed out.
    ///
    /// Walks the free list, so O(free frames). Pages outside the managed
    /// ranges are reported as allocated unless found on the free list.
    pub fn is_page_allocated(&self, page: VirtAddr) -> bool {
        let inner = self.inner.lock();
        let phys = page.as_u64().wrapping_sub(inner.hhdm_offset);

        let on_free_list = |head: u64| -> bool {
            let mut it = head;
            while it != 0 {
                if it == page.as_u64() {
                    return true;
                }
                // SAFETY: Free-list links are valid HHDM pointers.
                it = unsafe { (it as *const u64).read() };
            }
            false
        };

        for range in &inner.ranges[..inner.range_count] {
            if phys >= range.start && phys < range.end {
                if phys >= range.cursor {
                    return false; // never handed out
                }
                return !on_free_list(inner.free_head);
            }
        }
        !on_free_list(inner.free_head)
    }

    /// Number of free frames (range remainder plus free list).
    pub fn free_count(&self) -> usize {
        self.inner.lock().free_pages
    }

    /// Total frames under management.
    pub fn total_count(&self) -> usize {
        self.inner.lock().total_pages
    }

    /// Frames currently handed out.
    pub fn used_count(&self) -> usize {
        self.inner.lock().used_pages
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Global allocator instance
// ---------------------------------------------------------------------------

/// The kernel's frame allocator.
pub static PALLOC: FrameAllocator = FrameAllocator::new();

/// Initializes the global allocator from the boot memory map.
///
/// # Safety
///
/// See [`FrameAllocator::init`].
pub unsafe fn init(regions: &[PhysMemoryRegion], hhdm_offset: u64) {
    // SAFETY: Forwarded to the caller.
    unsafe { PALLOC.init(regions, hhdm_offset) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use meson_core::addr::PhysAddr;
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    /// Fake physical memory: one aligned buffer; physical addresses start at
    /// zero, the HHDM offset is the buffer's address.
    struct FakeRam {
        buf: *mut u8,
        bytes: usize,
    }

    impl FakeRam {
        fn pages(n: usize) -> Self {
            let bytes = n * PAGE_SIZE;
            let layout = Layout::from_size_align(bytes, PAGE_SIZE).unwrap();
            let buf = unsafe { alloc_zeroed(layout) };
            assert!(!buf.is_null());
            Self { buf, bytes }
        }

        fn regions(&self) -> [PhysMemoryRegion; 1] {
            [PhysMemoryRegion {
                start: PhysAddr::new(0),
                size: self.bytes as u64,
                usable: true,
            }]
        }

        fn hhdm(&self) -> u64 {
            self.buf as u64
        }
    }

    impl Drop for FakeRam {
        fn drop(&mut self) {
            let layout = Layout::from_size_align(self.bytes, PAGE_SIZE).unwrap();
            unsafe { dealloc(self.buf, layout) };
        }
    }

    #[test]
    fn drains_every_frame_exactly_once() {
        let ram = FakeRam::pages(256);
        let palloc = FrameAllocator::new();
        unsafe { palloc.init(&ram.regions(), ram.hhdm()) };
        assert_eq!(palloc.total_count(), 256);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            let page = palloc.alloc_frame().expect("frame available");
            assert_eq!(page.as_u64() & PAGE_MASK, 0);
            assert!(seen.insert(page.as_u64()), "duplicate frame handed out");
        }
        assert_eq!(palloc.free_count(), 0);
        assert_eq!(palloc.used_count(), 256);
        assert!(palloc.alloc_frame().is_none());
    }

    #[test]
    fn freed_frames_come_back_lifo() {
        let ram = FakeRam::pages(256);
        let palloc = FrameAllocator::new();
        unsafe { palloc.init(&ram.regions(), ram.hhdm()) };

        let pages: Vec<_> = (0..256).map(|_| palloc.alloc_frame().unwrap()).collect();
        assert_eq!(palloc.free_count(), 0);

        for &page in pages.iter().rev() {
            palloc.free_frame(page);
        }
        assert_eq!(palloc.free_count(), 256);

        // LIFO: the last-freed frame (pages[0]) comes out first, then the
        // rest in the reverse order of their frees.
        for &expected in &pages {
            assert_eq!(palloc.alloc_frame(), Some(expected));
        }
        assert_eq!(palloc.free_count(), 0);
    }

    #[test]
    fn zero_frame_is_zeroed() {
        let ram = FakeRam::pages(4);
        let palloc = FrameAllocator::new();
        unsafe { palloc.init(&ram.regions(), ram.hhdm()) };

        // Dirty a frame, free it, then demand a zeroed one.
        let page = palloc.alloc_frame().unwrap();
        unsafe { core::ptr::write_bytes(page.as_mut_ptr::<u8>(), 0xAB, PAGE_SIZE) };
        palloc.free_frame(page);

        let page = palloc.alloc_zero_frame().unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(page.as_ptr::<u8>(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn unaligned_free_is_ignored() {
        let ram = FakeRam::pages(4);
        let palloc = FrameAllocator::new();
        unsafe { palloc.init(&ram.regions(), ram.hhdm()) };
        let before = palloc.free_count();
        palloc.free_frame(VirtAddr::new_truncate(ram.hhdm() + 123));
        assert_eq!(palloc.free_count(), before);
    }

    #[test]
    fn unusable_regions_not_managed() {
        let ram = FakeRam::pages(8);
        let palloc = FrameAllocator::new();
        let regions = [
            PhysMemoryRegion {
                start: PhysAddr::new(0),
                size: (4 * PAGE_SIZE) as u64,
                usable: true,
            },
            PhysMemoryRegion {
                start: PhysAddr::new((4 * PAGE_SIZE) as u64),
                size: (4 * PAGE_SIZE) as u64,
                usable: false,
            },
        ];
        unsafe { palloc.init(&regions, ram.hhdm()) };
        assert_eq!(palloc.total_count(), 4);
    }

    #[test]
    fn allocation_state_query() {
        let ram = FakeRam::pages(4);
        let palloc = FrameAllocator::new();
        unsafe { palloc.init(&ram.regions(), ram.hhdm()) };

        let page = palloc.alloc_frame().unwrap();
        assert!(palloc.is_page_allocated(page));
        palloc.free_frame(page);
        assert!(!palloc.is_page_allocated(page));

        // A frame past the cursor was never handed out.
        let untouched = VirtAddr::new_truncate(ram.hhdm() + 3 * PAGE_SIZE as u64);
        assert!(!palloc.is_page_allocated(untouched));
    }

    #[test]
    fn counts_quiesce() {
        let ram = FakeRam::pages(16);
        let palloc = FrameAllocator::new();
        unsafe { palloc.init(&ram.regions(), ram.hhdm()) };
        let initial_free = palloc.free_count();

        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(palloc.alloc_frame().unwrap());
        }
        for page in held.drain(..) {
            palloc.free_frame(page);
        }
        assert_eq!(palloc.free_count(), initial_free);
        assert_eq!(palloc.used_count(), 0);
    }
}
