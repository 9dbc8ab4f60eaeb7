//! Virtual heap: a reserved kernel VA window backed on demand.
//!
//! The window is `[base, base + size)`. Pages in `[base, commit)` are mapped
//! to real frames; the rest is reserved but unmapped. `commit` grows the
//! mapped prefix eagerly; `map_one` retrofits a single page and exists for
//! the page-fault recovery path, the kernel's only demand-paging mechanism.
//! Committed pages are never released.

use meson_core::addr::VirtAddr;
use meson_core::sync::SpinLock;

use super::{PAGE_SIZE, align_up};

/// Base of the kernel vheap window.
pub const VHEAP_BASE: u64 = 0xFFFF_9000_0000_0000;

/// Size of the kernel vheap window: 16 GiB.
pub const VHEAP_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// Errors from vheap operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VheapError {
    /// The window has not been initialized.
    Uninitialized,
    /// The address lies outside the reserved window.
    OutOfWindow,
    /// The backing could not produce or map a frame.
    OutOfMemory,
}

/// Supplies frames and installs mappings for the vheap.
///
/// The kernel backing allocates from palloc and maps through the vmm; tests
/// substitute a recorder.
pub trait VheapBacking {
    /// Backs the page at `va` with a fresh writable frame.
    fn map_new_page(&mut self, va: VirtAddr) -> Result<(), VheapError>;
}

/// The window bookkeeping: growth-only, guarded by one lock at the global.
pub struct Vheap {
    base: u64,
    size: u64,
    commit: u64,
}

impl Vheap {
    /// Creates an uninitialized window.
    pub const fn empty() -> Self {
        Self {
            base: 0,
            size: 0,
            commit: 0,
        }
    }

    /// Reserves the window `[base, base + size)`. Both are page-rounded
    /// (base up, size down). No memory is mapped yet.
    pub fn init(&mut self, base: u64, size: u64) {
        self.base = align_up(base, PAGE_SIZE as u64);
        self.size = size & !(PAGE_SIZE as u64 - 1);
        self.commit = self.base;
    }

    /// Returns `(base, size)` of the reserved window.
    pub fn bounds(&self) -> (VirtAddr, u64) {
        (VirtAddr::new_truncate(self.base), self.size)
    }

    /// Returns `true` when `va` falls inside the reserved window.
    pub fn contains(&self, va: VirtAddr) -> bool {
        self.base != 0 && va.as_u64() >= self.base && va.as_u64() < self.base + self.size
    }

    /// Commits `bytes` (rounded up to pages) at the cursor, backing every
    /// page, and returns the starting VA of the new span.
    ///
    /// On failure the cursor does not advance; pages mapped before the
    /// failing one stay mapped (they are ahead of the cursor and will be
    /// reused by the next successful commit).
    pub fn commit(
        &mut self,
        bytes: u64,
        backing: &mut dyn VheapBacking,
    ) -> Result<VirtAddr, VheapError> {
        if self.base == 0 {
            return Err(VheapError::Uninitialized);
        }
        let bytes = align_up(bytes, PAGE_SIZE as u64);
        if bytes == 0 || self.commit + bytes > self.base + self.size {
            return Err(VheapError::OutOfMemory);
        }

        let va = self.commit;
        let mut off = 0;
        while off < bytes {
            backing.map_new_page(VirtAddr::new_truncate(va + off))?;
            off += PAGE_SIZE as u64;
        }
        self.commit += bytes;
        Ok(VirtAddr::new_truncate(va))
    }

    /// Backs the single page containing `va` if it lies inside the window.
    ///
    /// The page-fault recovery path calls this for non-present faults so the
    /// faulting instruction can be retried.
    pub fn map_one(&self, va: VirtAddr, backing: &mut dyn VheapBacking) -> Result<(), VheapError> {
        if self.base == 0 {
            return Err(VheapError::Uninitialized);
        }
        if !self.contains(va) {
            return Err(VheapError::OutOfWindow);
        }
        backing.map_new_page(va.align_down(PAGE_SIZE as u64))
    }
}

// ---------------------------------------------------------------------------
// Global window and kernel backing
// ---------------------------------------------------------------------------

/// The kernel vheap window.
pub static VHEAP: SpinLock<Vheap> = SpinLock::new(Vheap::empty());

/// Backing that takes frames from palloc and maps them through the vmm.
#[cfg(target_os = "none")]
pub struct KernelBacking;

#[cfg(target_os = "none")]
impl VheapBacking for KernelBacking {
    fn map_new_page(&mut self, va: VirtAddr) -> Result<(), VheapError> {
        use meson_core::arch::x86_64::structures::paging::PageTableFlags;

        let page = super::palloc::PALLOC
            .alloc_frame()
            .ok_or(VheapError::OutOfMemory)?;
        let phys = super::vmm::hhdm_to_phys(page);
        super::vmm::map_page(va, phys, PageTableFlags::WRITABLE)
            .map_err(|_| VheapError::OutOfMemory)
    }
}

/// Reserves the global window. Called once during heap bring-up.
#[cfg(target_os = "none")]
pub fn init() {
    VHEAP.lock().init(VHEAP_BASE, VHEAP_SIZE);
    crate::kinfo!(
        "vheap: reserved {:#x}..{:#x} ({} GiB)",
        VHEAP_BASE,
        VHEAP_BASE + VHEAP_SIZE,
        VHEAP_SIZE >> 30
    );
}

/// Commits `bytes` from the global window. Returns `None` when the window
/// or physical memory is exhausted.
#[cfg(target_os = "none")]
pub fn commit(bytes: u64) -> Option<VirtAddr> {
    VHEAP.lock().commit(bytes, &mut KernelBacking).ok()
}

/// Returns `(base, size)` of the global window.
#[cfg(target_os = "none")]
pub fn bounds() -> (VirtAddr, u64) {
    VHEAP.lock().bounds()
}

/// Attempts demand-page recovery for `va`. Returns `true` when the page was
/// mapped and the faulting access can be retried.
#[cfg(target_os = "none")]
pub fn map_one(va: VirtAddr) -> bool {
    let Some(vheap) = VHEAP.try_lock() else {
        // Faulted while the window lock was held; the fault is genuine.
        return false;
    };
    vheap.map_one(va, &mut KernelBacking).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records mapped pages instead of touching hardware.
    struct Recorder {
        mapped: Vec<u64>,
        fail_after: Option<usize>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                mapped: Vec::new(),
                fail_after: None,
            }
        }
    }

    impl VheapBacking for Recorder {
        fn map_new_page(&mut self, va: VirtAddr) -> Result<(), VheapError> {
            if let Some(n) = self.fail_after {
                if self.mapped.len() >= n {
                    return Err(VheapError::OutOfMemory);
                }
            }
            self.mapped.push(va.as_u64());
            Ok(())
        }
    }

    const BASE: u64 = 0xFFFF_9000_0000_0000;

    fn window(pages: u64) -> Vheap {
        let mut v = Vheap::empty();
        v.init(BASE, pages * PAGE_SIZE as u64);
        v
    }

    #[test]
    fn commit_advances_cursor_and_maps_each_page() {
        let mut v = window(16);
        let mut rec = Recorder::new();

        let a = v.commit(PAGE_SIZE as u64 * 2, &mut rec).unwrap();
        assert_eq!(a.as_u64(), BASE);
        let b = v.commit(1, &mut rec).unwrap(); // rounds up to one page
        assert_eq!(b.as_u64(), BASE + 2 * PAGE_SIZE as u64);

        assert_eq!(
            rec.mapped,
            vec![
                BASE,
                BASE + PAGE_SIZE as u64,
                BASE + 2 * PAGE_SIZE as u64
            ]
        );
    }

    #[test]
    fn commit_beyond_window_fails() {
        let mut v = window(2);
        let mut rec = Recorder::new();
        assert!(v.commit(PAGE_SIZE as u64 * 2, &mut rec).is_ok());
        assert_eq!(
            v.commit(PAGE_SIZE as u64, &mut rec),
            Err(VheapError::OutOfMemory)
        );
    }

    #[test]
    fn zero_bytes_is_an_error() {
        let mut v = window(2);
        let mut rec = Recorder::new();
        assert_eq!(v.commit(0, &mut rec), Err(VheapError::OutOfMemory));
    }

    #[test]
    fn failed_commit_leaves_cursor() {
        let mut v = window(16);
        let mut rec = Recorder::new();
        rec.fail_after = Some(1);
        assert_eq!(
            v.commit(PAGE_SIZE as u64 * 4, &mut rec),
            Err(VheapError::OutOfMemory)
        );
        // Cursor unchanged: the next successful commit starts at base again.
        rec.fail_after = None;
        assert_eq!(v.commit(PAGE_SIZE as u64, &mut rec).unwrap().as_u64(), BASE);
    }

    #[test]
    fn map_one_bounds_checked() {
        let v = window(4);
        let mut rec = Recorder::new();

        let inside = VirtAddr::new_truncate(BASE + 0x1234);
        assert!(v.map_one(inside, &mut rec).is_ok());
        // Page-aligned base of the faulting address gets mapped.
        assert_eq!(rec.mapped, vec![BASE + 0x1000]);

        let outside = VirtAddr::new_truncate(BASE - 0x1000);
        assert_eq!(v.map_one(outside, &mut rec), Err(VheapError::OutOfWindow));
        let past = VirtAddr::new_truncate(BASE + 4 * PAGE_SIZE as u64);
        assert_eq!(v.map_one(past, &mut rec), Err(VheapError::OutOfWindow));
    }

    #[test]
    fn uninitialized_rejects_everything() {
        let v = Vheap::empty();
        let mut rec = Recorder::new();
        assert_eq!(
            v.map_one(VirtAddr::new_truncate(BASE), &mut rec),
            Err(VheapError::Uninitialized)
        );
        assert!(!v.contains(VirtAddr::new_truncate(BASE)));
    }

    #[test]
    fn bounds_reports_window() {
        let v = window(8);
        let (base, size) = v.bounds();
        assert_eq!(base.as_u64(), BASE);
        assert_eq!(size, 8 * PAGE_SIZE as u64);
    }
}
