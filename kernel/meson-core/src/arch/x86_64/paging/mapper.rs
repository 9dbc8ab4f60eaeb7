//! 4-level page-table walker operating through the HHDM.
//!
//! All table memory is reached as `hhdm_offset + phys`, so the walker is
//! plain pointer arithmetic with no privileged instructions: the kernel
//! hands it the live PML4, tests hand it host buffers with a zero offset.
//! TLB invalidation stays with the caller.

use crate::addr::{PhysAddr, VirtAddr};
use crate::arch::x86_64::structures::paging::{PageTable, PageTableEntry, PageTableFlags};

/// Bytes in a 4 KiB page.
const PAGE_SIZE: usize = 4096;

/// Errors from mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The frame source ran dry while allocating an intermediate table.
    ///
    /// Tables installed before the failure stay in place; they are valid
    /// empty tables that later mappings reuse.
    OutOfFrames,
}

/// Result of translating a virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateResult {
    /// Mapped through a 4 KiB leaf.
    Page4KiB {
        /// Physical base of the frame.
        frame: PhysAddr,
        /// Leaf entry flags.
        flags: PageTableFlags,
    },
    /// Mapped through a 2 MiB or 1 GiB huge entry.
    HugePage {
        /// Physical base of the huge page.
        phys_start: PhysAddr,
        /// Huge entry flags.
        flags: PageTableFlags,
    },
    /// Not mapped.
    NotMapped,
}

/// Walks and builds page tables via the HHDM.
pub struct PageTableMapper {
    hhdm_offset: u64,
}

impl PageTableMapper {
    /// Creates a mapper translating physical table addresses through
    /// `hhdm_offset`.
    pub const fn new(hhdm_offset: u64) -> Self {
        Self { hhdm_offset }
    }

    fn table_ptr(&self, phys: PhysAddr) -> *mut PageTable {
        (self.hhdm_offset + phys.as_u64()) as *mut PageTable
    }

    /// Returns the table at `phys`.
    ///
    /// # Safety
    ///
    /// `phys` must be a 4 KiB-aligned frame holding a page table reachable
    /// through the HHDM.
    unsafe fn table_at(&self, phys: PhysAddr) -> &mut PageTable {
        // SAFETY: Forwarded to the caller.
        unsafe { &mut *self.table_ptr(phys) }
    }

    /// Returns the physical table behind `table[index]`, allocating, zeroing
    /// and installing a fresh frame when the entry is not present.
    ///
    /// # Safety
    ///
    /// `table_phys` must be a valid table and `alloc` must return unused
    /// frames reachable through the HHDM.
    unsafe fn ensure_table(
        &self,
        table_phys: PhysAddr,
        index: usize,
        alloc: &mut dyn FnMut() -> Option<PhysAddr>,
    ) -> Result<PhysAddr, MapError> {
        // SAFETY: Caller guarantees table_phys validity.
        let table = unsafe { self.table_at(table_phys) };
        let entry = table.entries[index];
        if entry.is_present() {
            return Ok(entry.address());
        }

        let frame = alloc().ok_or(MapError::OutOfFrames)?;
        // SAFETY: The frame is fresh and HHDM-reachable; zeroing it prevents
        // stale bytes being decoded as present entries.
        unsafe {
            core::ptr::write_bytes(self.table_ptr(frame).cast::<u8>(), 0, PAGE_SIZE);
        }
        table.entries[index] =
            PageTableEntry::new(frame, PageTableFlags::PRESENT | PageTableFlags::WRITABLE);
        Ok(frame)
    }

    /// Maps the 4 KiB page at `va` to `pa`, creating intermediate tables as
    /// needed. The leaf is written with `flags | PRESENT`; an existing leaf
    /// is overwritten (equal flags make the second call a no-op).
    ///
    /// # Safety
    ///
    /// - `root` must be the physical address of a valid top-level table.
    /// - `alloc` must return unused, HHDM-reachable frames.
    /// - Callers sharing a VA must serialize; the walker is re-entrant only
    ///   across disjoint VAs.
    pub unsafe fn map_4k(
        &self,
        root: PhysAddr,
        va: VirtAddr,
        pa: PhysAddr,
        flags: PageTableFlags,
        alloc: &mut dyn FnMut() -> Option<PhysAddr>,
    ) -> Result<(), MapError> {
        // SAFETY: Caller contract covers every level of the walk.
        unsafe {
            let pdpt = self.ensure_table(root, va.pml4_index(), alloc)?;
            let pd = self.ensure_table(pdpt, va.pdpt_index(), alloc)?;
            let pt = self.ensure_table(pd, va.pd_index(), alloc)?;
            self.table_at(pt).entries[va.pt_index()] =
                PageTableEntry::new(pa, flags.union(PageTableFlags::PRESENT));
        }
        Ok(())
    }

    /// Translates `va`, reporting how (and whether) it is mapped.
    ///
    /// # Safety
    ///
    /// `root` must be the physical address of a valid top-level table.
    pub unsafe fn translate(&self, root: PhysAddr, va: VirtAddr) -> TranslateResult {
        // SAFETY: Caller guarantees the root; intermediate addresses come
        // from present entries of valid tables.
        unsafe {
            let pml4e = self.table_at(root).entries[va.pml4_index()];
            if !pml4e.is_present() {
                return TranslateResult::NotMapped;
            }

            let pdpte = self.table_at(pml4e.address()).entries[va.pdpt_index()];
            if !pdpte.is_present() {
                return TranslateResult::NotMapped;
            }
            if pdpte.flags().contains(PageTableFlags::HUGE_PAGE) {
                return TranslateResult::HugePage {
                    phys_start: pdpte.address(),
                    flags: pdpte.flags(),
                };
            }

            let pde = self.table_at(pdpte.address()).entries[va.pd_index()];
            if !pde.is_present() {
                return TranslateResult::NotMapped;
            }
            if pde.flags().contains(PageTableFlags::HUGE_PAGE) {
                return TranslateResult::HugePage {
                    phys_start: pde.address(),
                    flags: pde.flags(),
                };
            }

            let pte = self.table_at(pde.address()).entries[va.pt_index()];
            if !pte.is_present() {
                return TranslateResult::NotMapped;
            }
            TranslateResult::Page4KiB {
                frame: pte.address(),
                flags: pte.flags(),
            }
        }
    }

    /// Translates `va` to a physical address, or `None` when unmapped.
    ///
    /// # Safety
    ///
    /// Same contract as [`PageTableMapper::translate`].
    pub unsafe fn translate_addr(&self, root: PhysAddr, va: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: Forwarded.
        match unsafe { self.translate(root, va) } {
            TranslateResult::Page4KiB { frame, .. } => Some(frame + va.page_offset()),
            TranslateResult::HugePage { phys_start, .. } => {
                // Offset width depends on the level; both huge sizes are
                // covered by masking below the 2 MiB boundary at minimum.
                Some(phys_start + (va.as_u64() & 0x1F_FFFF))
            }
            TranslateResult::NotMapped => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    /// A pool of 4 KiB-aligned host pages acting as physical frames.
    /// "Physical" addresses are the buffer addresses; hhdm_offset is 0.
    struct FramePool {
        frames: Vec<*mut u8>,
        next: usize,
    }

    impl FramePool {
        fn with_capacity(n: usize) -> Self {
            let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
            let frames = (0..n)
                .map(|_| {
                    let p = unsafe { alloc_zeroed(layout) };
                    assert!(!p.is_null());
                    p
                })
                .collect();
            Self { frames, next: 0 }
        }

        fn take(&mut self) -> Option<PhysAddr> {
            let p = self.frames.get(self.next)?;
            self.next += 1;
            Some(PhysAddr::new(*p as u64))
        }
    }

    impl Drop for FramePool {
        fn drop(&mut self) {
            let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
            for &p in &self.frames {
                unsafe { dealloc(p, layout) };
            }
        }
    }

    fn with_root<R>(f: impl FnOnce(&PageTableMapper, PhysAddr, &mut FramePool) -> R) -> R {
        let mut pool = FramePool::with_capacity(16);
        let root = pool.take().unwrap();
        let mapper = PageTableMapper::new(0);
        f(&mapper, root, &mut pool)
    }

    #[test]
    fn map_then_translate() {
        with_root(|mapper, root, pool| {
            let va = VirtAddr::new(0x0000_4000_2010_3000);
            let frame = pool.take().unwrap();
            let mut alloc = || pool.take();
            unsafe {
                mapper
                    .map_4k(root, va, frame, PageTableFlags::WRITABLE, &mut alloc)
                    .unwrap();
                assert_eq!(
                    mapper.translate_addr(root, va + 0x123),
                    Some(frame + 0x123)
                );
            }
        });
    }

    #[test]
    fn leaf_gets_present_added() {
        with_root(|mapper, root, pool| {
            let va = VirtAddr::new(0x1000);
            let frame = pool.take().unwrap();
            let mut alloc = || pool.take();
            unsafe {
                mapper
                    .map_4k(root, va, frame, PageTableFlags::WRITABLE, &mut alloc)
                    .unwrap();
                match mapper.translate(root, va) {
                    TranslateResult::Page4KiB { flags, .. } => {
                        assert!(flags.contains(PageTableFlags::PRESENT));
                        assert!(flags.contains(PageTableFlags::WRITABLE));
                    }
                    other => panic!("expected 4 KiB mapping, got {other:?}"),
                }
            }
        });
    }

    #[test]
    fn remap_is_idempotent_and_overwrites() {
        with_root(|mapper, root, pool| {
            let va = VirtAddr::new(0x7000);
            let f1 = pool.take().unwrap();
            let f2 = pool.take().unwrap();
            let mut alloc = || pool.take();
            unsafe {
                mapper
                    .map_4k(root, va, f1, PageTableFlags::WRITABLE, &mut alloc)
                    .unwrap();
                // Same mapping again: no change.
                mapper
                    .map_4k(root, va, f1, PageTableFlags::WRITABLE, &mut alloc)
                    .unwrap();
                assert_eq!(mapper.translate_addr(root, va), Some(f1));
                // Different frame: overwritten.
                mapper
                    .map_4k(root, va, f2, PageTableFlags::WRITABLE, &mut alloc)
                    .unwrap();
                assert_eq!(mapper.translate_addr(root, va), Some(f2));
            }
        });
    }

    #[test]
    fn write_through_va_reads_back_through_frame() {
        // With hhdm_offset 0 the mapped VA is the frame pointer itself, so
        // bytes written through the physical side are seen via
        // translate-then-read.
        with_root(|mapper, root, pool| {
            let va = VirtAddr::new(0x0000_0ABC_DE00_0000);
            let frame = pool.take().unwrap();
            let mut alloc = || pool.take();
            unsafe {
                mapper
                    .map_4k(root, va, frame, PageTableFlags::WRITABLE, &mut alloc)
                    .unwrap();
                (frame.as_u64() as *mut u8).write(0x5A);
                let pa = mapper.translate_addr(root, va).unwrap();
                assert_eq!((pa.as_u64() as *const u8).read(), 0x5A);
            }
        });
    }

    #[test]
    fn unmapped_is_not_mapped() {
        with_root(|mapper, root, _pool| unsafe {
            assert_eq!(
                mapper.translate(root, VirtAddr::new(0xDEAD_000)),
                TranslateResult::NotMapped
            );
        });
    }

    #[test]
    fn out_of_frames_fails_cleanly() {
        with_root(|mapper, root, pool| {
            let frame = pool.take().unwrap();
            // An allocator that refuses immediately.
            let mut alloc = || None;
            let va = VirtAddr::new(0x5000_0000);
            unsafe {
                assert_eq!(
                    mapper.map_4k(root, va, frame, PageTableFlags::WRITABLE, &mut alloc),
                    Err(MapError::OutOfFrames)
                );
                assert_eq!(mapper.translate(root, va), TranslateResult::NotMapped);
            }
        });
    }

    #[test]
    fn intermediate_tables_are_shared() {
        // Two pages in the same 2 MiB region must reuse the same PT.
        with_root(|mapper, root, pool| {
            let va1 = VirtAddr::new(0x40_0000);
            let va2 = VirtAddr::new(0x40_1000);
            let f1 = pool.take().unwrap();
            let f2 = pool.take().unwrap();
            let used_before = pool.next;
            let mut alloc = || pool.take();
            unsafe {
                mapper
                    .map_4k(root, va1, f1, PageTableFlags::WRITABLE, &mut alloc)
                    .unwrap();
                mapper
                    .map_4k(root, va2, f2, PageTableFlags::WRITABLE, &mut alloc)
                    .unwrap();
            }
            // First map allocates PDPT+PD+PT (3 frames); second allocates none.
            assert_eq!(pool.next - used_before, 3);
        });
    }
}
