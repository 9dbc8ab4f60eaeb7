//! Kernel page-table glue around the 4-level walker.
//!
//! Reads CR3 once at init to learn the live top-level table, then installs
//! 4 KiB mappings on request, pulling intermediate-table frames from palloc
//! and invalidating the local TLB for each new leaf. One lock serializes all
//! mappings; the walker itself only requires serialization per-VA.

use meson_core::addr::{PhysAddr, VirtAddr};
use meson_core::arch::x86_64::instructions::tlb;
use meson_core::arch::x86_64::paging::{MapError, PageTableMapper};
use meson_core::arch::x86_64::structures::paging::PageTableFlags;
use meson_core::sync::SpinLock;

use super::palloc::PALLOC;

/// Errors from the mapping interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// The VMM has not been initialized.
    Uninitialized,
    /// palloc could not supply an intermediate table frame.
    OutOfFrames,
}

struct VmmInner {
    mapper: PageTableMapper,
    root: PhysAddr,
    hhdm_offset: u64,
}

static VMM: SpinLock<Option<VmmInner>> = SpinLock::new(None);

/// Captures the active top-level table from CR3.
///
/// # Safety
///
/// Must run once, after palloc init, while the boot page tables (which map
/// the HHDM) are live in CR3.
pub unsafe fn init(hhdm_offset: u64) {
    let cr3: u64;
    // SAFETY: Reading CR3 in ring 0 has no side effects.
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
    }
    let root = PhysAddr::new(cr3 & !0xFFF);

    let mut vmm = VMM.lock();
    assert!(vmm.is_none(), "VMM already initialized");
    *vmm = Some(VmmInner {
        mapper: PageTableMapper::new(hhdm_offset),
        root,
        hhdm_offset,
    });
    crate::kinfo!("vmm: root table at {}", root);
}

/// Maps the 4 KiB page at `va` to `pa` with `flags | PRESENT`, allocating
/// intermediate tables as needed, then invalidates the local TLB entry.
///
/// An existing mapping is overwritten; remapping with identical arguments is
/// a no-op. Intermediate tables installed before an out-of-frames failure
/// stay in place.
pub fn map_page(va: VirtAddr, pa: PhysAddr, flags: PageTableFlags) -> Result<(), VmmError> {
    let mut guard = VMM.lock();
    let vmm = guard.as_mut().ok_or(VmmError::Uninitialized)?;

    let hhdm = vmm.hhdm_offset;
    let mut alloc = || {
        PALLOC
            .alloc_frame()
            .map(|page| PhysAddr::new(page.as_u64() - hhdm))
    };

    // SAFETY: `root` came from CR3 at init; the HHDM covers all table
    // frames; `alloc` hands out unused frames; the lock serializes walks.
    unsafe {
        vmm.mapper
            .map_4k(vmm.root, va, pa, flags, &mut alloc)
            .map_err(|MapError::OutOfFrames| VmmError::OutOfFrames)?;
    }

    tlb::flush(va);
    Ok(())
}

/// Converts an HHDM virtual address back to its physical address.
pub fn hhdm_to_phys(va: VirtAddr) -> PhysAddr {
    let guard = VMM.lock();
    let hhdm = guard.as_ref().map_or(0, |v| v.hhdm_offset);
    PhysAddr::new(va.as_u64().wrapping_sub(hhdm))
}

/// Translates `va` through the live tables (diagnostics).
pub fn translate(va: VirtAddr) -> Option<PhysAddr> {
    let guard = VMM.lock();
    let vmm = guard.as_ref()?;
    // SAFETY: Same contract as map_page.
    unsafe { vmm.mapper.translate_addr(vmm.root, va) }
}

/// Maps a physical MMIO region into the HHDM window with caching disabled
/// and returns its virtual address. Mapping is idempotent, so remapping an
/// already-covered region is harmless.
pub fn ioremap(phys: PhysAddr, size: u64) -> Result<VirtAddr, VmmError> {
    let hhdm = {
        let guard = VMM.lock();
        guard.as_ref().ok_or(VmmError::Uninitialized)?.hhdm_offset
    };

    let start = phys.align_down(0x1000);
    let end = (phys + size).align_up(0x1000);
    let mut page = start;
    while page < end {
        map_page(
            VirtAddr::new_truncate(hhdm + page.as_u64()),
            page,
            PageTableFlags::WRITABLE | PageTableFlags::CACHE_DISABLE,
        )?;
        page = page + 0x1000;
    }
    Ok(VirtAddr::new_truncate(hhdm + phys.as_u64()))
}
