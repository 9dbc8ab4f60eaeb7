//! I/O APIC driver: just enough to route, mask, and unmask a GSI.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use meson_core::addr::VirtAddr;

/// Index/data register pair offsets in the MMIO window.
const IOREGSEL: usize = 0x00;
const IOWIN: usize = 0x10;

/// Redirection table base index.
const REG_REDTBL: u32 = 0x10;

/// Redirection entry mask bit.
const REDTBL_MASKED: u64 = 1 << 16;

static IOAPIC_BASE: AtomicU64 = AtomicU64::new(0);
static GSI_BASE: AtomicU32 = AtomicU32::new(0);

/// Records the first I/O APIC's HHDM-mapped window and GSI base.
pub fn set_base(base: VirtAddr, gsi_base: u32) {
    GSI_BASE.store(gsi_base, Ordering::Relaxed);
    IOAPIC_BASE.store(base.as_u64(), Ordering::Release);
}

/// Returns whether an I/O APIC has been discovered.
pub fn available() -> bool {
    IOAPIC_BASE.load(Ordering::Acquire) != 0
}

/// Returns the GSI number of the I/O APIC's first input pin.
pub fn gsi_base() -> u32 {
    GSI_BASE.load(Ordering::Relaxed)
}

fn read(reg: u32) -> u32 {
    let base = IOAPIC_BASE.load(Ordering::Acquire) as usize;
    debug_assert!(base != 0, "IOAPIC used before discovery");
    // SAFETY: Index/data access to the discovered MMIO window.
    unsafe {
        ((base + IOREGSEL) as *mut u32).write_volatile(reg);
        ((base + IOWIN) as *const u32).read_volatile()
    }
}

fn write(reg: u32, value: u32) {
    let base = IOAPIC_BASE.load(Ordering::Acquire) as usize;
    debug_assert!(base != 0, "IOAPIC used before discovery");
    // SAFETY: See `read`.
    unsafe {
        ((base + IOREGSEL) as *mut u32).write_volatile(reg);
        ((base + IOWIN) as *mut u32).write_volatile(value);
    }
}

fn redtbl_index(gsi: u32) -> u32 {
    REG_REDTBL + 2 * (gsi - gsi_base())
}

/// Routes `gsi` to `vector` on the BSP (physical destination 0), edge
/// triggered, active high, initially masked state preserved.
pub fn route(gsi: u32, vector: u8, dest_apic_id: u32) {
    let index = redtbl_index(gsi);
    let low = u64::from(vector);
    let entry = low | (u64::from(dest_apic_id) << 56);
    write(index + 1, (entry >> 32) as u32);
    write(index, entry as u32);
}

/// Masks the redirection entry for `gsi`.
pub fn mask(gsi: u32) {
    let index = redtbl_index(gsi);
    let low = u64::from(read(index)) | REDTBL_MASKED;
    write(index, low as u32);
}

/// Unmasks the redirection entry for `gsi`.
pub fn unmask(gsi: u32) {
    let index = redtbl_index(gsi);
    let low = u64::from(read(index)) & !REDTBL_MASKED;
    write(index, low as u32);
}
