//! Local APIC driver.
//!
//! MMIO access to the LAPIC at its HHDM-mapped base: enable with a spurious
//! vector, EOI, the periodic/one-shot timer, and IPIs (the panic path
//! broadcasts its halt vector here).

use core::sync::atomic::{AtomicU64, Ordering};

use meson_core::addr::VirtAddr;

// Register offsets.
const REG_ID: usize = 0x020;
const REG_TPR: usize = 0x080;
const REG_EOI: usize = 0x0B0;
const REG_SVR: usize = 0x0F0;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_TIMER_INIT: usize = 0x380;
const REG_TIMER_CURR: usize = 0x390;
const REG_TIMER_DIV: usize = 0x3E0;

const SVR_ENABLE: u32 = 1 << 8;
const TIMER_PERIODIC: u32 = 1 << 17;

/// ICR destination shorthand: all excluding self.
const ICR_ALL_BUT_SELF: u32 = 0b11 << 18;
/// ICR delivery status bit.
const ICR_PENDING: u32 = 1 << 12;

/// IA32_APIC_BASE MSR and its global-enable bit.
const MSR_APIC_BASE: u32 = 0x1B;
const APIC_BASE_ENABLE: u64 = 1 << 11;

/// HHDM-mapped LAPIC base; zero until discovered via ACPI.
static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);

/// Records the LAPIC MMIO base (HHDM virtual).
pub fn set_base(base: VirtAddr) {
    LAPIC_BASE.store(base.as_u64(), Ordering::Release);
}

/// Returns whether a LAPIC base has been discovered.
pub fn available() -> bool {
    LAPIC_BASE.load(Ordering::Acquire) != 0
}

fn read(offset: usize) -> u32 {
    let base = LAPIC_BASE.load(Ordering::Acquire);
    debug_assert!(base != 0, "LAPIC used before discovery");
    // SAFETY: The base is the HHDM mapping of the LAPIC registers.
    unsafe { ((base as usize + offset) as *const u32).read_volatile() }
}

fn write(offset: usize, value: u32) {
    let base = LAPIC_BASE.load(Ordering::Acquire);
    debug_assert!(base != 0, "LAPIC used before discovery");
    // SAFETY: See `read`; the readback orders the write on the bus.
    unsafe {
        ((base as usize + offset) as *mut u32).write_volatile(value);
        ((base as usize + offset) as *const u32).read_volatile();
    }
}

/// Returns this CPU's APIC ID.
pub fn id() -> u32 {
    read(REG_ID) >> 24
}

/// Enables the LAPIC on this CPU: xAPIC mode in the MSR, spurious vector in
/// the SVR, TPR open.
pub fn enable(spurious_vector: u8) {
    // SAFETY: RMW of IA32_APIC_BASE only sets the global-enable bit.
    unsafe {
        let (lo, hi): (u32, u32);
        core::arch::asm!("rdmsr", in("ecx") MSR_APIC_BASE, out("eax") lo, out("edx") hi,
            options(nomem, nostack));
        let base = (u64::from(hi) << 32) | u64::from(lo) | APIC_BASE_ENABLE;
        core::arch::asm!("wrmsr", in("ecx") MSR_APIC_BASE,
            in("eax") base as u32, in("edx") (base >> 32) as u32,
            options(nomem, nostack));
    }
    let svr = read(REG_SVR);
    write(REG_SVR, svr | SVR_ENABLE | u32::from(spurious_vector));
    write(REG_TPR, 0);
}

/// Signals end-of-interrupt.
pub fn eoi() {
    write(REG_EOI, 0);
}

/// Starts the timer in periodic mode with the given divide-config power of
/// two and initial count.
pub fn start_timer_periodic(vector: u8, initial: u32, divide: u8) {
    write(REG_TIMER_DIV, divide_config(divide));
    write(REG_LVT_TIMER, TIMER_PERIODIC | u32::from(vector));
    write(REG_TIMER_INIT, initial);
}

/// Arms a one-shot countdown from `initial` without an interrupt vector
/// change; used for calibration.
pub fn start_timer_oneshot(vector: u8, initial: u32, divide: u8) {
    write(REG_TIMER_DIV, divide_config(divide));
    write(REG_LVT_TIMER, u32::from(vector));
    write(REG_TIMER_INIT, initial);
}

/// Reads the current timer countdown value.
pub fn timer_current() -> u32 {
    read(REG_TIMER_CURR)
}

/// Broadcasts `vector` to every CPU except this one.
///
/// Used by the panic path to halt the other CPUs; skips the wait-for-idle
/// poll when called re-entrantly would be pointless, so it spins briefly at
/// most.
pub fn broadcast_ipi(vector: u8) {
    if !available() {
        return;
    }
    write(REG_ICR_HIGH, 0);
    write(REG_ICR_LOW, ICR_ALL_BUT_SELF | u32::from(vector));
    let mut spin = 0u32;
    while read(REG_ICR_LOW) & ICR_PENDING != 0 && spin < 1_000_000 {
        core::hint::spin_loop();
        spin += 1;
    }
}

/// Maps a power-of-two divisor to the divide-configuration encoding.
fn divide_config(divide: u8) -> u32 {
    match divide {
        1 => 0b1011,
        2 => 0b0000,
        4 => 0b0001,
        8 => 0b0010,
        16 => 0b0011,
        32 => 0b1000,
        64 => 0b1001,
        128 => 0b1010,
        _ => 0b0011,
    }
}
