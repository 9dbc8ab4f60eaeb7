//! HPET driver.
//!
//! Provides the timebase counter (main counter + period from the general
//! capabilities register) and a periodic comparator that can be routed
//! through the I/O APIC as an alternative tick source.

use core::sync::atomic::{AtomicU64, Ordering};

use meson_core::addr::VirtAddr;
use meson_core::time::mul_div_u64;

// Register offsets (bytes).
const REG_GCAP_ID: usize = 0x000;
const REG_CONFIG: usize = 0x010;
const REG_INT_STATUS: usize = 0x020;
const REG_MAIN_COUNTER: usize = 0x0F0;
/// Comparator N config/capabilities: 0x100 + 0x20 * N.
const REG_TIMER_CFG: usize = 0x100;
/// Comparator N comparator value: 0x108 + 0x20 * N.
const REG_TIMER_CMP: usize = 0x108;
const TIMER_STRIDE: usize = 0x20;

const CONFIG_ENABLE: u64 = 1 << 0;
const TIMER_CFG_INT_ENABLE: u64 = 1 << 2;
const TIMER_CFG_PERIODIC: u64 = 1 << 3;
const TIMER_CFG_VAL_SET: u64 = 1 << 6;
/// Interrupt routing field, bits 9..13.
const TIMER_CFG_ROUTE_SHIFT: u32 = 9;
const TIMER_CFG_ROUTE_MASK: u64 = 0x1F << TIMER_CFG_ROUTE_SHIFT;

/// Femtoseconds per second.
const FS_PER_SEC: u64 = 1_000_000_000_000_000;

static HPET_BASE: AtomicU64 = AtomicU64::new(0);
static PERIOD_FS: AtomicU64 = AtomicU64::new(0);

fn read(offset: usize) -> u64 {
    let base = HPET_BASE.load(Ordering::Acquire) as usize;
    debug_assert!(base != 0, "HPET used before discovery");
    // SAFETY: 64-bit reads within the discovered register block.
    unsafe { ((base + offset) as *const u64).read_volatile() }
}

fn write(offset: usize, value: u64) {
    let base = HPET_BASE.load(Ordering::Acquire) as usize;
    debug_assert!(base != 0, "HPET used before discovery");
    // SAFETY: See `read`.
    unsafe { ((base + offset) as *mut u64).write_volatile(value) }
}

/// Records the HPET register block and reads its counter period.
///
/// Returns `false` when the reported period is zero (the device is unusable
/// as a timebase).
pub fn set_base(base: VirtAddr) -> bool {
    HPET_BASE.store(base.as_u64(), Ordering::Release);
    let period = read(REG_GCAP_ID) >> 32;
    PERIOD_FS.store(period, Ordering::Relaxed);
    period != 0
}

/// Returns whether the HPET has been discovered and is usable.
pub fn available() -> bool {
    HPET_BASE.load(Ordering::Acquire) != 0 && PERIOD_FS.load(Ordering::Relaxed) != 0
}

/// Resets and starts the main counter.
pub fn start_counter() {
    let config = read(REG_CONFIG) & !CONFIG_ENABLE;
    write(REG_CONFIG, config);
    write(REG_MAIN_COUNTER, 0);
    write(REG_CONFIG, config | CONFIG_ENABLE);
}

/// Reads the free-running main counter.
pub fn counter() -> u64 {
    read(REG_MAIN_COUNTER)
}

/// Returns the counter frequency in Hz (0 when unusable).
pub fn counter_hz() -> u64 {
    let period = PERIOD_FS.load(Ordering::Relaxed);
    if period == 0 { 0 } else { FS_PER_SEC / period }
}

/// Busy-waits `ns` nanoseconds on the main counter.
pub fn sleep_ns(ns: u64) {
    let period = PERIOD_FS.load(Ordering::Relaxed);
    if period == 0 {
        return;
    }
    let ticks = mul_div_u64(ns, 1_000_000, period);
    let start = counter();
    while counter().wrapping_sub(start) < ticks {
        core::hint::spin_loop();
    }
}

/// Programs comparator `n` for a periodic interrupt every `ns_interval`,
/// interrupts still disabled; routing and enabling happen in
/// [`route_periodic_irq`].
fn program_periodic(n: usize, ns_interval: u64) {
    let cfg_reg = REG_TIMER_CFG + n * TIMER_STRIDE;
    let cmp_reg = REG_TIMER_CMP + n * TIMER_STRIDE;

    // Stop the counter while reprogramming.
    let config = read(REG_CONFIG) & !CONFIG_ENABLE;
    write(REG_CONFIG, config);
    // Clear any pending status for this comparator.
    write(REG_INT_STATUS, 1 << n);

    let mut cfg = read(cfg_reg);
    cfg |= TIMER_CFG_PERIODIC;
    cfg &= !TIMER_CFG_INT_ENABLE;
    write(cfg_reg, cfg);

    let period = PERIOD_FS.load(Ordering::Relaxed);
    let ticks = mul_div_u64(ns_interval, 1_000_000, period);
    // VAL_SET sequence: arm the period register behind the comparator.
    write(cmp_reg, ticks);
    write(cfg_reg, cfg | TIMER_CFG_VAL_SET);
    write(cmp_reg, ticks);

    write(REG_MAIN_COUNTER, 0);
    write(REG_CONFIG, config | CONFIG_ENABLE);
}

/// Acknowledges comparator `n`'s level/edge status bit.
pub fn ack_irq(n: usize) {
    write(REG_INT_STATUS, 1 << n);
}

/// Programs comparator 0 periodic at `ns_interval` and routes it through
/// the I/O APIC to `vector`.
///
/// The comparator's `INT_ROUTE_CAP` mask (bits 32..63 of its config
/// register) restricts which I/O APIC inputs it can drive; pins yielding a
/// GSI of at least 16 are preferred, and the ISA pins 0, 1, 2 and 8 are
/// avoided. Returns the chosen GSI, or `None` when no routable pin exists.
pub fn route_periodic_irq(ns_interval: u64, vector: u8, dest_apic_id: u32) -> Option<u32> {
    use super::ioapic;

    if !available() || !ioapic::available() {
        return None;
    }

    program_periodic(0, ns_interval);

    let cfg_reg = REG_TIMER_CFG;
    let route_cap = (read(cfg_reg) >> 32) as u32;
    if route_cap == 0 {
        crate::kerr!("hpet: no INT_ROUTE_CAP bits; cannot route IRQ");
        return None;
    }

    let gsi_base = ioapic::gsi_base();
    let pick = |want_high: bool| -> Option<u32> {
        (0..32u8)
            .filter(|pin| route_cap & (1 << pin) != 0)
            .map(|pin| gsi_base + u32::from(pin))
            .find(|&gsi| {
                if want_high {
                    gsi >= 16
                } else {
                    !matches!(gsi, 0 | 1 | 2 | 8)
                }
            })
    };
    let gsi = pick(true).or_else(|| pick(false))?;
    let pin = gsi - gsi_base;

    // Point the comparator at the chosen pin.
    let mut cfg = read(cfg_reg);
    cfg = (cfg & !TIMER_CFG_ROUTE_MASK) | (u64::from(pin & 0x1F) << TIMER_CFG_ROUTE_SHIFT);
    write(cfg_reg, cfg);

    ioapic::mask(gsi);
    ioapic::route(gsi, vector, dest_apic_id);
    ioapic::unmask(gsi);

    // Enable the comparator interrupt and clear any stale status.
    write(cfg_reg, read(cfg_reg) | TIMER_CFG_INT_ENABLE);
    write(REG_INT_STATUS, 1 << 0);

    crate::kdebug!("hpet: comparator 0 routed to GSI {} vector {:#x}", gsi, vector);
    Some(gsi)
}
