//! Monotonic timebase.
//!
//! Source selection at init, in preference order: HPET (when present with a
//! known counter frequency), TSC (calibrated against the PIT when no hint
//! is available), and finally the coarse millisecond tick counter. The
//! selection is read-only after init; conversions run through the software
//! 128-bit divide in `meson_core::time`.

use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use meson_core::time::{mul_div_u64, ns_from_ticks};

use crate::arch::x86_64::hw::{hpet, tsc};

/// The selected timebase source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimebaseSource {
    /// HPET main counter.
    Hpet,
    /// Time-stamp counter with a calibrated frequency.
    Tsc,
    /// The periodic timer's millisecond tick counter.
    CoarseTick,
}

const SRC_COARSE: u8 = 0;
const SRC_HPET: u8 = 1;
const SRC_TSC: u8 = 2;

static SOURCE: AtomicU8 = AtomicU8::new(SRC_COARSE);
static SOURCE_HZ: AtomicU64 = AtomicU64::new(0);

/// Selects the timebase. `tsc_hz_hint` of zero triggers a PIT calibration
/// for the TSC path.
pub fn init(tsc_hz_hint: u64) {
    if hpet::available() {
        hpet::start_counter();
        let hz = hpet::counter_hz();
        if hz != 0 {
            SOURCE_HZ.store(hz, Ordering::Relaxed);
            SOURCE.store(SRC_HPET, Ordering::Release);
            crate::kinfo!("timebase: using HPET ({} Hz)", hz);
            return;
        }
    }

    let tsc_hz = if tsc_hz_hint != 0 {
        tsc_hz_hint
    } else {
        tsc::calibrate_hz(10)
    };
    if tsc_hz != 0 {
        SOURCE_HZ.store(tsc_hz, Ordering::Relaxed);
        SOURCE.store(SRC_TSC, Ordering::Release);
        crate::kinfo!("timebase: using TSC ({} Hz)", tsc_hz);
    } else {
        crate::kinfo!("timebase: falling back to coarse tick");
    }
}

/// Returns which source the timebase selected.
pub fn source() -> TimebaseSource {
    match SOURCE.load(Ordering::Acquire) {
        SRC_HPET => TimebaseSource::Hpet,
        SRC_TSC => TimebaseSource::Tsc,
        _ => TimebaseSource::CoarseTick,
    }
}

/// Monotonic nanoseconds since the source started counting.
///
/// Safe from any context; before `init` it reports the coarse tick (which
/// is zero until the timer runs).
pub fn monotonic_ns() -> u64 {
    match SOURCE.load(Ordering::Acquire) {
        SRC_HPET => ns_from_ticks(hpet::counter(), SOURCE_HZ.load(Ordering::Relaxed)),
        SRC_TSC => ns_from_ticks(tsc::rdtsc(), SOURCE_HZ.load(Ordering::Relaxed)),
        _ => crate::timer::ticks().wrapping_mul(1_000_000),
    }
}

/// Busy-waits at least `ns` nanoseconds on the selected source.
pub fn sleep_ns(ns: u64) {
    if ns == 0 {
        return;
    }
    match SOURCE.load(Ordering::Acquire) {
        SRC_HPET => hpet::sleep_ns(ns),
        SRC_TSC => {
            let hz = SOURCE_HZ.load(Ordering::Relaxed);
            let cycles = mul_div_u64(ns, hz, 1_000_000_000);
            let start = tsc::rdtsc();
            while tsc::rdtsc().wrapping_sub(start) < cycles {
                core::hint::spin_loop();
            }
        }
        _ => {
            let start = crate::timer::ticks();
            let wait_ticks = ns.div_ceil(1_000_000);
            while crate::timer::ticks().wrapping_sub(start) < wait_ticks {
                core::hint::spin_loop();
            }
        }
    }
}

/// Convenience: busy-wait in milliseconds.
pub fn sleep_ms(ms: u64) {
    sleep_ns(ms * 1_000_000);
}
