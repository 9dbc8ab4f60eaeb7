//! Unified periodic tick source.
//!
//! `init` arms exactly one of, in preference order: the LAPIC timer
//! (calibrated against the HPET when present, a TSC window otherwise), the
//! HPET comparator routed through the I/O APIC, or the legacy PIT. The
//! chosen source drives one interrupt at the requested frequency; the ISR
//! acknowledges the controller, advances the tick counter, fans out the
//! registered callbacks, and finally runs the scheduler tick.

use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, AtomicU64, Ordering};

/// Callback slots available to subsystems.
pub const MAX_CALLBACKS: usize = 8;

/// A tick callback. Runs in interrupt context; keep it short.
pub type TickCallback = fn();

/// The armed tick source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSource {
    /// LAPIC timer in periodic mode.
    Lapic,
    /// HPET comparator 0 via the I/O APIC.
    Hpet,
    /// Legacy PIT on IRQ 0.
    Pit,
}

/// Default tick rate when the caller passes no preference.
pub const DEFAULT_HZ: u32 = 1000;

const SRC_NONE: u8 = 0;
const SRC_LAPIC: u8 = 1;
const SRC_HPET: u8 = 2;
const SRC_PIT: u8 = 3;

static SOURCE: AtomicU8 = AtomicU8::new(SRC_NONE);
static TICK_HZ: AtomicU32 = AtomicU32::new(0);
static TICKS: AtomicU64 = AtomicU64::new(0);

static CALLBACKS: [AtomicPtr<()>; MAX_CALLBACKS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const SLOT: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
    [SLOT; MAX_CALLBACKS]
};

/// Ticks elapsed since the source was armed.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// The armed tick frequency in Hz (0 before init).
pub fn hz() -> u32 {
    TICK_HZ.load(Ordering::Acquire)
}

/// Which source is armed, if any.
pub fn source() -> Option<TimerSource> {
    match SOURCE.load(Ordering::Acquire) {
        SRC_LAPIC => Some(TimerSource::Lapic),
        SRC_HPET => Some(TimerSource::Hpet),
        SRC_PIT => Some(TimerSource::Pit),
        _ => None,
    }
}

/// Registers a callback invoked on every tick, after EOI.
pub fn on_tick(cb: TickCallback) -> Result<(), ()> {
    let ptr = cb as *mut ();
    for slot in &CALLBACKS {
        if slot
            .compare_exchange(
                core::ptr::null_mut(),
                ptr,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            return Ok(());
        }
    }
    Err(())
}

/// Advances the counter and fans out the callbacks. The ISR calls this
/// after EOI; split out so the fan-out logic is host-testable.
fn advance_tick() -> u64 {
    let now = TICKS.fetch_add(1, Ordering::AcqRel) + 1;
    for slot in &CALLBACKS {
        let ptr = slot.load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: Only valid TickCallback pointers are stored.
            let cb: TickCallback = unsafe { core::mem::transmute(ptr) };
            cb();
        }
    }
    now
}

// ---------------------------------------------------------------------------
// Source arming (kernel target)
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod arming {
    use super::*;
    use crate::arch::x86_64::hw::{hpet, lapic, pic, pit, tsc};
    use crate::isr::{self, InterruptFrame, vectors};

    /// Calibration window for the LAPIC timer.
    const CALIBRATE_NS: u64 = 10_000_000;
    /// LAPIC timer divide configuration.
    const LAPIC_DIVIDE: u8 = 16;

    /// Arms one tick source at `hz_hint` (0 picks [`DEFAULT_HZ`]).
    ///
    /// `tsc_hz` feeds the LAPIC calibration when no HPET exists; pass 0 to
    /// calibrate the TSC on demand. Some source always arms: the PIT needs
    /// no discovery.
    pub fn init(hz_hint: u32, tsc_hz: u64) -> TimerSource {
        let hz = if hz_hint == 0 { DEFAULT_HZ } else { hz_hint };

        if lapic::available() {
            let apic_hz = calibrate_lapic(tsc_hz);
            let initial = (apic_hz / u64::from(hz)).max(1) as u32;
            let _ = isr::register(vectors::TIMER, lapic_tick_isr);
            lapic::start_timer_periodic(vectors::TIMER, initial, LAPIC_DIVIDE);
            TICK_HZ.store(hz, Ordering::Release);
            SOURCE.store(SRC_LAPIC, Ordering::Release);
            crate::kinfo!(
                "timer: LAPIC periodic at {} Hz (apic_hz~{}, initial={})",
                hz,
                apic_hz,
                initial
            );
            return TimerSource::Lapic;
        }

        if hpet::available() {
            let interval_ns = 1_000_000_000 / u64::from(hz);
            let _ = isr::register(vectors::TIMER, hpet_tick_isr);
            if hpet::route_periodic_irq(interval_ns, vectors::TIMER, lapic::id()).is_some() {
                TICK_HZ.store(hz, Ordering::Release);
                SOURCE.store(SRC_HPET, Ordering::Release);
                crate::kinfo!("timer: HPET periodic at {} Hz via IOAPIC", hz);
                return TimerSource::Hpet;
            }
            let _ = isr::unregister(vectors::TIMER, hpet_tick_isr);
        }

        // Last resort: the PIT on IRQ 0 (vector 32 after the PIC remap).
        let _ = isr::register(vectors::IRQ_BASE, pit_tick_isr);
        pit::start_periodic(hz);
        pic::clear_mask(0);
        TICK_HZ.store(hz, Ordering::Release);
        SOURCE.store(SRC_PIT, Ordering::Release);
        crate::kinfo!("timer: PIT at {} Hz (legacy)", hz);
        TimerSource::Pit
    }

    /// Measures the LAPIC timer frequency (at the configured divide) over a
    /// ~10 ms window, timed by the HPET when possible, a TSC window
    /// otherwise. Falls back to a 100 MHz/16 guess.
    fn calibrate_lapic(tsc_hz_hint: u64) -> u64 {
        let apic_hz = if hpet::available() && hpet::counter_hz() != 0 {
            // The timebase already started the HPET main counter.
            lapic::start_timer_oneshot(vectors::TIMER, u32::MAX, LAPIC_DIVIDE);
            hpet::sleep_ns(CALIBRATE_NS);
            let elapsed = u64::from(u32::MAX - lapic::timer_current());
            elapsed * 1_000_000_000 / CALIBRATE_NS
        } else {
            let tsc_hz = if tsc_hz_hint != 0 {
                tsc_hz_hint
            } else {
                tsc::calibrate_hz(10)
            };
            lapic::start_timer_oneshot(vectors::TIMER, u32::MAX, LAPIC_DIVIDE);
            let t0 = tsc::rdtsc();
            let window = tsc_hz / 100; // ~10 ms
            while tsc::rdtsc().wrapping_sub(t0) < window {
                core::hint::spin_loop();
            }
            let elapsed = u64::from(u32::MAX - lapic::timer_current());
            let delta = tsc::rdtsc().wrapping_sub(t0);
            if delta == 0 { 0 } else { elapsed * tsc_hz / delta }
        };

        if apic_hz == 0 {
            // Common LAPIC clock guess: 100 MHz behind the divide.
            100_000_000 / u64::from(LAPIC_DIVIDE)
        } else {
            apic_hz
        }
    }

    fn lapic_tick_isr(frame: &mut InterruptFrame) {
        lapic::eoi();
        advance_tick();
        crate::sched::timer_tick(frame);
    }

    fn hpet_tick_isr(frame: &mut InterruptFrame) {
        hpet::ack_irq(0);
        lapic::eoi();
        advance_tick();
        crate::sched::timer_tick(frame);
    }

    fn pit_tick_isr(frame: &mut InterruptFrame) {
        pic::send_eoi(0);
        advance_tick();
        crate::sched::timer_tick(frame);
    }
}

#[cfg(target_os = "none")]
pub use arming::init;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    // The callback table and counter are global; serialize these tests.
    static TIMER_LOCK: Mutex<()> = Mutex::new(());
    static FIRES: AtomicUsize = AtomicUsize::new(0);

    fn counting_cb() {
        FIRES.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn callbacks_fire_every_tick() {
        let _guard = TIMER_LOCK.lock().unwrap();
        FIRES.store(0, Ordering::SeqCst);
        on_tick(counting_cb).unwrap();

        let before = ticks();
        advance_tick();
        advance_tick();
        assert_eq!(ticks(), before + 2);
        assert_eq!(FIRES.load(Ordering::SeqCst), 2);

        // Clean up the slot for other tests.
        let ptr = counting_cb as *mut ();
        for slot in &CALLBACKS {
            let _ = slot.compare_exchange(
                ptr,
                core::ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    #[test]
    fn callback_slots_exhaust() {
        let _guard = TIMER_LOCK.lock().unwrap();
        fn nop() {}
        let mut registered = 0;
        while on_tick(nop).is_ok() {
            registered += 1;
        }
        assert!(registered <= MAX_CALLBACKS);
        assert!(on_tick(nop).is_err());

        let ptr = nop as *mut ();
        for slot in &CALLBACKS {
            let _ = slot.compare_exchange(
                ptr,
                core::ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    #[test]
    fn no_source_before_init() {
        assert_eq!(source(), None);
        assert_eq!(hz(), 0);
    }
}
