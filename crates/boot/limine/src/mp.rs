//! Multiprocessor information structures (x86_64).
//!
//! Each CPU in the system gets one [`MpInfo`]. An atomic write to its
//! `goto_address` field releases the parked AP: the CPU jumps to the written
//! address on a bootloader-provided stack with a pointer to its own `MpInfo`
//! in RDI. `extra_argument` must be written before `goto_address`.

use core::cell::UnsafeCell;
use core::sync::atomic::{Ordering, fence};

/// AP entry point signature: receives a pointer to the CPU's own [`MpInfo`].
pub type ApEntry = unsafe extern "C" fn(*const MpInfo) -> !;

/// Per-CPU information structure (x86_64 layout).
#[repr(C)]
pub struct MpInfo {
    /// Bootloader-assigned processor ID.
    pub processor_id: u32,
    /// Local APIC ID of the processor.
    pub lapic_id: u32,
    _reserved: u64,
    /// Writing an entry address here starts the AP. NULL until then.
    goto_address: UnsafeCell<u64>,
    /// Free-use argument readable by the started AP.
    extra_argument: UnsafeCell<u64>,
}

// SAFETY: The cells live in bootloader memory reachable from any CPU via the
// HHDM; `start` is the only writer and uses a release fence before the
// releasing store the AP observes.
unsafe impl Send for MpInfo {}
unsafe impl Sync for MpInfo {}

impl MpInfo {
    /// Starts this AP at `entry`, passing `extra` through `extra_argument`.
    ///
    /// # Safety
    ///
    /// - `entry` must be a valid AP entry point that never returns.
    /// - Must be called at most once per CPU, and never for the BSP.
    pub unsafe fn start(&self, entry: ApEntry, extra: u64) {
        // SAFETY: Caller guarantees exclusive access to this CPU's fields;
        // the fence orders the argument write before the releasing start.
        unsafe {
            core::ptr::write_volatile(self.extra_argument.get(), extra);
            fence(Ordering::Release);
            core::ptr::write_volatile(self.goto_address.get(), entry as usize as u64);
        }
    }

    /// Reads the extra argument. Meant for the started AP itself.
    #[must_use]
    pub fn extra_argument(&self) -> u64 {
        // SAFETY: By the time an AP runs, `start` has completed its writes.
        unsafe { core::ptr::read_volatile(self.extra_argument.get()) }
    }
}
