//! Interrupt flag control.

/// Enables interrupts on this CPU.
///
/// # Safety
///
/// The IDT and the interrupt controllers must be fully initialized.
#[inline]
pub unsafe fn enable() {
    // SAFETY: Forwarded to the caller.
    unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
}

/// Disables interrupts on this CPU.
#[inline]
pub fn disable() {
    // SAFETY: Masking interrupts cannot violate memory safety.
    unsafe { core::arch::asm!("cli", options(nomem, nostack)) };
}

/// Returns whether interrupts are enabled (RFLAGS.IF).
#[inline]
pub fn are_enabled() -> bool {
    let rflags: u64;
    // SAFETY: pushfq/pop only reads flags state.
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {}",
            out(reg) rflags,
            options(nomem, preserves_flags),
        );
    }
    rflags & (1 << 9) != 0
}

/// Runs `f` with interrupts disabled, restoring the previous state after.
pub fn without<R>(f: impl FnOnce() -> R) -> R {
    let was_enabled = are_enabled();
    disable();
    let result = f();
    if was_enabled {
        // SAFETY: Interrupts were on when we entered, so the IDT is live.
        unsafe { enable() };
    }
    result
}
