//! Time-stamp counter access and calibration.

/// Reads the TSC.
#[inline]
pub fn rdtsc() -> u64 {
    let (lo, hi): (u32, u32);
    // SAFETY: rdtsc only reads the counter.
    unsafe {
        core::arch::asm!("rdtsc", out("eax") lo, out("edx") hi, options(nomem, nostack));
    }
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Estimates the TSC frequency by timing a PIT one-shot window of `ms`
/// milliseconds. Coarse but dependency-free; the HPET path is preferred
/// when present.
pub fn calibrate_hz(ms: u32) -> u64 {
    let ms = if ms == 0 { 10 } else { ms };
    let t0 = rdtsc();
    super::pit::oneshot_wait_ms(ms);
    let cycles = rdtsc() - t0;
    cycles * 1000 / u64::from(ms)
}
