//! TLB invalidation.

use crate::addr::VirtAddr;

/// Invalidates the TLB entry for `va` on the executing CPU.
#[inline]
pub fn flush(va: VirtAddr) {
    // SAFETY: invlpg only drops a TLB entry; it cannot violate memory safety.
    unsafe {
        core::arch::asm!(
            "invlpg [{}]",
            in(reg) va.as_u64(),
            options(nostack, preserves_flags),
        );
    }
}
