//! Frame-pointer backtraces for the panic path.
//!
//! Walks the RBP chain and prints raw return addresses. Symbolization is
//! left to an offline tool against the kernel image; the panic path stays
//! allocation-free and simple enough to run from any context.

use crate::kprintln;

/// Maximum frames printed.
const MAX_FRAMES: usize = 16;

/// Walks the frame-pointer chain starting at `rbp`, printing `rip` first.
///
/// Best-effort: the walk stops at the first implausible frame pointer
/// (unaligned, too low, non-monotonic) or a zero return address.
pub fn dump(mut rbp: u64, mut rip: u64) {
    kprintln!("Backtrace (most recent call first):");
    for depth in 0..MAX_FRAMES {
        kprintln!(" #{:<2} RIP={:#018x} RBP={:#018x}", depth, rip, rbp);

        if rbp < 0x1000 || rbp & 7 != 0 {
            break;
        }

        // SAFETY: The plausibility checks above reject null/unaligned
        // pointers; a stale but mapped frame yields garbage addresses, which
        // the monotonicity check below cuts short. This is the accepted risk
        // of a best-effort walk on a possibly corrupt stack.
        let (next_rbp, next_rip) = unsafe {
            let p = rbp as *const u64;
            (p.read(), p.add(1).read())
        };

        if next_rbp <= rbp || next_rip == 0 {
            break;
        }
        rbp = next_rbp;
        rip = next_rip;
    }
}
