//! Serialized kernel panic path.
//!
//! The first CPU to panic wins a one-shot flag, disables interrupts, halts
//! every other CPU with an IPI, and dumps the reason, the interrupted
//! register file, CR2 for page faults, and a frame-pointer backtrace.
//! Subsequent entrants (including the other CPUs re-entering through a
//! nested fault) halt silently.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::isr::InterruptFrame;
use crate::{kprint, kprintln};

static PANIC_ONCE: AtomicBool = AtomicBool::new(false);

/// Panics the kernel with an optional interrupt frame.
///
/// Never returns; the CPU halts after the dump.
pub fn kernel_panic(reason: &str, frame: Option<&InterruptFrame>) -> ! {
    crate::arch::x86_64::instructions::interrupts::disable();

    if PANIC_ONCE.swap(true, Ordering::AcqRel) {
        // Someone else is already dumping.
        crate::arch::x86_64::halt_forever();
    }

    kprintln!();
    kprintln!("===== KERNEL PANIC =====");
    kprintln!("Reason: {}", reason);
    kprintln!();

    crate::arch::x86_64::smp::halt_others();

    if let Some(f) = frame {
        dump_frame(f);
        if f.int_no == 14 {
            let cr2: u64;
            // SAFETY: Reading CR2 has no side effects.
            unsafe {
                core::arch::asm!("mov {}, cr2", out(reg) cr2,
                    options(nomem, nostack, preserves_flags));
            }
            kprintln!("CR2={:#018x}", cr2);
        }
        crate::backtrace::dump(f.rbp, f.rip);
    } else {
        let rbp: u64;
        let rip: u64;
        // SAFETY: Reading RBP and RIP has no side effects.
        unsafe {
            core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack));
            core::arch::asm!("lea {}, [rip]", out(reg) rip, options(nomem, nostack));
        }
        crate::backtrace::dump(rbp, rip);
    }

    crate::arch::x86_64::halt_forever();
}

/// Prints the full register file in the interrupt-frame layout.
fn dump_frame(f: &InterruptFrame) {
    kprintln!(
        "RAX={:#018x} RBX={:#018x} RCX={:#018x} RDX={:#018x}",
        f.rax,
        f.rbx,
        f.rcx,
        f.rdx
    );
    kprintln!(
        "RSI={:#018x} RDI={:#018x} RBP={:#018x} RSP={:#018x}",
        f.rsi,
        f.rdi,
        f.rbp,
        f.rsp
    );
    kprintln!(
        "R8 ={:#018x} R9 ={:#018x} R10={:#018x} R11={:#018x}",
        f.r8,
        f.r9,
        f.r10,
        f.r11
    );
    kprintln!(
        "R12={:#018x} R13={:#018x} R14={:#018x} R15={:#018x}",
        f.r12,
        f.r13,
        f.r14,
        f.r15
    );
    kprintln!();
    kprintln!(
        "RIP={:#018x} CS={:#06x} RFLAGS={:#018x}",
        f.rip,
        f.cs & 0xFFFF,
        f.rflags
    );
    kprintln!(
        "SS={:#06x} INT_NO={} ERR_CODE={:#x}",
        f.ss & 0xFFFF,
        f.int_no,
        f.err_code
    );
    kprint!("\n");
}

/// Rust panic handler: route language panics into the kernel panic path.
#[cfg(not(test))]
#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    // Write straight to the serial port as well, in case the logger's lock
    // is what we panicked under.
    crate::log::panic_serial(info);

    if let Some(msg) = info.message().as_str() {
        kernel_panic(msg, None)
    } else {
        kernel_panic("rust panic", None)
    }
}
