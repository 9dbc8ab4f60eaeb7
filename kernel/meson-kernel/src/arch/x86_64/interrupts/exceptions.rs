//! Default CPU exception handlers.
//!
//! One handler covers vectors 0..31. Page faults get a recovery attempt:
//! a non-present fault inside the vheap window is repaired by backing the
//! page, after which returning from the interrupt retries the instruction.
//! Everything else is fatal.

use meson_core::addr::VirtAddr;
use meson_core::arch::x86_64::structures::paging::PageFaultErrorCode;

use crate::isr::{self, InterruptFrame};
use crate::mm::vheap;

/// Human-readable exception names, indexed by vector.
pub fn exception_name(vector: u64) -> &'static str {
    match vector {
        0 => "Divide error",
        1 => "Debug",
        2 => "Non-maskable interrupt",
        3 => "Breakpoint",
        4 => "Overflow",
        5 => "BOUND range exceeded",
        6 => "Invalid opcode",
        7 => "Device not available",
        8 => "Double fault",
        10 => "Invalid TSS",
        11 => "Segment not present",
        12 => "Stack-segment fault",
        13 => "General protection fault",
        14 => "Page fault",
        16 => "x87 floating-point",
        17 => "Alignment check",
        18 => "Machine check",
        19 => "SIMD floating-point",
        21 => "Control protection",
        _ => "Exception",
    }
}

/// Reads CR2 (the faulting linear address).
fn read_cr2() -> u64 {
    let cr2: u64;
    // SAFETY: Reading CR2 has no side effects.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
    }
    cr2
}

/// The shared default handler for vectors 0..31.
fn default_exception(frame: &mut InterruptFrame) {
    if frame.int_no == 14 {
        let cr2 = read_cr2();
        let error = PageFaultErrorCode::from_bits_truncate(frame.err_code);

        // Non-present fault inside the reserved vheap window: back the page
        // and resume the faulting instruction.
        if !error.contains(PageFaultErrorCode::PRESENT)
            && vheap::map_one(VirtAddr::new_truncate(cr2))
        {
            return;
        }

        let access = if error.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
            "instruction fetch"
        } else if error.contains(PageFaultErrorCode::WRITE) {
            "write"
        } else {
            "read"
        };
        let cause = if error.contains(PageFaultErrorCode::PRESENT) {
            "protection violation"
        } else {
            "page not present"
        };
        crate::kerr!(
            "page fault: {} during {} at {:#x} (err={:#x})",
            cause,
            access,
            cr2,
            frame.err_code
        );
    }

    crate::panic::kernel_panic(exception_name(frame.int_no), Some(frame));
}

/// Handler for the panic halt IPI: parks the CPU for good.
fn halt_ipi(_frame: &mut InterruptFrame) {
    super::super::halt_forever();
}

/// Registers the default exception handlers on vectors 0..31 and the halt
/// IPI handler.
pub fn install_defaults() {
    for vector in 0..32 {
        let _ = isr::register(vector, default_exception);
    }
    let _ = isr::register(isr::vectors::HALT, halt_ipi);
}
