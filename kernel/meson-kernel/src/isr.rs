//! Interrupt dispatch core.
//!
//! Every vector owns up to [`MAX_HANDLERS`] slots; the common entry path
//! (the naked stubs in `arch::x86_64::interrupts`) pushes the uniform
//! [`InterruptFrame`] and calls [`dispatch`], which invokes every non-empty
//! slot in registration order. Handlers run with interrupts disabled and
//! must stay short.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Handler slots per vector.
pub const MAX_HANDLERS: usize = 8;

/// The register file pushed by the interrupt stubs, lowest address first.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InterruptFrame {
    /// General-purpose registers as pushed by the stub.
    pub r15: u64,
    /// See `r15`.
    pub r14: u64,
    /// See `r15`.
    pub r13: u64,
    /// See `r15`.
    pub r12: u64,
    /// See `r15`.
    pub r11: u64,
    /// See `r15`.
    pub r10: u64,
    /// See `r15`.
    pub r9: u64,
    /// See `r15`.
    pub r8: u64,
    /// See `r15`.
    pub rsi: u64,
    /// See `r15`.
    pub rdi: u64,
    /// See `r15`.
    pub rbp: u64,
    /// See `r15`.
    pub rdx: u64,
    /// See `r15`.
    pub rcx: u64,
    /// See `r15`.
    pub rbx: u64,
    /// See `r15`.
    pub rax: u64,
    /// Vector number pushed by the per-vector stub.
    pub int_no: u64,
    /// CPU error code, or 0 for vectors that do not push one.
    pub err_code: u64,
    /// Hardware frame: interrupted instruction pointer.
    pub rip: u64,
    /// Hardware frame: code segment.
    pub cs: u64,
    /// Hardware frame: saved RFLAGS.
    pub rflags: u64,
    /// Hardware frame: interrupted stack pointer.
    pub rsp: u64,
    /// Hardware frame: stack segment.
    pub ss: u64,
}

/// An interrupt handler. Runs with interrupts disabled; may edit the frame
/// (the scheduler's preemption tick does) but must not block.
pub type IsrHandler = fn(&mut InterruptFrame);

/// Errors from handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsrError {
    /// All slots for the vector are taken.
    SlotsFull,
    /// The handler was not registered on the vector.
    NotRegistered,
}

/// One atomic slot array per vector. Null means empty.
static HANDLERS: [[AtomicPtr<()>; MAX_HANDLERS]; 256] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const SLOT: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
    #[allow(clippy::declare_interior_mutable_const)]
    const VECTOR: [AtomicPtr<()>; MAX_HANDLERS] = [SLOT; MAX_HANDLERS];
    [VECTOR; 256]
};

/// Registers `handler` on `vector`, in the first empty slot.
pub fn register(vector: u8, handler: IsrHandler) -> Result<(), IsrError> {
    let ptr = handler as *mut ();
    for slot in &HANDLERS[vector as usize] {
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
    Err(IsrError::SlotsFull)
}

/// Removes `handler` from `vector`.
pub fn unregister(vector: u8, handler: IsrHandler) -> Result<(), IsrError> {
    let ptr = handler as *mut ();
    for slot in &HANDLERS[vector as usize] {
        if slot
            .compare_exchange(ptr, core::ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(());
        }
    }
    Err(IsrError::NotRegistered)
}

/// Invokes every registered handler for the frame's vector, in slot order.
///
/// Called by the common stub with interrupts disabled. Handler return
/// values do not exist; recovery is a handler's own business (the page-fault
/// path resumes by simply returning once the mapping is repaired).
pub fn dispatch(frame: &mut InterruptFrame) {
    let vector = (frame.int_no & 0xFF) as usize;
    for slot in &HANDLERS[vector] {
        let ptr = slot.load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: Only valid IsrHandler pointers are stored in slots.
            let handler: IsrHandler = unsafe { core::mem::transmute(ptr) };
            handler(frame);
        }
    }
}

/// Well-known vector assignments.
pub mod vectors {
    /// LAPIC timer.
    pub const TIMER: u8 = 0xF0;
    /// Panic halt IPI: the handler parks the CPU.
    pub const HALT: u8 = 0xF1;
    /// Scheduler software yield / IPI.
    pub const SCHED_YIELD: u8 = 0xF2;
    /// LAPIC spurious vector.
    pub const SPURIOUS: u8 = 0xFF;
    /// First legacy IRQ vector after PIC remap.
    pub const IRQ_BASE: u8 = 32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The handler table is global; serialize the tests that touch it and
    // give each its own vector.
    static TABLE_LOCK: Mutex<()> = Mutex::new(());

    fn frame(vector: u8) -> InterruptFrame {
        let mut f: InterruptFrame = unsafe { core::mem::zeroed() };
        f.int_no = u64::from(vector);
        f
    }

    static ORDER: Mutex<Vec<u8>> = Mutex::new(Vec::new());

    fn first(_f: &mut InterruptFrame) {
        ORDER.lock().unwrap().push(1);
    }
    fn second(_f: &mut InterruptFrame) {
        ORDER.lock().unwrap().push(2);
    }
    fn bump_rax(f: &mut InterruptFrame) {
        f.rax += 1;
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let _guard = TABLE_LOCK.lock().unwrap();
        register(100, first).unwrap();
        register(100, second).unwrap();
        ORDER.lock().unwrap().clear();

        dispatch(&mut frame(100));
        assert_eq!(*ORDER.lock().unwrap(), vec![1, 2]);

        unregister(100, first).unwrap();
        unregister(100, second).unwrap();
    }

    #[test]
    fn handlers_may_edit_the_frame() {
        let _guard = TABLE_LOCK.lock().unwrap();
        register(101, bump_rax).unwrap();
        let mut f = frame(101);
        dispatch(&mut f);
        assert_eq!(f.rax, 1);
        unregister(101, bump_rax).unwrap();
    }

    #[test]
    fn vector_slots_exhaust() {
        let _guard = TABLE_LOCK.lock().unwrap();
        for _ in 0..MAX_HANDLERS {
            register(102, bump_rax).unwrap();
        }
        assert_eq!(register(102, bump_rax), Err(IsrError::SlotsFull));
        for _ in 0..MAX_HANDLERS {
            unregister(102, bump_rax).unwrap();
        }
    }

    #[test]
    fn unregister_unknown_fails() {
        let _guard = TABLE_LOCK.lock().unwrap();
        assert_eq!(unregister(103, bump_rax), Err(IsrError::NotRegistered));
    }

    #[test]
    fn empty_vector_dispatch_is_a_noop() {
        let mut f = frame(104);
        dispatch(&mut f);
        assert_eq!(f.rax, 0);
    }

    #[test]
    fn frame_layout_matches_stub_push_order() {
        use core::mem::offset_of;
        // The stub pushes r15 last, so it sits at offset 0; the hardware
        // frame (rip..ss) follows int_no/err_code.
        assert_eq!(offset_of!(InterruptFrame, r15), 0);
        assert_eq!(offset_of!(InterruptFrame, rax), 14 * 8);
        assert_eq!(offset_of!(InterruptFrame, int_no), 15 * 8);
        assert_eq!(offset_of!(InterruptFrame, err_code), 16 * 8);
        assert_eq!(offset_of!(InterruptFrame, rip), 17 * 8);
        assert_eq!(offset_of!(InterruptFrame, ss), 21 * 8);
        assert_eq!(core::mem::size_of::<InterruptFrame>(), 22 * 8);
    }
}
