//! Cooperative context switch.
//!
//! Saves the callee-saved prefix of [`TaskContext`] plus {rsp, rip, rflags}
//! for the outgoing task, then loads the same set for the incoming one and
//! jumps to its resume address on its own stack. Caller-saved registers are
//! dead across a call by the C ABI, so the cooperative path does not touch
//! them; only the preemption tick moves the full file.

use core::mem::offset_of;

use super::task::TaskContext;

const OFF_R15: usize = offset_of!(TaskContext, r15);
const OFF_R14: usize = offset_of!(TaskContext, r14);
const OFF_R13: usize = offset_of!(TaskContext, r13);
const OFF_R12: usize = offset_of!(TaskContext, r12);
const OFF_RBX: usize = offset_of!(TaskContext, rbx);
const OFF_RBP: usize = offset_of!(TaskContext, rbp);
const OFF_RSP: usize = offset_of!(TaskContext, rsp);
const OFF_RIP: usize = offset_of!(TaskContext, rip);
const OFF_RFLAGS: usize = offset_of!(TaskContext, rflags);

/// Switches from `prev` to `next`.
///
/// Returns (into `prev`'s saved resume point) only when some other switch
/// later restores `prev`. Fresh tasks resume at their bootstrap shim.
///
/// # Safety
///
/// - Both pointers must reference live, distinct contexts.
/// - `next` must hold a valid {rsp, rip} pair: either saved by a previous
///   switch/preemption or initialized for a fresh task, with `rsp` inside
///   mapped stack memory and aligned as after a `call`.
/// - The caller must not hold spinlocks across the switch.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(prev: *mut TaskContext, next: *const TaskContext) {
    core::arch::naked_asm!(
        // Save the outgoing context (prev in rdi).
        "mov [rdi + {off_r15}], r15",
        "mov [rdi + {off_r14}], r14",
        "mov [rdi + {off_r13}], r13",
        "mov [rdi + {off_r12}], r12",
        "mov [rdi + {off_rbx}], rbx",
        "mov [rdi + {off_rbp}], rbp",
        "mov [rdi + {off_rsp}], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + {off_rip}], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + {off_rflags}], rax",
        // Load the incoming context (next in rsi).
        "mov rsp, [rsi + {off_rsp}]",
        "mov r15, [rsi + {off_r15}]",
        "mov r14, [rsi + {off_r14}]",
        "mov r13, [rsi + {off_r13}]",
        "mov r12, [rsi + {off_r12}]",
        "mov rbx, [rsi + {off_rbx}]",
        "mov rbp, [rsi + {off_rbp}]",
        "push qword ptr [rsi + {off_rflags}]",
        "popfq",
        "mov rax, [rsi + {off_rip}]",
        "jmp rax",
        // Resume point for the task saved above.
        "2:",
        "ret",
        off_r15 = const OFF_R15,
        off_r14 = const OFF_R14,
        off_r13 = const OFF_R13,
        off_r12 = const OFF_R12,
        off_rbx = const OFF_RBX,
        off_rbp = const OFF_RBP,
        off_rsp = const OFF_RSP,
        off_rip = const OFF_RIP,
        off_rflags = const OFF_RFLAGS,
    );
}
