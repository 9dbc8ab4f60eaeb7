//! Task control blocks and saved contexts.

/// Maximum task name length, NUL-padded.
pub const TASK_NAME_MAX: usize = 32;

/// Canary word written at the low end of every task stack's guard page.
pub const STACK_CANARY: u64 = 0xCAFE_BABE_DEAD_BEEF;

/// Minimum usable stack pages per task (64 KiB).
pub const MIN_STACK_PAGES: usize = 16;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Ready to run; on the runqueue or current.
    Runnable,
    /// Waiting for a wake or a sleep deadline.
    Blocked,
    /// Exited; parked on the zombie list until reclaimed.
    Zombie,
}

/// A saved execution context.
///
/// The callee-saved registers plus {rsp, rip, rflags} come first: the
/// cooperative `context_switch` touches only that prefix, while the
/// preemption tick copies the whole file to and from the interrupt frame.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TaskContext {
    /// Callee-saved registers.
    pub r15: u64,
    /// Callee-saved.
    pub r14: u64,
    /// Callee-saved.
    pub r13: u64,
    /// Callee-saved.
    pub r12: u64,
    /// Callee-saved.
    pub rbx: u64,
    /// Callee-saved.
    pub rbp: u64,
    /// Stack pointer.
    pub rsp: u64,
    /// Resume address.
    pub rip: u64,
    /// Saved flags.
    pub rflags: u64,
    /// Caller-saved; preserved only across preemptive switches.
    pub rax: u64,
    /// Caller-saved.
    pub rcx: u64,
    /// Caller-saved.
    pub rdx: u64,
    /// Caller-saved.
    pub rsi: u64,
    /// Caller-saved.
    pub rdi: u64,
    /// Caller-saved.
    pub r8: u64,
    /// Caller-saved.
    pub r9: u64,
    /// Caller-saved.
    pub r10: u64,
    /// Caller-saved.
    pub r11: u64,
}

/// RFLAGS value for fresh tasks: IF set plus the always-one bit.
pub const INITIAL_RFLAGS: u64 = 0x202;

/// A kernel task.
pub struct Task {
    /// Task id; 0 is the bootstrap task.
    pub id: u64,
    /// NUL-padded name.
    pub name: [u8; TASK_NAME_MAX],
    /// Lifecycle state.
    pub state: TaskState,
    /// Saved context; valid only while the task is not current.
    pub ctx: TaskContext,
    /// Base of the usable stack (the guard page sits one page below), or 0
    /// for the bootstrap task which runs on the boot stack.
    pub stack_base: u64,
    /// Usable stack size in bytes.
    pub stack_size: u64,
    /// Deepest observed stack use in bytes.
    pub stack_highwater: u64,
    /// Last 5%-bucket a high-water warning was logged for.
    pub stack_warn_bucket: u8,
    /// Absolute tick at which a sleeping task wakes.
    pub wake_tick: u64,
    /// Entry function for spawned tasks.
    pub entry: Option<fn(usize)>,
    /// Opaque argument passed to `entry`.
    pub arg: usize,
    /// Intrusive link for the runqueue / sleep list / zombie list.
    pub next: *mut Task,
}

impl Task {
    /// Creates a zeroed task shell with the given id and name.
    pub fn new(id: u64, name: &str) -> Self {
        let mut name_buf = [0u8; TASK_NAME_MAX];
        let n = name.len().min(TASK_NAME_MAX - 1);
        name_buf[..n].copy_from_slice(&name.as_bytes()[..n]);
        Self {
            id,
            name: name_buf,
            state: TaskState::Runnable,
            ctx: TaskContext::default(),
            stack_base: 0,
            stack_size: 0,
            stack_highwater: 0,
            stack_warn_bucket: 0,
            wake_tick: 0,
            entry: None,
            arg: 0,
            next: core::ptr::null_mut(),
        }
    }

    /// Returns the name as a string slice.
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(TASK_NAME_MAX);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    /// Address of the canary word: the first word of the guard page below
    /// the usable stack. `None` for the bootstrap task.
    pub fn canary_slot(&self) -> Option<*mut u64> {
        if self.stack_base == 0 {
            return None;
        }
        Some((self.stack_base - crate::mm::PAGE_SIZE as u64) as *mut u64)
    }

    /// Checks the stack canary. Tasks without their own stack pass.
    pub fn canary_ok(&self) -> bool {
        match self.canary_slot() {
            // SAFETY: The guard page is committed vheap memory for the
            // task's whole life.
            Some(slot) => unsafe { slot.read() == STACK_CANARY },
            None => true,
        }
    }

    /// Records stack depth from a saved `rsp`, returning `Some(percent)`
    /// when a new ≥75% high-water bucket is crossed (the caller logs it).
    pub fn record_stack_usage(&mut self, rsp: u64) -> Option<u64> {
        if self.stack_base == 0 {
            return None;
        }
        let top = self.stack_base + self.stack_size;
        if rsp > top || rsp < self.stack_base {
            return None;
        }
        let used = top - rsp;
        if used <= self.stack_highwater {
            return None;
        }
        self.stack_highwater = used;
        let pct = used * 100 / self.stack_size.max(1);
        let bucket = (pct / 5) as u8;
        if pct >= 75 && bucket > self.stack_warn_bucket {
            self.stack_warn_bucket = bucket;
            return Some(pct);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_truncates_and_round_trips() {
        let t = Task::new(1, "worker");
        assert_eq!(t.name(), "worker");

        let long = "x".repeat(64);
        let t = Task::new(2, &long);
        assert_eq!(t.name().len(), TASK_NAME_MAX - 1);
    }

    #[test]
    fn bootstrap_task_has_no_canary() {
        let t = Task::new(0, "bootstrap");
        assert!(t.canary_slot().is_none());
        assert!(t.canary_ok());
    }

    #[test]
    fn highwater_tracks_deepest_use() {
        let mut t = Task::new(1, "t");
        t.stack_base = 0x10000;
        t.stack_size = 0x10000; // 64 KiB

        // Shallow use: recorded, no warning.
        assert_eq!(t.record_stack_usage(0x20000 - 0x100), None);
        assert_eq!(t.stack_highwater, 0x100);

        // Shallower than the high water: ignored.
        assert_eq!(t.record_stack_usage(0x20000 - 0x80), None);
        assert_eq!(t.stack_highwater, 0x100);

        // 80% deep: crosses the warn threshold.
        let rsp = 0x20000 - (0x10000 * 8 / 10);
        let pct = t.record_stack_usage(rsp).expect("should warn at 80%");
        assert_eq!(pct, 80);

        // Same bucket again: no repeat warning.
        assert_eq!(t.record_stack_usage(rsp), None);

        // Deeper bucket warns once more.
        let rsp = 0x20000 - (0x10000 * 9 / 10);
        assert!(t.record_stack_usage(rsp).is_some());
    }

    #[test]
    fn out_of_range_rsp_ignored() {
        let mut t = Task::new(1, "t");
        t.stack_base = 0x10000;
        t.stack_size = 0x1000;
        assert_eq!(t.record_stack_usage(0x30000), None);
        assert_eq!(t.record_stack_usage(0x100), None);
        assert_eq!(t.stack_highwater, 0);
    }

    #[test]
    fn context_prefix_layout_for_asm() {
        use core::mem::offset_of;
        // The cooperative switch hardcodes these offsets.
        assert_eq!(offset_of!(TaskContext, r15), 0);
        assert_eq!(offset_of!(TaskContext, rbx), 4 * 8);
        assert_eq!(offset_of!(TaskContext, rbp), 5 * 8);
        assert_eq!(offset_of!(TaskContext, rsp), 6 * 8);
        assert_eq!(offset_of!(TaskContext, rip), 7 * 8);
        assert_eq!(offset_of!(TaskContext, rflags), 8 * 8);
    }
}
