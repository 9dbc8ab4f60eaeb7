//! Scheduler state and operations (kernel target).

extern crate alloc;

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use meson_core::sync::SpinLock;

use super::context::context_switch;
use super::queue::{RunQueue, SleepList};
use super::task::{INITIAL_RFLAGS, MIN_STACK_PAGES, STACK_CANARY, Task, TaskState};
use crate::arch::x86_64::instructions::interrupts;
use crate::isr::{self, InterruptFrame};
use crate::mm::{PAGE_SIZE, vheap};

struct SchedInner {
    run_queue: RunQueue,
    sleepers: SleepList,
    current: *mut Task,
    /// Exited tasks awaiting reclamation, linked through `Task::next`.
    zombies: *mut Task,
    /// Recycled stacks: guard-page addresses linked through their second
    /// word, with the usable size in the third (vheap pages cannot be
    /// unmapped, so dead stacks are reused instead of leaked).
    free_stacks: u64,
}

// SAFETY: All raw pointers are only touched under the lock.
unsafe impl Send for SchedInner {}

static SCHED: SpinLock<SchedInner> = SpinLock::new(SchedInner {
    run_queue: RunQueue::new(),
    sleepers: SleepList::new(),
    current: core::ptr::null_mut(),
    zombies: core::ptr::null_mut(),
    free_stacks: 0,
});

static STARTED: AtomicBool = AtomicBool::new(false);
static TICK_COUNTER: AtomicU64 = AtomicU64::new(0);
static NEXT_TID: AtomicU64 = AtomicU64::new(1);
static TIMESLICE_TICKS: AtomicU32 = AtomicU32::new(10);
static TICK_LOG_DIV: AtomicU32 = AtomicU32::new(100);

/// Recycled-stack record offsets within the guard page: the canary sits at
/// word 0, the link at word 1, the usable size at word 2.
const FREE_STACK_NEXT: usize = 8;
const FREE_STACK_SIZE: usize = 16;

#[inline]
fn read_rsp() -> u64 {
    let rsp: u64;
    // SAFETY: Reading RSP has no side effects.
    unsafe { core::arch::asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack)) };
    rsp
}

/// Fatal canary mismatch: the dedicated unrecoverable halt.
fn stack_overflow(task: &Task) -> ! {
    crate::kfatal!(
        "sched: stack overflow detected in task {} (id={})",
        task.name(),
        task.id
    );
    crate::arch::x86_64::halt_forever();
}

fn check_canary(task: &Task) {
    if !task.canary_ok() {
        stack_overflow(task);
    }
}

/// Logs a crossed high-water bucket. Runs outside the scheduler lock.
fn log_highwater(task_name: &str, used: u64, size: u64, pct: u64) {
    crate::kinfo!(
        "sched: task {} stack highwater {}/{} ({}%)",
        task_name,
        used,
        size,
        pct
    );
}

// ---------------------------------------------------------------------------
// Init and start
// ---------------------------------------------------------------------------

/// Initializes the scheduler: adopts the boot thread as the bootstrap task,
/// spawns the idle task, and derives the timeslice from the tick rate
/// (about 5 ms at >=1000 Hz, 10 ms at >=100 Hz, 10 ticks otherwise).
pub fn init(tick_hz: u32) {
    let (timeslice, log_div) = if tick_hz >= 1000 {
        (tick_hz / 200, tick_hz)
    } else if tick_hz >= 100 {
        (tick_hz / 100, tick_hz)
    } else {
        (10, 100)
    };
    TIMESLICE_TICKS.store(timeslice.max(1), Ordering::Relaxed);
    TICK_LOG_DIV.store(log_div, Ordering::Relaxed);

    let bootstrap = Box::leak(Box::new(Task::new(0, "bootstrap")));
    bootstrap.ctx.rflags = INITIAL_RFLAGS;

    interrupts::without(|| {
        SCHED.lock().current = bootstrap;
    });

    let _ = isr::register(isr::vectors::SCHED_YIELD, yield_isr);

    if create("idle", idle_entry, 0, 2).is_none() {
        crate::kerr!("sched: failed to create idle task");
    }

    crate::kinfo!(
        "sched: timeslice {} ticks at {} Hz",
        TIMESLICE_TICKS.load(Ordering::Relaxed),
        tick_hz
    );
}

/// Marks the scheduler live and yields into the runqueue.
pub fn start() {
    STARTED.store(true, Ordering::Release);
    yield_now();
}

/// Whether [`start`] has run.
pub fn is_started() -> bool {
    STARTED.load(Ordering::Acquire)
}

/// Ticks observed by the scheduler.
pub fn tick_counter() -> u64 {
    TICK_COUNTER.load(Ordering::Acquire)
}

/// The current task pointer. Stable while the caller keeps interrupts
/// disabled or runs on the task itself.
pub fn current_task() -> *mut Task {
    interrupts::without(|| SCHED.lock().current)
}

fn idle_entry(_arg: usize) {
    loop {
        crate::arch::x86_64::halt_once();
    }
}

/// First code every spawned task runs: call the entry, then exit.
extern "C" fn task_bootstrap() -> ! {
    let task = current_task();
    // SAFETY: `current` always points at a live task.
    let (entry, arg) = unsafe { ((*task).entry, (*task).arg) };
    if let Some(entry) = entry {
        entry(arg);
    }
    exit();
}

// ---------------------------------------------------------------------------
// Task creation and reclamation
// ---------------------------------------------------------------------------

/// Carves a guarded stack for `task`: one canary-carrying guard page below
/// `usable_pages` of stack, committed from the vheap or recycled from a
/// dead task of the same size.
fn setup_stack(task: &mut Task, stack_pages: usize) -> bool {
    let usable_pages = stack_pages.max(MIN_STACK_PAGES);
    let usable_bytes = (usable_pages * PAGE_SIZE) as u64;

    let guard_base = pop_free_stack(usable_bytes).or_else(|| {
        vheap::commit(((usable_pages + 1) * PAGE_SIZE) as u64).map(|va| va.as_u64())
    });
    let Some(guard_base) = guard_base else {
        crate::kerr!("sched: failed to allocate stack for task {}", task.name());
        return false;
    };

    // SAFETY: The guard page was just committed or recycled; writing the
    // canary claims it.
    unsafe { (guard_base as *mut u64).write(STACK_CANARY) };

    task.stack_base = guard_base + PAGE_SIZE as u64;
    task.stack_size = usable_bytes;
    task.stack_highwater = 0;
    task.stack_warn_bucket = 0;

    let top = (task.stack_base + task.stack_size) & !0xF;
    // Mimic the stack state after a `call` so the bootstrap shim sees the
    // alignment the ABI promises.
    task.ctx = Default::default();
    task.ctx.rsp = top - 8;
    task.ctx.rip = task_bootstrap as usize as u64;
    task.ctx.rflags = INITIAL_RFLAGS;
    true
}

fn pop_free_stack(usable_bytes: u64) -> Option<u64> {
    interrupts::without(|| {
        let mut inner = SCHED.lock();
        let mut prev = 0u64;
        let mut cur = inner.free_stacks;
        while cur != 0 {
            // SAFETY: Recycled guard pages stay committed; their link words
            // are written by reap_zombies under this lock.
            unsafe {
                let next = ((cur + FREE_STACK_NEXT as u64) as *const u64).read();
                let size = ((cur + FREE_STACK_SIZE as u64) as *const u64).read();
                if size == usable_bytes {
                    if prev == 0 {
                        inner.free_stacks = next;
                    } else {
                        ((prev + FREE_STACK_NEXT as u64) as *mut u64).write(next);
                    }
                    return Some(cur);
                }
                prev = cur;
                cur = next;
            }
        }
        None
    })
}

/// Lazily collects exited tasks: their stacks go to the recycling list and
/// their control blocks back to the heap.
fn reap_zombies() {
    let mut zombie = interrupts::without(|| {
        let mut inner = SCHED.lock();
        core::mem::replace(&mut inner.zombies, core::ptr::null_mut())
    });

    while !zombie.is_null() {
        // SAFETY: Zombies are detached, never resumed, and reachable only
        // from this list.
        let task = unsafe { Box::from_raw(zombie) };
        zombie = task.next;

        if task.stack_base != 0 {
            let guard_base = task.stack_base - PAGE_SIZE as u64;
            let usable = task.stack_size;
            interrupts::without(|| {
                let mut inner = SCHED.lock();
                // SAFETY: The guard page is committed memory this task owned.
                unsafe {
                    ((guard_base + FREE_STACK_NEXT as u64) as *mut u64).write(inner.free_stacks);
                    ((guard_base + FREE_STACK_SIZE as u64) as *mut u64).write(usable);
                }
                inner.free_stacks = guard_base;
            });
        }
        drop(task);
    }
}

/// Creates a task and enqueues it. Returns its id, or `None` when the task
/// struct or stack cannot be allocated.
pub fn create(name: &str, entry: fn(usize), arg: usize, stack_pages: usize) -> Option<u64> {
    reap_zombies();

    let id = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    let mut task = Box::new(Task::new(id, name));
    task.entry = Some(entry);
    task.arg = arg;
    if !setup_stack(&mut task, stack_pages) {
        return None;
    }

    let ptr = Box::into_raw(task);
    interrupts::without(|| {
        let mut inner = SCHED.lock();
        // SAFETY: Fresh runnable task, linked nowhere else.
        unsafe { inner.run_queue.enqueue(ptr) };
    });
    Some(id)
}

// ---------------------------------------------------------------------------
// Voluntary transitions
// ---------------------------------------------------------------------------

/// Cooperatively gives up the CPU; re-enqueued at the runqueue tail. No-op
/// before [`start`] or when nothing else is runnable.
pub fn yield_now() {
    if !is_started() {
        return;
    }
    interrupts::disable();
    let (prev, next, highwater) = {
        let mut inner = SCHED.lock();
        let prev = inner.current;
        // SAFETY: `current` is live; we hold the lock.
        let highwater = unsafe { (*prev).record_stack_usage(read_rsp()) };
        let next = inner.run_queue.dequeue();
        if next.is_null() {
            drop(inner);
            // SAFETY: Interrupts were enabled in task context.
            unsafe { interrupts::enable() };
            return;
        }
        // SAFETY: Both tasks are live under the lock.
        unsafe {
            check_canary(&*prev);
            inner.run_queue.enqueue(prev);
        }
        inner.current = next;
        (prev, next, highwater)
    };
    // SAFETY: Tasks run with interrupts enabled.
    unsafe { interrupts::enable() };
    if let Some(pct) = highwater {
        // SAFETY: prev stays live on the runqueue.
        let task = unsafe { &*prev };
        log_highwater(task.name(), task.stack_highwater, task.stack_size, pct);
    }
    // SAFETY: prev is live (still enqueued), next was dequeued with a valid
    // saved context; no locks are held.
    unsafe { context_switch(&mut (*prev).ctx, &(*next).ctx) };
}

/// Terminates the current task. Its memory is reclaimed by a later
/// [`create`]. Never returns; halts the CPU when nothing is runnable.
pub fn exit() -> ! {
    interrupts::disable();
    let (prev, next) = {
        let mut inner = SCHED.lock();
        let prev = inner.current;
        // SAFETY: `current` is live; we hold the lock.
        unsafe {
            let _ = (*prev).record_stack_usage(read_rsp());
            check_canary(&*prev);
            (*prev).state = TaskState::Zombie;
            (*prev).next = inner.zombies;
        }
        inner.zombies = prev;

        let next = inner.run_queue.dequeue();
        if next.is_null() {
            drop(inner);
            crate::kerr!("sched: no runnable tasks, halting");
            crate::arch::x86_64::halt_forever();
        }
        inner.current = next;
        (prev, next)
    };
    // SAFETY: Interrupts back on for the next task; see yield_now.
    unsafe {
        interrupts::enable();
        context_switch(&mut (*prev).ctx, &(*next).ctx);
    }
    unreachable!("exited task resumed");
}

/// Blocks the current task until [`wake`]. Halts when nothing else can run
/// (the idle task makes that unreachable in practice).
pub fn block() {
    if !is_started() {
        return;
    }
    interrupts::disable();
    let (prev, next) = {
        let mut inner = SCHED.lock();
        let prev = inner.current;
        // SAFETY: `current` is live; we hold the lock.
        unsafe {
            let _ = (*prev).record_stack_usage(read_rsp());
            check_canary(&*prev);
            (*prev).state = TaskState::Blocked;
        }
        let next = inner.run_queue.dequeue();
        if next.is_null() {
            drop(inner);
            crate::kerr!("sched: all tasks blocked, halting");
            crate::arch::x86_64::halt_forever();
        }
        inner.current = next;
        (prev, next)
    };
    // SAFETY: See yield_now.
    unsafe {
        interrupts::enable();
        context_switch(&mut (*prev).ctx, &(*next).ctx);
    }
}

/// Wakes a blocked task, removing it from the sleep list when present.
///
/// # Safety
///
/// `task` must point at a live task (e.g. obtained from [`current_task`]
/// by the task itself before blocking).
pub unsafe fn wake(task: *mut Task) -> bool {
    interrupts::without(|| {
        let mut inner = SCHED.lock();
        // SAFETY: Caller guarantees liveness; we hold the lock.
        unsafe {
            if (*task).state != TaskState::Blocked {
                return false;
            }
            inner.sleepers.remove(task);
            (*task).state = TaskState::Runnable;
            (*task).wake_tick = 0;
            inner.run_queue.enqueue(task);
        }
        true
    })
}

/// Sleeps for at least `ticks` timer ticks. Zero yields; before the
/// scheduler starts it spin-waits on the tick counter.
pub fn sleep_ticks(ticks: u64) {
    if ticks == 0 {
        yield_now();
        return;
    }
    if !is_started() {
        let start = crate::timer::ticks();
        while crate::timer::ticks().wrapping_sub(start) < ticks {
            core::hint::spin_loop();
        }
        return;
    }

    interrupts::disable();
    let (prev, next) = {
        let mut inner = SCHED.lock();
        let prev = inner.current;
        // SAFETY: `current` is live; we hold the lock.
        unsafe {
            let _ = (*prev).record_stack_usage(read_rsp());
            check_canary(&*prev);
            (*prev).state = TaskState::Blocked;
            (*prev).wake_tick = TICK_COUNTER.load(Ordering::Relaxed) + ticks;
            inner.sleepers.insert(prev);
        }
        let next = inner.run_queue.dequeue();
        if next.is_null() {
            drop(inner);
            crate::kerr!("sched: all tasks sleeping, halting");
            crate::arch::x86_64::halt_forever();
        }
        inner.current = next;
        (prev, next)
    };
    // SAFETY: See yield_now.
    unsafe {
        interrupts::enable();
        context_switch(&mut (*prev).ctx, &(*next).ctx);
    }
}

/// Sleeps for at least `ms` milliseconds of timer ticks.
pub fn sleep_ms(ms: u64) {
    let hz = u64::from(crate::timer::hz().max(1));
    sleep_ticks((ms * hz).div_ceil(1000).max(1));
}

// ---------------------------------------------------------------------------
// Preemption
// ---------------------------------------------------------------------------

/// The timer ISR hook: advances the tick, releases due sleepers, and
/// preempts on timeslice boundaries by rewriting the interrupt frame.
pub fn timer_tick(frame: &mut InterruptFrame) {
    if !is_started() {
        return;
    }
    let now = TICK_COUNTER.fetch_add(1, Ordering::AcqRel) + 1;
    crate::percpu::current().tick_count.fetch_add(1, Ordering::Relaxed);

    // Wake sleepers whose deadlines passed.
    {
        let mut inner = SCHED.lock();
        let SchedInner {
            sleepers,
            run_queue,
            ..
        } = &mut *inner;
        sleepers.drain_due(now, |task| {
            // SAFETY: Drained tasks are live and now unlinked.
            unsafe {
                (*task).state = TaskState::Runnable;
                (*task).wake_tick = 0;
                run_queue.enqueue(task);
            }
        });
    }

    let log_div = TICK_LOG_DIV.load(Ordering::Relaxed);
    if log_div != 0 && now % u64::from(log_div) == 0 {
        crate::kdebug!("sched: tick={}", now);
    }

    let timeslice = u64::from(TIMESLICE_TICKS.load(Ordering::Relaxed));
    if now % timeslice != 0 {
        return;
    }
    preempt(frame);
}

/// Handler for the software-yield vector: reschedule immediately. EOIs the
/// LAPIC in case the vector arrived as an IPI rather than a software `int`.
fn yield_isr(frame: &mut InterruptFrame) {
    if crate::arch::x86_64::hw::lapic::available() {
        crate::arch::x86_64::hw::lapic::eoi();
    }
    if is_started() {
        preempt(frame);
    }
}

/// Switches tasks across the interrupt return: saves the interrupted
/// register file into the current task, loads the next task's file into the
/// frame, so `iretq` resumes the new task.
fn preempt(frame: &mut InterruptFrame) {
    let mut preempted = core::ptr::null_mut::<Task>();
    let mut highwater = None;
    {
        let mut inner = SCHED.lock();
        let prev = inner.current;
        let next = inner.run_queue.dequeue();
        if next.is_null() {
            return;
        }
        if next == prev {
            // SAFETY: Live task straight off the queue.
            unsafe { inner.run_queue.enqueue(next) };
            return;
        }

        // SAFETY: Both tasks are live under the lock; the frame is this
        // CPU's interrupt stack.
        unsafe {
            highwater = (*prev).record_stack_usage(frame.rsp);
            check_canary(&*prev);
            check_canary(&*next);

            save_frame(frame, &mut (*prev).ctx);
            inner.run_queue.enqueue(prev);
            inner.current = next;
            load_frame(&(*next).ctx, frame);
        }
        preempted = prev;
    }

    if let Some(pct) = highwater {
        // SAFETY: The preempted task stays live on the runqueue.
        let task = unsafe { &*preempted };
        log_highwater(task.name(), task.stack_highwater, task.stack_size, pct);
    }
}

/// Copies the interrupted register file into a saved context.
fn save_frame(frame: &InterruptFrame, ctx: &mut super::task::TaskContext) {
    ctx.r15 = frame.r15;
    ctx.r14 = frame.r14;
    ctx.r13 = frame.r13;
    ctx.r12 = frame.r12;
    ctx.rbx = frame.rbx;
    ctx.rbp = frame.rbp;
    ctx.rsp = frame.rsp;
    ctx.rip = frame.rip;
    ctx.rflags = frame.rflags;
    ctx.rax = frame.rax;
    ctx.rcx = frame.rcx;
    ctx.rdx = frame.rdx;
    ctx.rsi = frame.rsi;
    ctx.rdi = frame.rdi;
    ctx.r8 = frame.r8;
    ctx.r9 = frame.r9;
    ctx.r10 = frame.r10;
    ctx.r11 = frame.r11;
}

/// Loads a saved context into the interrupt frame for `iretq`.
fn load_frame(ctx: &super::task::TaskContext, frame: &mut InterruptFrame) {
    frame.r15 = ctx.r15;
    frame.r14 = ctx.r14;
    frame.r13 = ctx.r13;
    frame.r12 = ctx.r12;
    frame.rbx = ctx.rbx;
    frame.rbp = ctx.rbp;
    frame.rsp = ctx.rsp;
    frame.rip = ctx.rip;
    frame.rflags = ctx.rflags;
    frame.rax = ctx.rax;
    frame.rcx = ctx.rcx;
    frame.rdx = ctx.rdx;
    frame.rsi = ctx.rsi;
    frame.rdi = ctx.rdi;
    frame.r8 = ctx.r8;
    frame.r9 = ctx.r9;
    frame.r10 = ctx.r10;
    frame.r11 = ctx.r11;
}
