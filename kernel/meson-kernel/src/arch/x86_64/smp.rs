//! SMP bring-up over the bootloader's MP structures.
//!
//! For each application processor: commit a guarded stack from the vheap,
//! park a bootstrap record in the CPU descriptor's argument slot, and point
//! its `goto_address` at the trampoline. The AP switches to its stack,
//! installs per-CPU state and descriptor tables, enables its LAPIC, counts
//! itself online, and idles. The BSP pause-spins until the online count
//! matches the CPU total before starting the scheduler.

extern crate alloc;

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::boot::BootInfo;
use crate::mm::{PAGE_SIZE, vheap};
use crate::sched::task::STACK_CANARY;

/// Usable AP stack pages (64 KiB) plus one guard page.
const AP_STACK_PAGES: usize = 16;

/// Online CPUs; the BSP counts from the start.
static CPU_ONLINE: AtomicU32 = AtomicU32::new(1);
/// Total CPUs reported by the bootloader.
static CPU_TOTAL: AtomicU32 = AtomicU32::new(1);

/// Passed to each AP through the MP descriptor's argument slot.
struct ApBootstrap {
    stack_base: u64,
    stack_size: u64,
    cpu_index: u32,
    apic_id: u32,
}

/// Returns the number of CPUs that have come online.
pub fn online_count() -> u32 {
    CPU_ONLINE.load(Ordering::Acquire)
}

/// Returns the total CPU count from boot info.
pub fn cpu_count() -> u32 {
    CPU_TOTAL.load(Ordering::Acquire)
}

/// Queues every AP for startup. Requires the heap, vheap, GDT/IDT
/// infrastructure, and the LAPIC base discovery to be done.
pub fn init(boot_info: &impl BootInfo) {
    let cpus = boot_info.smp_cpus();
    let total = cpus.len() as u32 + 1;
    CPU_TOTAL.store(total, Ordering::Release);

    if cpus.is_empty() {
        crate::kinfo!("smp: single CPU (no APs)");
        return;
    }
    crate::kinfo!(
        "smp: {} CPUs, BSP lapic {}",
        total,
        boot_info.bsp_lapic_id()
    );

    for (i, cpu) in cpus.iter().enumerate() {
        let cpu_index = (i + 1) as u32;
        let Some(base) = vheap::commit(((AP_STACK_PAGES + 1) * PAGE_SIZE) as u64) else {
            crate::kerr!("smp: failed to allocate AP stack (lapic {})", cpu.lapic_id);
            continue;
        };
        // Canary in the guard page; the usable stack begins one page up.
        // SAFETY: The region was just committed.
        unsafe { (base.as_u64() as *mut u64).write(STACK_CANARY) };

        let boot = Box::leak(Box::new(ApBootstrap {
            stack_base: base.as_u64() + PAGE_SIZE as u64,
            stack_size: (AP_STACK_PAGES * PAGE_SIZE) as u64,
            cpu_index,
            apic_id: cpu.lapic_id,
        }));

        crate::kinfo!(
            "smp: queued AP lapic={} stack={:#x}..{:#x}",
            cpu.lapic_id,
            boot.stack_base,
            boot.stack_base + boot.stack_size
        );
        // SAFETY: The descriptor came from the live MP response; the
        // trampoline never returns.
        unsafe { cpu.start(ap_entry, boot as *const ApBootstrap as u64) };
    }
}

/// Blocks until every CPU has signalled online.
pub fn wait_all_online() {
    while online_count() < cpu_count() {
        core::hint::spin_loop();
    }
    crate::kinfo!("smp: {} CPUs online", online_count());
}

/// AP trampoline. Runs on the bootloader-provided stack just long enough to
/// switch to the kernel-owned one.
unsafe extern "C" fn ap_entry(info: *const crate::boot::RawMpInfo) -> ! {
    // SAFETY: The bootstrap record was leaked for exactly this AP and the
    // MP info stays mapped through the HHDM.
    let boot = unsafe { &*((*info).extra_argument() as *const ApBootstrap) };
    let stack_top = (boot.stack_base + boot.stack_size) & !0xF;

    // SAFETY: Switching to the freshly committed stack, then continuing in
    // ap_main which never returns.
    unsafe {
        core::arch::asm!(
            "mov rsp, {stack}",
            "mov rdi, {boot}",
            "jmp {main}",
            stack = in(reg) stack_top,
            boot = in(reg) boot as *const ApBootstrap,
            main = sym ap_main,
            options(noreturn),
        );
    }
}

/// AP initialization proper, on the kernel stack.
extern "C" fn ap_main(boot: &'static ApBootstrap) -> ! {
    super::enable_sse();

    // Per-AP descriptor tables must be live before interrupts can be taken.
    // SAFETY: Unique CPU index; interrupts are disabled throughout bring-up.
    unsafe {
        super::gdt::init(boot.cpu_index as usize);
        super::idt::init();
        crate::percpu::install(boot.cpu_index as usize, boot.apic_id);
    }

    super::hw::lapic::enable(crate::isr::vectors::SPURIOUS);
    crate::percpu::set_online();

    crate::kinfo!(
        "smp: AP lapic {} online (cpu_index={})",
        boot.apic_id,
        boot.cpu_index
    );
    CPU_ONLINE.fetch_add(1, Ordering::Release);

    // SAFETY: IDT and LAPIC are initialized on this CPU.
    unsafe { crate::arch::x86_64::instructions::interrupts::enable() };

    // The scheduling domain is the BSP; APs service interrupts and idle.
    loop {
        super::halt_once();
    }
}

/// Halts every other CPU via the panic IPI. Called by the panic core.
pub fn halt_others() {
    if online_count() > 1 {
        super::hw::lapic::broadcast_ipi(crate::isr::vectors::HALT);
        crate::kprintln!("[panic] other CPUs halted");
    }
}
