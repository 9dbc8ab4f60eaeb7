//! Bootloader-agnostic boot information and the kernel init sequence.
//!
//! The boot stub converts its native protocol structures into
//! [`BootInfoData`] and calls [`kernel_init`]; the kernel never touches the
//! protocol directly. Static dispatch through the [`BootInfo`] trait keeps
//! the conversion zero-cost.

use meson_core::addr::PhysAddr;
use planck_noalloc::vec::ArrayVec;

/// Kind of a physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Plain usable RAM.
    Usable,
    /// Reserved by firmware or hardware.
    Reserved,
    /// ACPI tables, reclaimable after parsing.
    AcpiReclaimable,
    /// Bootloader memory, reclaimable once boot data is consumed.
    BootloaderReclaimable,
    /// The kernel image and modules.
    KernelAndModules,
    /// Framebuffer memory.
    Framebuffer,
    /// Anything else (bad memory, NVS, unknown types).
    Other,
}

/// A contiguous physical memory region.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    /// Physical start address.
    pub start: PhysAddr,
    /// Size in bytes.
    pub size: u64,
    /// Region kind.
    pub kind: MemoryRegionKind,
}

/// The framebuffer facts the kernel logs (the display path itself is an
/// external collaborator).
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    /// Virtual address of the framebuffer.
    pub address: u64,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per scanline.
    pub pitch: u32,
    /// Bits per pixel.
    pub bpp: u16,
}

/// Raw MP info structure layout shared with the bootloader, used by the AP
/// trampoline to read its argument before any kernel stack exists.
#[repr(C)]
pub struct RawMpInfo {
    /// Bootloader processor id.
    pub processor_id: u32,
    /// Local APIC id.
    pub lapic_id: u32,
    _reserved: u64,
    _goto_address: u64,
    extra_argument: u64,
}

impl RawMpInfo {
    /// Reads the opaque argument stored by [`SmpCpu::start`].
    pub fn extra_argument(&self) -> u64 {
        // SAFETY: The starter wrote this field with a release fence before
        // the AP could observe the goto address.
        unsafe { core::ptr::read_volatile(&raw const self.extra_argument) }
    }
}

/// One startable CPU from the boot MP response.
#[derive(Debug, Clone, Copy)]
pub struct SmpCpu {
    /// Bootloader processor id.
    pub processor_id: u32,
    /// Local APIC id.
    pub lapic_id: u32,
    /// Pointer to the descriptor's `goto_address` field.
    pub goto_address_ptr: *mut u64,
    /// Pointer to the descriptor's `extra_argument` field.
    pub extra_argument_ptr: *mut u64,
}

// SAFETY: The pointers reference bootloader memory reachable from any CPU
// through the HHDM.
unsafe impl Send for SmpCpu {}
unsafe impl Sync for SmpCpu {}

impl SmpCpu {
    /// Starts this AP at `entry`, passing `extra` through the argument slot.
    ///
    /// # Safety
    ///
    /// `entry` must never return; must be called at most once per CPU and
    /// never for the BSP.
    pub unsafe fn start(&self, entry: unsafe extern "C" fn(*const RawMpInfo) -> !, extra: u64) {
        use core::sync::atomic::{Ordering, fence};
        // SAFETY: The descriptor memory is live bootloader memory.
        unsafe {
            core::ptr::write_volatile(self.extra_argument_ptr, extra);
            fence(Ordering::Release);
            core::ptr::write_volatile(self.goto_address_ptr, entry as usize as u64);
        }
    }
}

/// Maximum memory regions carried in boot info.
pub const MAX_MEMORY_REGIONS: usize = 128;
/// Maximum framebuffers carried in boot info.
pub const MAX_FRAMEBUFFERS: usize = 4;
/// Maximum CPUs carried in boot info.
pub const MAX_SMP_CPUS: usize = 64;

/// Bootloader-agnostic boot information.
pub trait BootInfo {
    /// The physical memory map, sorted by base.
    fn memory_map(&self) -> &[MemoryRegion];
    /// The HHDM offset: `virt = phys + offset`.
    fn hhdm_offset(&self) -> u64;
    /// Framebuffers, possibly empty.
    fn framebuffers(&self) -> &[FramebufferInfo];
    /// Physical address of the ACPI RSDP, when provided.
    fn rsdp_address(&self) -> Option<u64>;
    /// Virtual base the kernel image was loaded at.
    fn kernel_virtual_base(&self) -> u64;
    /// Startable application processors (BSP excluded).
    fn smp_cpus(&self) -> &[SmpCpu];
    /// The BSP's local APIC id.
    fn bsp_lapic_id(&self) -> u32;
}

/// Concrete boot info container populated by a boot stub.
pub struct BootInfoData {
    /// Memory map entries.
    pub memory_map: ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>,
    /// HHDM offset.
    pub hhdm_offset: u64,
    /// Framebuffers.
    pub framebuffers: ArrayVec<FramebufferInfo, MAX_FRAMEBUFFERS>,
    /// ACPI RSDP physical address.
    pub rsdp_address: Option<u64>,
    /// Kernel image virtual base.
    pub kernel_virtual_base: u64,
    /// Application processors.
    pub smp_cpus: ArrayVec<SmpCpu, MAX_SMP_CPUS>,
    /// BSP local APIC id.
    pub bsp_lapic_id: u32,
}

impl BootInfoData {
    /// An empty container for the boot stub to fill.
    pub fn empty() -> Self {
        Self {
            memory_map: ArrayVec::new(),
            hhdm_offset: 0,
            framebuffers: ArrayVec::new(),
            rsdp_address: None,
            kernel_virtual_base: 0,
            smp_cpus: ArrayVec::new(),
            bsp_lapic_id: 0,
        }
    }
}

impl BootInfo for BootInfoData {
    fn memory_map(&self) -> &[MemoryRegion] {
        self.memory_map.as_slice()
    }

    fn hhdm_offset(&self) -> u64 {
        self.hhdm_offset
    }

    fn framebuffers(&self) -> &[FramebufferInfo] {
        self.framebuffers.as_slice()
    }

    fn rsdp_address(&self) -> Option<u64> {
        self.rsdp_address
    }

    fn kernel_virtual_base(&self) -> u64 {
        self.kernel_virtual_base
    }

    fn smp_cpus(&self) -> &[SmpCpu] {
        self.smp_cpus.as_slice()
    }

    fn bsp_lapic_id(&self) -> u32 {
        self.bsp_lapic_id
    }
}

// ---------------------------------------------------------------------------
// Kernel init sequence
// ---------------------------------------------------------------------------

/// Brings the kernel up and never returns. Called by the boot stub with
/// interrupts disabled on the bootloader-provided stack.
#[cfg(target_os = "none")]
pub fn kernel_init(boot_info: &impl BootInfo) -> ! {
    use crate::arch::x86_64 as arch;
    use crate::mm::PhysMemoryRegion;
    use crate::{kerr, kinfo};

    crate::log::init_early_serial();
    kinfo!("=== kernel startup begin ===");

    // Verify the bootloader gave us what the core cannot live without.
    if boot_info.hhdm_offset() == 0 || boot_info.memory_map().is_empty() {
        kerr!("bootloader did not supply required data; halting");
        arch::halt_forever();
    }
    kinfo!(
        "boot: {} memmap entries, hhdm={:#x}, {} framebuffers",
        boot_info.memory_map().len(),
        boot_info.hhdm_offset(),
        boot_info.framebuffers().len()
    );
    if let Some(fb) = boot_info.framebuffers().first() {
        kinfo!(
            "boot: framebuffer {}x{} {}bpp (pitch={})",
            fb.width,
            fb.height,
            fb.bpp,
            fb.pitch
        );
    }

    // Descriptor tables and exception routing for the BSP.
    // SAFETY: Single-threaded early boot, interrupts disabled.
    unsafe {
        arch::gdt::init(0);
        arch::idt::init();
        crate::percpu::install(0, boot_info.bsp_lapic_id());
    }
    arch::interrupts::exceptions::install_defaults();
    crate::percpu::set_online();
    kinfo!("descriptor tables installed");

    // Physical frame allocator from the usable memory map.
    {
        let mut regions = [PhysMemoryRegion {
            start: PhysAddr::zero(),
            size: 0,
            usable: false,
        }; MAX_MEMORY_REGIONS];
        let mut count = 0;
        for region in boot_info.memory_map() {
            if count >= regions.len() {
                break;
            }
            regions[count] = PhysMemoryRegion {
                start: region.start,
                size: region.size,
                usable: region.kind == MemoryRegionKind::Usable,
            };
            count += 1;
        }
        // SAFETY: Regions come straight from the boot memory map; init runs
        // once before any allocation.
        unsafe { crate::mm::palloc::init(&regions[..count], boot_info.hhdm_offset()) };
    }
    kinfo!(
        "palloc: {} MiB free / {} MiB total",
        crate::mm::palloc::PALLOC.free_count() * 4 / 1024,
        crate::mm::palloc::PALLOC.total_count() * 4 / 1024
    );

    // Page-table walker over the live boot tables, then the heap stack:
    // vheap window, slab caches, general heap.
    // SAFETY: Boot page tables are live in CR3; palloc is up.
    unsafe { crate::mm::vmm::init(boot_info.hhdm_offset()) };
    crate::mm::heap::init();
    heap_self_test();

    // The heap is up: switch to the sink-based logger.
    crate::log::init_logger();

    // Mask the legacy PIC before any interrupt source is armed.
    // SAFETY: Interrupts are still disabled; runs once.
    unsafe { arch::hw::pic::remap_and_mask_all() };
    kinfo!("pic: remapped and masked");

    let tsc_hz = arch::hw::tsc::calibrate_hz(10);
    kinfo!("tsc: ~{} Hz", tsc_hz);

    // ACPI: LAPIC base, first IOAPIC, HPET.
    match boot_info.rsdp_address() {
        Some(rsdp) => match arch::acpi::init(rsdp, boot_info.hhdm_offset()) {
            Ok(_) => {}
            Err(e) => kerr!("acpi: init failed: {}", e),
        },
        None => kerr!("acpi: no RSDP from bootloader"),
    }

    if arch::hw::lapic::available() {
        arch::hw::lapic::enable(crate::isr::vectors::SPURIOUS);
    }

    // Timebase, then the unified tick source.
    crate::time::init(tsc_hz);
    crate::timer::init(crate::timer::DEFAULT_HZ, tsc_hz);

    // Application processors, then the scheduler over the timer's rate.
    arch::smp::init(boot_info);
    crate::sched::init(crate::timer::hz());

    // SAFETY: IDT, exception handlers, and the tick source are configured.
    unsafe { arch::instructions::interrupts::enable() };
    kinfo!("interrupts enabled");

    arch::smp::wait_all_online();
    crate::sched::start();

    kinfo!("=== kernel startup end ===");

    // The bootstrap task has nothing further to do; it parks and lets the
    // runqueue have the CPU.
    loop {
        arch::halt_once();
        crate::sched::yield_now();
    }
}

/// Allocator smoke test run right after heap bring-up: slab routing, stelloc
/// routing, poison patterns, and reuse after free.
#[cfg(target_os = "none")]
fn heap_self_test() {
    use crate::mm::slab::SLAB;
    use crate::mm::stelloc::{POISON_ALLOC, STELLOC};

    let a = SLAB.alloc(24).expect("slab alloc failed");
    let c = STELLOC.alloc(2048).expect("stelloc alloc failed");

    // SAFETY: Freshly allocated, sizes as requested.
    unsafe {
        let payload = core::slice::from_raw_parts(c as *const u8, 2048);
        assert!(
            payload.iter().all(|&b| b == POISON_ALLOC),
            "stelloc alloc not poisoned"
        );
        core::ptr::write_bytes(a.as_ptr(), 0xAB, 24);
        core::ptr::write_bytes(c, 0xCD, 2048);
    }

    SLAB.free(a);
    STELLOC.free(c);

    let r = SLAB.alloc(24).expect("slab realloc failed");
    assert_eq!(r, a, "slab did not reuse the freed object");
    SLAB.free(r);

    crate::kinfo!("heap: self-test passed");
}
