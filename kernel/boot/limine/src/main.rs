//! Limine boot stub for the Meson kernel.
//!
//! The Limine-specific entry point: declares the protocol requests,
//! converts the responses into the kernel's [`BootInfoData`], and calls
//! [`kernel_init`](meson_kernel::kernel_init). The kernel keeps running on
//! the bootloader-built page tables; the vmm adopts them through CR3.

#![no_std]
#![no_main]

mod requests;

use meson_core::addr::PhysAddr;
use meson_kernel::boot::{
    BootInfoData, FramebufferInfo, MAX_FRAMEBUFFERS, MAX_MEMORY_REGIONS, MAX_SMP_CPUS,
    MemoryRegion, MemoryRegionKind, SmpCpu,
};
use requests::REQUESTS;

use limine::memmap::MemMapEntryType;

/// Limine entry point: the bootloader jumps here with interrupts disabled
/// after filling in the request responses.
#[unsafe(no_mangle)]
extern "C" fn _start() -> ! {
    assert!(
        REQUESTS.base_revision.is_supported(),
        "Limine base revision not supported"
    );

    let mut boot_info = BootInfoData::empty();

    boot_info.hhdm_offset = REQUESTS
        .hhdm
        .response()
        .map(|r| r.offset)
        .unwrap_or(0);

    if let Some(memmap) = REQUESTS.memmap.response() {
        for entry in memmap.entries() {
            if boot_info.memory_map.len() == MAX_MEMORY_REGIONS {
                break;
            }
            let kind = match entry.entry_type() {
                Some(MemMapEntryType::Usable) => MemoryRegionKind::Usable,
                Some(MemMapEntryType::Reserved) => MemoryRegionKind::Reserved,
                Some(MemMapEntryType::AcpiReclaimable) => MemoryRegionKind::AcpiReclaimable,
                Some(MemMapEntryType::BootloaderReclaimable) => {
                    MemoryRegionKind::BootloaderReclaimable
                }
                Some(MemMapEntryType::KernelAndModules) => MemoryRegionKind::KernelAndModules,
                Some(MemMapEntryType::Framebuffer) => MemoryRegionKind::Framebuffer,
                _ => MemoryRegionKind::Other,
            };
            boot_info.memory_map.push(MemoryRegion {
                start: PhysAddr::new(entry.base),
                size: entry.length,
                kind,
            });
        }
    }

    if let Some(fbs) = REQUESTS.framebuffer.response() {
        for fb in fbs.framebuffers() {
            if boot_info.framebuffers.len() == MAX_FRAMEBUFFERS {
                break;
            }
            boot_info.framebuffers.push(FramebufferInfo {
                address: fb.address as u64,
                width: fb.width as u32,
                height: fb.height as u32,
                pitch: fb.pitch as u32,
                bpp: fb.bpp,
            });
        }
    }

    boot_info.rsdp_address = REQUESTS.rsdp.response().map(|r| r.address);
    boot_info.kernel_virtual_base = REQUESTS
        .executable_address
        .response()
        .map(|r| r.virtual_base)
        .unwrap_or(0);

    if let Some(mp) = REQUESTS.mp.response() {
        boot_info.bsp_lapic_id = mp.bsp_lapic_id;
        for cpu in mp.cpus() {
            if cpu.lapic_id == mp.bsp_lapic_id {
                continue;
            }
            if boot_info.smp_cpus.len() == MAX_SMP_CPUS {
                break;
            }
            // Hand the kernel raw pointers to the descriptor's control
            // fields; the MpInfo layout is shared with RawMpInfo.
            let info = cpu as *const limine::mp::MpInfo as *mut u8;
            // SAFETY: Field offsets per the Limine MP layout: goto_address
            // at 16, extra_argument at 24.
            unsafe {
                boot_info.smp_cpus.push(SmpCpu {
                    processor_id: cpu.processor_id,
                    lapic_id: cpu.lapic_id,
                    goto_address_ptr: info.add(16).cast::<u64>(),
                    extra_argument_ptr: info.add(24).cast::<u64>(),
                });
            }
        }
    }

    meson_kernel::kernel_init(&boot_info)
}
