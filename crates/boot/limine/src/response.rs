//! Response structures filled in by the bootloader.

use crate::memmap::MemMapEntry;
use crate::mp::MpInfo;

/// Response to [`MemMapRequest`](crate::MemMapRequest).
#[repr(C)]
pub struct MemMapResponse {
    /// Response revision.
    pub revision: u64,
    /// Number of memory map entries.
    pub entry_count: u64,
    /// Pointer to an array of `entry_count` entry pointers.
    entries: *const *const MemMapEntry,
}

impl MemMapResponse {
    /// Returns an iterator over the memory map entries, sorted by base.
    pub fn entries(&self) -> impl Iterator<Item = &MemMapEntry> {
        // SAFETY: The bootloader guarantees `entries` points to `entry_count`
        // valid entry pointers that stay mapped through the HHDM.
        (0..self.entry_count as usize).map(move |i| unsafe { &**self.entries.add(i) })
    }
}

/// Response to [`HhdmRequest`](crate::HhdmRequest).
#[repr(C)]
pub struct HhdmResponse {
    /// Response revision.
    pub revision: u64,
    /// Virtual offset of the higher-half direct map: `virt = phys + offset`.
    pub offset: u64,
}

/// A single framebuffer as described by the bootloader.
#[repr(C)]
pub struct Framebuffer {
    /// Virtual address of the framebuffer (HHDM-mapped).
    pub address: *mut u8,
    /// Width in pixels.
    pub width: u64,
    /// Height in pixels.
    pub height: u64,
    /// Bytes per scanline.
    pub pitch: u64,
    /// Bits per pixel.
    pub bpp: u16,
    /// Memory model (1 = RGB).
    pub memory_model: u8,
    /// Red channel mask size.
    pub red_mask_size: u8,
    /// Red channel mask shift.
    pub red_mask_shift: u8,
    /// Green channel mask size.
    pub green_mask_size: u8,
    /// Green channel mask shift.
    pub green_mask_shift: u8,
    /// Blue channel mask size.
    pub blue_mask_size: u8,
    /// Blue channel mask shift.
    pub blue_mask_shift: u8,
    /// Reserved.
    pub unused: [u8; 7],
    /// Size of the EDID blob, if any.
    pub edid_size: u64,
    /// Pointer to the EDID blob, if any.
    pub edid: *const u8,
}

/// Response to [`FramebufferRequest`](crate::FramebufferRequest).
#[repr(C)]
pub struct FramebufferResponse {
    /// Response revision.
    pub revision: u64,
    /// Number of framebuffers.
    pub framebuffer_count: u64,
    /// Pointer to an array of `framebuffer_count` framebuffer pointers.
    framebuffers: *const *const Framebuffer,
}

impl FramebufferResponse {
    /// Returns an iterator over the available framebuffers.
    pub fn framebuffers(&self) -> impl Iterator<Item = &Framebuffer> {
        // SAFETY: The bootloader guarantees the array holds
        // `framebuffer_count` valid pointers.
        (0..self.framebuffer_count as usize).map(move |i| unsafe { &**self.framebuffers.add(i) })
    }
}

/// Response to [`RsdpRequest`](crate::RsdpRequest).
#[repr(C)]
pub struct RsdpResponse {
    /// Response revision.
    pub revision: u64,
    /// Physical address of the RSDP (base revision >= 3; earlier revisions
    /// returned a virtual address here).
    pub address: u64,
}

/// Response to [`ExecutableAddressRequest`](crate::ExecutableAddressRequest).
#[repr(C)]
pub struct ExecutableAddressResponse {
    /// Response revision.
    pub revision: u64,
    /// Physical base address of the kernel image.
    pub physical_base: u64,
    /// Virtual base address of the kernel image.
    pub virtual_base: u64,
}

/// Response to [`MpRequest`](crate::MpRequest).
#[repr(C)]
pub struct MpResponse {
    /// Response revision.
    pub revision: u64,
    /// MP flags (bit 0: x2APIC enabled).
    pub flags: u32,
    /// Local APIC ID of the bootstrap processor.
    pub bsp_lapic_id: u32,
    /// Number of CPUs, BSP included.
    pub cpu_count: u64,
    /// Pointer to an array of `cpu_count` CPU info pointers.
    cpus: *const *mut MpInfo,
}

impl MpResponse {
    /// Returns an iterator over the per-CPU info structures.
    ///
    /// The structures are mutable because starting an AP requires writing
    /// its `extra_argument` and `goto_address` fields.
    pub fn cpus(&self) -> impl Iterator<Item = &MpInfo> {
        // SAFETY: The bootloader guarantees the array holds `cpu_count`
        // valid pointers to MpInfo structures in bootloader memory.
        (0..self.cpu_count as usize).map(move |i| unsafe { &**self.cpus.add(i) })
    }
}
