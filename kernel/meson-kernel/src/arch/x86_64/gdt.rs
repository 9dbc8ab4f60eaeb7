//! Per-CPU GDT and TSS setup.
//!
//! Every CPU gets its own GDT blob and TSS out of statically bounded
//! arrays. The layout is fixed (null, kernel code, kernel data, user data,
//! user code, 16-byte TSS descriptor), so the selectors are constants in
//! `meson_core::arch::x86_64::structures::gdt`.

use core::cell::UnsafeCell;

use meson_core::arch::x86_64::instructions::segmentation;
use meson_core::arch::x86_64::structures::gdt::{
    self, DescriptorTablePointer, GdtBlob, SegmentSelector, TaskStateSegment,
};

use super::MAX_CPUS;

/// `UnsafeCell` wrapper that is `Sync`.
///
/// Each CPU only writes its own slot, during its own bring-up or with
/// interrupts disabled; the CPU core reads the TSS directly from memory.
#[repr(transparent)]
struct SyncUnsafeCell<T>(UnsafeCell<T>);

// SAFETY: Slot access is partitioned by CPU index.
unsafe impl<T> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    const fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }

    fn get(&self) -> *mut T {
        self.0.get()
    }
}

static GDT_BLOBS: SyncUnsafeCell<[GdtBlob; MAX_CPUS]> =
    SyncUnsafeCell::new([GdtBlob::empty(); MAX_CPUS]);

static TSS_ARRAY: SyncUnsafeCell<[TaskStateSegment; MAX_CPUS]> =
    SyncUnsafeCell::new([TaskStateSegment::new(); MAX_CPUS]);

/// Builds and loads this CPU's GDT and TSS.
///
/// # Safety
///
/// - `cpu_index` must be this CPU's index, unique across CPUs.
/// - Must be called with interrupts disabled, once per CPU.
pub unsafe fn init(cpu_index: usize) {
    let cpu_index = if cpu_index >= MAX_CPUS { 0 } else { cpu_index };

    // SAFETY: This CPU owns slot `cpu_index`; no other CPU touches it.
    let blob = unsafe {
        let tss = &mut (*TSS_ARRAY.get())[cpu_index];
        *tss = TaskStateSegment::new();
        let blob = &mut (*GDT_BLOBS.get())[cpu_index];
        blob.fill(tss as *const TaskStateSegment as u64);
        blob
    };

    let gdtr = DescriptorTablePointer {
        limit: (core::mem::size_of::<GdtBlob>() - 1) as u16,
        base: blob as *const GdtBlob as u64,
    };

    // SAFETY: The blob is a live static with valid descriptors; the segment
    // reloads match its fixed layout.
    unsafe {
        segmentation::lgdt(&gdtr);
        segmentation::set_cs(gdt::KERNEL_CODE);
        segmentation::load_ds(gdt::KERNEL_DATA);
        segmentation::load_ss(gdt::KERNEL_DATA);
        segmentation::load_es(SegmentSelector::new(0, 0));
        segmentation::load_fs(SegmentSelector::new(0, 0));
        segmentation::load_gs(SegmentSelector::new(0, 0));
        segmentation::load_tss(gdt::TSS);
    }

    crate::kdebug!("gdt: cpu {} descriptor tables loaded", cpu_index);
}

/// Updates RSP0 in this CPU's TSS for future ring transitions.
///
/// # Safety
///
/// - `rsp0` must point at the top of a valid, mapped kernel stack.
/// - Must be called with interrupts disabled.
pub unsafe fn set_rsp0(rsp0: u64) {
    let cpu_index = crate::percpu::cpu_index();
    // SAFETY: This CPU owns its TSS slot; the hardware reads it only on
    // privilege transitions, which cannot race this store with interrupts
    // disabled.
    unsafe {
        (*TSS_ARRAY.get())[cpu_index].rsp0 = rsp0;
    }
}
