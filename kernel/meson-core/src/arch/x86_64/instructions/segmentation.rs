//! Segment register loads and descriptor-table instructions.

use crate::arch::x86_64::structures::gdt::{DescriptorTablePointer, SegmentSelector};

/// Loads the GDTR.
///
/// # Safety
///
/// `ptr` must describe a valid GDT that outlives its use; segment registers
/// must be reloaded afterwards.
#[inline]
pub unsafe fn lgdt(ptr: &DescriptorTablePointer) {
    // SAFETY: Forwarded to the caller.
    unsafe {
        core::arch::asm!(
            "lgdt [{}]",
            in(reg) ptr,
            options(readonly, nostack, preserves_flags),
        );
    }
}

/// Reads the current code segment selector.
#[inline]
pub fn read_cs() -> SegmentSelector {
    let cs: u16;
    // SAFETY: Reading CS has no side effects.
    unsafe {
        core::arch::asm!("mov {0:x}, cs", out(reg) cs, options(nomem, nostack, preserves_flags));
    }
    SegmentSelector::new(cs >> 3, (cs & 0b11) as u8)
}

/// Loads CS via a far return.
///
/// # Safety
///
/// `sel` must select a valid 64-bit code descriptor in the loaded GDT.
#[inline]
pub unsafe fn set_cs(sel: SegmentSelector) {
    // SAFETY: The push/retfq pair transfers to the next instruction with the
    // new CS; caller guarantees the selector is valid.
    unsafe {
        core::arch::asm!(
            "push {sel}",
            "lea {tmp}, [rip + 55f]",
            "push {tmp}",
            "retfq",
            "55:",
            sel = in(reg) u64::from(sel.as_u16()),
            tmp = lateout(reg) _,
            options(preserves_flags),
        );
    }
}

/// Loads SS.
///
/// # Safety
///
/// `sel` must select a valid writable data descriptor (or null in ring 0).
#[inline]
pub unsafe fn load_ss(sel: SegmentSelector) {
    // SAFETY: Forwarded to the caller.
    unsafe {
        core::arch::asm!("mov ss, {0:x}", in(reg) sel.as_u16(), options(nostack, preserves_flags));
    }
}

/// Loads DS.
///
/// # Safety
///
/// Same contract as [`load_ss`].
#[inline]
pub unsafe fn load_ds(sel: SegmentSelector) {
    // SAFETY: Forwarded to the caller.
    unsafe {
        core::arch::asm!("mov ds, {0:x}", in(reg) sel.as_u16(), options(nostack, preserves_flags));
    }
}

/// Loads ES.
///
/// # Safety
///
/// Same contract as [`load_ss`].
#[inline]
pub unsafe fn load_es(sel: SegmentSelector) {
    // SAFETY: Forwarded to the caller.
    unsafe {
        core::arch::asm!("mov es, {0:x}", in(reg) sel.as_u16(), options(nostack, preserves_flags));
    }
}

/// Loads FS.
///
/// # Safety
///
/// Same contract as [`load_ss`]; clears the FS base on many CPUs.
#[inline]
pub unsafe fn load_fs(sel: SegmentSelector) {
    // SAFETY: Forwarded to the caller.
    unsafe {
        core::arch::asm!("mov fs, {0:x}", in(reg) sel.as_u16(), options(nostack, preserves_flags));
    }
}

/// Loads GS.
///
/// # Safety
///
/// Same contract as [`load_ss`]; clears the GS base MSR on many CPUs, so
/// set `IA32_GS_BASE` afterwards, not before.
#[inline]
pub unsafe fn load_gs(sel: SegmentSelector) {
    // SAFETY: Forwarded to the caller.
    unsafe {
        core::arch::asm!("mov gs, {0:x}", in(reg) sel.as_u16(), options(nostack, preserves_flags));
    }
}

/// Loads the task register.
///
/// # Safety
///
/// `sel` must select a valid, available 64-bit TSS descriptor in the loaded
/// GDT; `ltr` marks it busy.
#[inline]
pub unsafe fn load_tss(sel: SegmentSelector) {
    // SAFETY: Forwarded to the caller.
    unsafe {
        core::arch::asm!("ltr {0:x}", in(reg) sel.as_u16(), options(nostack, preserves_flags));
    }
}
