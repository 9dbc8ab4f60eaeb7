//! IDT construction and loading.
//!
//! One global 256-entry table, built exactly once (the `LazyLock` is the
//! build lock) with every vector pointing at its naked stub as an interrupt
//! gate at DPL 0. Each CPU loads the same table.

use meson_core::arch::x86_64::structures::gdt;
use meson_core::arch::x86_64::structures::idt::InterruptDescriptorTable;
use meson_core::sync::LazyLock;

use super::interrupts::stubs;

static IDT: LazyLock<InterruptDescriptorTable> = LazyLock::new(|| {
    let mut idt = InterruptDescriptorTable::new();
    for (vector, stub) in stubs::STUBS.iter().enumerate() {
        idt.entries[vector].set_handler_addr(*stub as usize as u64, gdt::KERNEL_CODE);
    }
    idt
});

/// Loads the shared IDT on this CPU.
///
/// # Safety
///
/// The GDT must be loaded (the entries carry the kernel code selector).
pub unsafe fn init() {
    // SAFETY: The table is a live static; every entry points at a stub.
    unsafe { IDT.force().load() };
    crate::kdebug!("idt: 256 vectors loaded");
}
