//! Timer and interrupt-controller hardware, consumed through the narrow
//! contracts the core needs: a timebase counter, one periodic tick source,
//! EOI, and the panic halt IPI.

pub mod hpet;
pub mod ioapic;
pub mod lapic;
pub mod pic;
pub mod pit;
pub mod tsc;
