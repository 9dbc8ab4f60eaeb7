//! Meson kernel foundation crate.
//!
//! Pure-logic building blocks shared by the kernel proper: typed addresses,
//! the logging macro layer, spin-based synchronization, descriptor-table and
//! page-table structures, the 4-level page-table walker, and the 128-bit
//! time arithmetic. Everything here compiles for the host so the algorithms
//! carry unit tests; only the kernel crate adds `target_os = "none"` glue.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod log;
pub mod sync;
pub mod time;

#[cfg(target_arch = "x86_64")]
pub mod arch;
