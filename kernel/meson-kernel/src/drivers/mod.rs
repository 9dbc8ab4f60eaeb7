//! In-tree device drivers consumed through narrow contracts.

pub mod uart16550;
