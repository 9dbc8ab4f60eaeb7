//! Interrupt entry plumbing: per-vector naked stubs and the default
//! exception handlers.

pub mod exceptions;
pub mod stubs;
