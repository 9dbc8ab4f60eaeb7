//! Bindings for the Limine boot protocol.
//!
//! The protocol is a request-response mechanism: the kernel places static
//! request structures in a `.requests` linker section, the bootloader fills
//! in the matching response structures before handing over control, and the
//! kernel reads the responses through the accessors here.
//!
//! ```no_run
//! use limine::{BaseRevision, MemMapRequest};
//!
//! #[used]
//! #[unsafe(link_section = ".requests")]
//! static BASE_REVISION: BaseRevision = BaseRevision::new();
//!
//! #[used]
//! #[unsafe(link_section = ".requests")]
//! static MEMMAP: MemMapRequest = MemMapRequest::new();
//! ```
//!
//! Only the requests this kernel consumes are bound: memory map, HHDM,
//! framebuffer, RSDP, executable address, paging mode, and MP.

#![cfg_attr(not(test), no_std)]

mod request;
mod response;

pub mod memmap;
pub mod mp;

pub use request::*;
pub use response::*;
