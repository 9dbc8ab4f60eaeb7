//! Minimal ACPI table parsing for the Meson kernel.
//!
//! Covers exactly the tables and fields the kernel core consumes: the RSDP
//! (to find the RSDT or XSDT), the MADT (`APIC`: local APIC base, 64-bit
//! address override, the first I/O APIC), and the HPET table (MMIO address
//! space and base). Every table is validated by signature and checksum
//! before any field is trusted.
//!
//! Physical memory access goes through the [`AcpiHandler`] trait so the
//! parser itself stays host-testable: the kernel maps via the HHDM, tests
//! hand out pointers into byte buffers.

#![cfg_attr(not(test), no_std)]

pub mod hpet;
pub mod madt;
pub mod rsdp;
pub mod sdt;

/// Errors produced while locating or validating ACPI tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    /// The RSDP signature or layout is wrong.
    InvalidRsdp,
    /// A table signature did not match the expected value.
    InvalidSignature,
    /// A table checksum did not sum to zero.
    InvalidChecksum,
    /// The RSDP revision is one this parser does not understand.
    InvalidRevision,
    /// The requested table is not present in the (R/X)SDT.
    TableNotFound,
}

impl core::fmt::Display for AcpiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidRsdp => write!(f, "invalid RSDP"),
            Self::InvalidSignature => write!(f, "table signature mismatch"),
            Self::InvalidChecksum => write!(f, "table checksum mismatch"),
            Self::InvalidRevision => write!(f, "unsupported RSDP revision"),
            Self::TableNotFound => write!(f, "table not found"),
        }
    }
}

/// Maps physical table memory for the parser.
///
/// # Safety
///
/// Implementations must return pointers that are valid for reads of `size`
/// bytes and that remain valid for the lifetime of the parse.
pub unsafe trait AcpiHandler {
    /// Maps `size` bytes of physical memory at `phys` and returns a pointer
    /// to the mapping.
    fn map_physical_region(&self, phys: u64, size: usize) -> *const u8;
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::AcpiHandler;

    /// Test handler: "physical" addresses are host pointers.
    pub struct IdentityHandler;

    // SAFETY: Tests pass addresses of live buffers they own.
    unsafe impl AcpiHandler for IdentityHandler {
        fn map_physical_region(&self, phys: u64, _size: usize) -> *const u8 {
            phys as *const u8
        }
    }
}

/// Reads a whole table as a byte slice after learning its length from the
/// SDT header.
///
/// Returns `None` when the header itself cannot be read.
pub(crate) fn map_table<'a>(handler: &impl AcpiHandler, phys: u64) -> Option<&'a [u8]> {
    let header_ptr = handler.map_physical_region(phys, sdt::SdtHeader::SIZE);
    if header_ptr.is_null() {
        return None;
    }
    // SAFETY: The handler contract guarantees SdtHeader::SIZE readable bytes.
    let header = unsafe { sdt::SdtHeader::read(header_ptr) };
    let len = header.length as usize;
    if len < sdt::SdtHeader::SIZE {
        return None;
    }
    let table_ptr = handler.map_physical_region(phys, len);
    // SAFETY: The handler contract guarantees `len` readable bytes.
    Some(unsafe { core::slice::from_raw_parts(table_ptr, len) })
}
