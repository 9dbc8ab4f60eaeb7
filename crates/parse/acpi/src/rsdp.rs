//! Root System Description Pointer parsing and validation.
//!
//! The RSDP is the entry point into the ACPI table hierarchy. ACPI 1.0
//! defines a 20-byte structure; ACPI 2.0+ extends it to 36 bytes with a
//! 64-bit XSDT address and an extended checksum.

use crate::sdt::{SdtHeader, validate_checksum};
use crate::{AcpiError, AcpiHandler};

/// ACPI 1.0 RSDP, 20 bytes.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Rsdp {
    /// Must be `b"RSD PTR "` (trailing space included).
    pub signature: [u8; 8],
    /// Checksum over the first 20 bytes.
    pub checksum: u8,
    /// OEM identification string.
    pub oem_id: [u8; 6],
    /// 0 for ACPI 1.0, 2 for ACPI 2.0+.
    pub revision: u8,
    /// Physical address of the RSDT.
    pub rsdt_address: u32,
}

impl Rsdp {
    /// Size of the ACPI 1.0 structure.
    pub const SIZE: usize = 20;

    /// Expected signature bytes.
    pub const SIGNATURE: &'static [u8; 8] = b"RSD PTR ";
}

/// ACPI 2.0+ RSDP extension, 36 bytes total.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Rsdp2 {
    /// The ACPI 1.0 portion.
    pub v1: Rsdp,
    /// Total structure length (36).
    pub length: u32,
    /// Physical address of the XSDT.
    pub xsdt_address: u64,
    /// Checksum over all 36 bytes.
    pub extended_checksum: u8,
    /// Reserved.
    pub reserved: [u8; 3],
}

impl Rsdp2 {
    /// Size of the ACPI 2.0 structure.
    pub const SIZE: usize = 36;
}

/// Parses and validates the RSDP at `phys`.
///
/// Returns `(table_address, is_xsdt)`: the RSDT address for ACPI 1.0, the
/// XSDT address for 2.0+.
pub fn parse_rsdp(handler: &impl AcpiHandler, phys: u64) -> Result<(u64, bool), AcpiError> {
    // Map the larger v2 size up front; v1 parsing only reads the prefix.
    let ptr = handler.map_physical_region(phys, Rsdp2::SIZE);
    if ptr.is_null() {
        return Err(AcpiError::InvalidRsdp);
    }

    // SAFETY: The handler contract guarantees Rsdp2::SIZE readable bytes.
    let bytes = unsafe { core::slice::from_raw_parts(ptr, Rsdp2::SIZE) };
    // SAFETY: `bytes` covers the packed struct; read_unaligned tolerates any
    // alignment.
    let v1: Rsdp = unsafe { core::ptr::read_unaligned(ptr.cast()) };

    if &v1.signature != Rsdp::SIGNATURE {
        return Err(AcpiError::InvalidRsdp);
    }
    if !validate_checksum(&bytes[..Rsdp::SIZE]) {
        return Err(AcpiError::InvalidChecksum);
    }

    match v1.revision {
        0 => Ok((u64::from(v1.rsdt_address), false)),
        2 => {
            if !validate_checksum(bytes) {
                return Err(AcpiError::InvalidChecksum);
            }
            // SAFETY: same mapping, full v2 size.
            let v2: Rsdp2 = unsafe { core::ptr::read_unaligned(ptr.cast()) };
            Ok((v2.xsdt_address, true))
        }
        _ => Err(AcpiError::InvalidRevision),
    }
}

/// Walks the RSDT or XSDT for a table with the given signature and a valid
/// checksum, returning its physical address.
pub fn find_table(
    handler: &impl AcpiHandler,
    sdt_phys: u64,
    is_xsdt: bool,
    signature: &[u8; 4],
) -> Result<u64, AcpiError> {
    let table = crate::map_table(handler, sdt_phys).ok_or(AcpiError::InvalidRsdp)?;
    if !validate_checksum(table) {
        return Err(AcpiError::InvalidChecksum);
    }

    let entry_size = if is_xsdt { 8 } else { 4 };
    let entries = &table[SdtHeader::SIZE..];

    for chunk in entries.chunks_exact(entry_size) {
        let phys = if is_xsdt {
            u64::from_le_bytes(chunk.try_into().unwrap())
        } else {
            u64::from(u32::from_le_bytes(chunk.try_into().unwrap()))
        };
        let Some(candidate) = crate::map_table(handler, phys) else {
            continue;
        };
        if &candidate[..4] == signature && validate_checksum(candidate) {
            return Ok(phys);
        }
    }
    Err(AcpiError::TableNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::IdentityHandler;

    fn make_rsdp_v0(rsdt: u32) -> [u8; Rsdp2::SIZE] {
        let mut b = [0u8; Rsdp2::SIZE];
        b[..8].copy_from_slice(Rsdp::SIGNATURE);
        b[15] = 0; // revision
        b[16..20].copy_from_slice(&rsdt.to_le_bytes());
        let sum: u8 = b[..Rsdp::SIZE].iter().fold(0u8, |a, &x| a.wrapping_add(x));
        b[8] = 0u8.wrapping_sub(sum);
        b
    }

    fn make_rsdp_v2(xsdt: u64) -> [u8; Rsdp2::SIZE] {
        let mut b = [0u8; Rsdp2::SIZE];
        b[..8].copy_from_slice(Rsdp::SIGNATURE);
        b[15] = 2;
        b[20..24].copy_from_slice(&36u32.to_le_bytes());
        b[24..32].copy_from_slice(&xsdt.to_le_bytes());
        let sum: u8 = b[..Rsdp::SIZE].iter().fold(0u8, |a, &x| a.wrapping_add(x));
        b[8] = 0u8.wrapping_sub(sum);
        let sum: u8 = b.iter().fold(0u8, |a, &x| a.wrapping_add(x));
        b[32] = 0u8.wrapping_sub(sum);
        b
    }

    #[test]
    fn v0_rsdp_yields_rsdt() {
        let bytes = make_rsdp_v0(0x1234_5678);
        let handler = IdentityHandler;
        let (addr, is_xsdt) = parse_rsdp(&handler, bytes.as_ptr() as u64).unwrap();
        assert_eq!(addr, 0x1234_5678);
        assert!(!is_xsdt);
    }

    #[test]
    fn v2_rsdp_yields_xsdt() {
        let bytes = make_rsdp_v2(0xDEAD_0000);
        let handler = IdentityHandler;
        let (addr, is_xsdt) = parse_rsdp(&handler, bytes.as_ptr() as u64).unwrap();
        assert_eq!(addr, 0xDEAD_0000);
        assert!(is_xsdt);
    }

    #[test]
    fn bad_signature_rejected() {
        let mut bytes = make_rsdp_v0(0);
        bytes[0] = b'X';
        let handler = IdentityHandler;
        assert_eq!(
            parse_rsdp(&handler, bytes.as_ptr() as u64),
            Err(AcpiError::InvalidRsdp)
        );
    }

    #[test]
    fn bad_checksum_rejected() {
        let mut bytes = make_rsdp_v0(0);
        bytes[10] ^= 0xFF;
        let handler = IdentityHandler;
        assert_eq!(
            parse_rsdp(&handler, bytes.as_ptr() as u64),
            Err(AcpiError::InvalidChecksum)
        );
    }
}
