//! High Precision Event Timer (`HPET`) table parsing.

use crate::sdt::{SdtHeader, validate_checksum};
use crate::{AcpiError, AcpiHandler};

/// HPET table signature.
pub const HPET_SIGNATURE: &[u8; 4] = b"HPET";

/// Address space ID for memory-mapped I/O in a Generic Address Structure.
pub const ADDRESS_SPACE_MMIO: u8 = 0;

/// ACPI Generic Address Structure describing the HPET register block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericAddress {
    /// Address space ID (0 = system memory, 1 = system I/O).
    pub address_space_id: u8,
    /// Register bit width.
    pub register_bit_width: u8,
    /// Register bit offset.
    pub register_bit_offset: u8,
    /// Address within the given space.
    pub address: u64,
}

/// The HPET table fields the kernel consumes.
#[derive(Debug, Clone, Copy)]
pub struct HpetTable {
    /// Hardware ID of the event timer block.
    pub event_timer_block_id: u32,
    /// Base address of the register block.
    pub base_address: GenericAddress,
    /// HPET sequence number.
    pub hpet_number: u8,
    /// Minimum clock tick in periodic mode.
    pub minimum_tick: u16,
}

impl HpetTable {
    /// Parses the HPET table at `phys`, validating signature and checksum.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        let table = crate::map_table(handler, phys).ok_or(AcpiError::TableNotFound)?;
        if &table[..4] != HPET_SIGNATURE {
            return Err(AcpiError::InvalidSignature);
        }
        if !validate_checksum(table) {
            return Err(AcpiError::InvalidChecksum);
        }

        let body = &table[SdtHeader::SIZE..];
        // event_timer_block_id (4) + GAS (12) + hpet_number (1) + min_tick (2).
        if body.len() < 19 {
            return Err(AcpiError::InvalidSignature);
        }

        Ok(Self {
            event_timer_block_id: u32::from_le_bytes(body[0..4].try_into().unwrap()),
            base_address: GenericAddress {
                address_space_id: body[4],
                register_bit_width: body[5],
                register_bit_offset: body[6],
                address: u64::from_le_bytes(body[8..16].try_into().unwrap()),
            },
            hpet_number: body[16],
            minimum_tick: u16::from_le_bytes(body[17..19].try_into().unwrap()),
        })
    }

    /// Returns `true` when the register block is memory-mapped (the only
    /// access method the kernel supports).
    #[must_use]
    pub fn is_mmio(&self) -> bool {
        self.base_address.address_space_id == ADDRESS_SPACE_MMIO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::IdentityHandler;

    fn hpet_table(space_id: u8, base: u64) -> Vec<u8> {
        let mut b = vec![0u8; SdtHeader::SIZE];
        b[..4].copy_from_slice(HPET_SIGNATURE);
        b.extend_from_slice(&0x8086_A201u32.to_le_bytes()); // block id
        b.push(space_id);
        b.push(64); // bit width
        b.push(0); // bit offset
        b.push(0); // reserved
        b.extend_from_slice(&base.to_le_bytes());
        b.push(0); // hpet number
        b.extend_from_slice(&0x80u16.to_le_bytes()); // minimum tick
        b.push(0); // page protection
        let len = b.len() as u32;
        b[4..8].copy_from_slice(&len.to_le_bytes());
        let sum: u8 = b.iter().fold(0u8, |a, &x| a.wrapping_add(x));
        b[9] = b[9].wrapping_sub(sum);
        b
    }

    #[test]
    fn parses_mmio_base() {
        let bytes = hpet_table(ADDRESS_SPACE_MMIO, 0xFED0_0000);
        let hpet = HpetTable::parse(&IdentityHandler, bytes.as_ptr() as u64).unwrap();
        assert!(hpet.is_mmio());
        assert_eq!(hpet.base_address.address, 0xFED0_0000);
        assert_eq!(hpet.minimum_tick, 0x80);
    }

    #[test]
    fn io_space_not_mmio() {
        let bytes = hpet_table(1, 0x400);
        let hpet = HpetTable::parse(&IdentityHandler, bytes.as_ptr() as u64).unwrap();
        assert!(!hpet.is_mmio());
    }

    #[test]
    fn corrupt_checksum_rejected() {
        let mut bytes = hpet_table(0, 0xFED0_0000);
        bytes[40] ^= 1;
        assert!(matches!(
            HpetTable::parse(&IdentityHandler, bytes.as_ptr() as u64),
            Err(AcpiError::InvalidChecksum)
        ));
    }
}
