//! Multiple APIC Description Table (`APIC`) parsing.
//!
//! The kernel core reads three things out of the MADT: the local APIC
//! physical base (with the 64-bit override applied when present), and the
//! first I/O APIC's address and GSI base.

use crate::sdt::{SdtHeader, validate_checksum};
use crate::{AcpiError, AcpiHandler};

/// MADT table signature.
pub const MADT_SIGNATURE: &[u8; 4] = b"APIC";

/// A single I/O APIC as described by the MADT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoApic {
    /// I/O APIC ID.
    pub id: u8,
    /// Physical address of the register window.
    pub address: u32,
    /// Global System Interrupt number of the first input pin.
    pub gsi_base: u32,
}

/// The MADT fields the kernel consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Madt {
    /// Physical address of the local APIC, override applied.
    pub local_apic_address: u64,
    /// MADT flags (bit 0: dual 8259 PICs installed).
    pub flags: u32,
    /// The first I/O APIC entry, if any.
    pub io_apic: Option<IoApic>,
}

// Interrupt controller structure types we care about. Type 0 (local APIC)
// entries enumerate CPUs; the core gets its CPU list from the bootloader MP
// response instead, so they are skipped like every other unhandled type.
const ENTRY_IO_APIC: u8 = 1;
const ENTRY_LAPIC_ADDR_OVERRIDE: u8 = 5;

impl Madt {
    /// Parses the MADT at `phys`, validating signature and checksum.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        let table = crate::map_table(handler, phys).ok_or(AcpiError::TableNotFound)?;
        if &table[..4] != MADT_SIGNATURE {
            return Err(AcpiError::InvalidSignature);
        }
        if !validate_checksum(table) {
            return Err(AcpiError::InvalidChecksum);
        }

        // Fixed fields after the SDT header: lapic address (u32) + flags (u32).
        let fixed = &table[SdtHeader::SIZE..];
        if fixed.len() < 8 {
            return Err(AcpiError::InvalidSignature);
        }
        let mut local_apic_address =
            u64::from(u32::from_le_bytes(fixed[0..4].try_into().unwrap()));
        let flags = u32::from_le_bytes(fixed[4..8].try_into().unwrap());

        let mut io_apic = None;

        // Walk the variable-length interrupt controller entries. Each entry
        // starts with {type: u8, length: u8}.
        let mut rest = &fixed[8..];
        while rest.len() >= 2 {
            let entry_type = rest[0];
            let len = rest[1] as usize;
            if len < 2 || len > rest.len() {
                break;
            }
            let body = &rest[2..len];
            match entry_type {
                ENTRY_IO_APIC if io_apic.is_none() && body.len() >= 10 => {
                    io_apic = Some(IoApic {
                        id: body[0],
                        address: u32::from_le_bytes(body[2..6].try_into().unwrap()),
                        gsi_base: u32::from_le_bytes(body[6..10].try_into().unwrap()),
                    });
                }
                ENTRY_LAPIC_ADDR_OVERRIDE if body.len() >= 10 => {
                    local_apic_address = u64::from_le_bytes(body[2..10].try_into().unwrap());
                }
                _ => {}
            }
            rest = &rest[len..];
        }

        Ok(Self {
            local_apic_address,
            flags,
            io_apic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::IdentityHandler;

    fn finish_table(mut bytes: Vec<u8>) -> Vec<u8> {
        let len = bytes.len() as u32;
        bytes[4..8].copy_from_slice(&len.to_le_bytes());
        let sum: u8 = bytes.iter().fold(0u8, |a, &x| a.wrapping_add(x));
        bytes[9] = bytes[9].wrapping_sub(sum);
        bytes
    }

    fn madt_with(entries: &[u8]) -> Vec<u8> {
        let mut b = vec![0u8; SdtHeader::SIZE];
        b[..4].copy_from_slice(MADT_SIGNATURE);
        b.extend_from_slice(&0xFEE0_0000u32.to_le_bytes()); // lapic base
        b.extend_from_slice(&1u32.to_le_bytes()); // flags: PCAT_COMPAT
        b.extend_from_slice(entries);
        finish_table(b)
    }

    #[test]
    fn parses_lapic_base_and_flags() {
        let bytes = madt_with(&[]);
        let madt = Madt::parse(&IdentityHandler, bytes.as_ptr() as u64).unwrap();
        assert_eq!(madt.local_apic_address, 0xFEE0_0000);
        assert_eq!(madt.flags, 1);
        assert!(madt.io_apic.is_none());
    }

    #[test]
    fn picks_first_ioapic() {
        let mut entries = Vec::new();
        // Two I/O APIC entries; only the first should be kept.
        for (id, addr, gsi) in [(2u8, 0xFEC0_0000u32, 0u32), (3, 0xFEC1_0000, 24)] {
            entries.push(1); // type
            entries.push(12); // length
            entries.push(id);
            entries.push(0); // reserved
            entries.extend_from_slice(&addr.to_le_bytes());
            entries.extend_from_slice(&gsi.to_le_bytes());
        }
        let bytes = madt_with(&entries);
        let madt = Madt::parse(&IdentityHandler, bytes.as_ptr() as u64).unwrap();
        assert_eq!(
            madt.io_apic,
            Some(IoApic {
                id: 2,
                address: 0xFEC0_0000,
                gsi_base: 0
            })
        );
    }

    #[test]
    fn lapic_override_wins() {
        let mut entries = Vec::new();
        entries.push(5); // LAPIC address override
        entries.push(12);
        entries.extend_from_slice(&[0, 0]); // reserved
        entries.extend_from_slice(&0x0000_00FE_E100_0000u64.to_le_bytes());
        let bytes = madt_with(&entries);
        let madt = Madt::parse(&IdentityHandler, bytes.as_ptr() as u64).unwrap();
        assert_eq!(madt.local_apic_address, 0x0000_00FE_E100_0000);
    }

    #[test]
    fn bad_checksum_rejected() {
        let mut bytes = madt_with(&[]);
        bytes[20] ^= 0x55;
        assert_eq!(
            Madt::parse(&IdentityHandler, bytes.as_ptr() as u64),
            Err(AcpiError::InvalidChecksum)
        );
    }

    #[test]
    fn wrong_signature_rejected() {
        let mut bytes = madt_with(&[]);
        bytes[..4].copy_from_slice(b"HPET");
        // Re-balance the checksum so only the signature is wrong.
        let sum: u8 = bytes.iter().fold(0u8, |a, &x| a.wrapping_add(x));
        bytes[9] = bytes[9].wrapping_sub(sum);
        assert_eq!(
            Madt::parse(&IdentityHandler, bytes.as_ptr() as u64),
            Err(AcpiError::InvalidSignature)
        );
    }
}
