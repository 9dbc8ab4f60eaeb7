//! Memory map entry types.

/// The type of a memory map entry.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemMapEntryType {
    /// Usable RAM.
    Usable = 0,
    /// Reserved by firmware or hardware.
    Reserved = 1,
    /// ACPI tables, reclaimable after parsing.
    AcpiReclaimable = 2,
    /// ACPI NVS memory; must not be touched.
    AcpiNvs = 3,
    /// Defective memory.
    BadMemory = 4,
    /// Bootloader memory, reclaimable after boot services are done.
    BootloaderReclaimable = 5,
    /// Kernel image and loaded modules.
    KernelAndModules = 6,
    /// Framebuffer memory.
    Framebuffer = 7,
}

/// A single contiguous physical memory region.
#[repr(C)]
pub struct MemMapEntry {
    /// Physical start address of the region.
    pub base: u64,
    /// Length of the region in bytes.
    pub length: u64,
    /// Region type. Raw `u64` so unknown future types do not invoke UB;
    /// use [`MemMapEntry::entry_type`] to decode.
    pub entry_type: u64,
}

impl MemMapEntry {
    /// Decodes the entry type, returning `None` for values this binding
    /// does not know about.
    #[must_use]
    pub fn entry_type(&self) -> Option<MemMapEntryType> {
        Some(match self.entry_type {
            0 => MemMapEntryType::Usable,
            1 => MemMapEntryType::Reserved,
            2 => MemMapEntryType::AcpiReclaimable,
            3 => MemMapEntryType::AcpiNvs,
            4 => MemMapEntryType::BadMemory,
            5 => MemMapEntryType::BootloaderReclaimable,
            6 => MemMapEntryType::KernelAndModules,
            7 => MemMapEntryType::Framebuffer,
            _ => return None,
        })
    }

    /// Returns `true` for plain usable RAM.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.entry_type == MemMapEntryType::Usable as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_decodes() {
        let e = MemMapEntry {
            base: 0x1000,
            length: 0x2000,
            entry_type: 0,
        };
        assert!(e.is_usable());
        assert_eq!(e.entry_type(), Some(MemMapEntryType::Usable));
    }

    #[test]
    fn unknown_type_is_none() {
        let e = MemMapEntry {
            base: 0,
            length: 0,
            entry_type: 99,
        };
        assert!(!e.is_usable());
        assert_eq!(e.entry_type(), None);
    }
}
