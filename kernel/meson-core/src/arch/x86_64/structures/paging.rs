//! x86_64 page-table structures: entries, tables, and fault codes.

use crate::addr::PhysAddr;

/// Physical address mask inside a page-table entry: bits 12..51.
pub const PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags::bitflags! {
    /// Page-table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Entry is present.
        const PRESENT       = 1 << 0;
        /// Page is writable.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from ring 3.
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// PS bit: 2 MiB page in a PD entry, 1 GiB in a PDPT entry.
        const HUGE_PAGE     = 1 << 7;
        /// Not flushed on CR3 switch (requires CR4.PGE).
        const GLOBAL        = 1 << 8;
        /// No-execute (requires EFER.NXE).
        const NO_EXECUTE    = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Page-fault error code pushed by the CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u64 {
        /// 1 = protection violation, 0 = non-present page.
        const PRESENT           = 1 << 0;
        /// The fault was a write.
        const WRITE             = 1 << 1;
        /// The fault occurred in user mode.
        const USER              = 1 << 2;
        /// A reserved bit was set in a paging structure.
        const RESERVED_WRITE    = 1 << 3;
        /// The fault was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// One 64-bit page-table entry.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// A zero (not-present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds an entry pointing at `phys` with `flags`.
    pub const fn new(phys: PhysAddr, flags: PageTableFlags) -> Self {
        Self((phys.as_u64() & PTE_ADDR_MASK) | flags.bits())
    }

    /// Returns whether the PRESENT bit is set.
    pub const fn is_present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Returns the physical address this entry points at.
    pub const fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & PTE_ADDR_MASK)
    }

    /// Returns the flag bits of this entry.
    pub const fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0 & !PTE_ADDR_MASK)
    }

    /// Returns the raw 64-bit value.
    pub const fn bits(self) -> u64 {
        self.0
    }
}

/// A page table: 512 entries, 4 KiB, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    /// The 512 entries.
    pub entries: [PageTableEntry; 512],
}

impl PageTable {
    /// Clears every entry.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_entry_not_present() {
        assert!(!PageTableEntry::empty().is_present());
    }

    #[test]
    fn entry_round_trips_address_and_flags() {
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
        let e = PageTableEntry::new(PhysAddr::new(0x1234_5000), flags);
        assert!(e.is_present());
        assert_eq!(e.address().as_u64(), 0x1234_5000);
        assert_eq!(e.flags(), flags);
    }

    #[test]
    fn address_and_flags_do_not_bleed() {
        let e = PageTableEntry::new(
            PhysAddr::new(0x000F_FFFF_FFFF_F000),
            PageTableFlags::PRESENT | PageTableFlags::NO_EXECUTE,
        );
        assert_eq!(e.address().as_u64() & !PTE_ADDR_MASK, 0);
        assert_eq!(e.flags().bits() & PTE_ADDR_MASK, 0);
    }

    #[test]
    fn table_is_one_page() {
        assert_eq!(core::mem::size_of::<PageTable>(), 4096);
        assert_eq!(core::mem::align_of::<PageTable>(), 4096);
    }

    #[test]
    fn fault_code_decodes() {
        let code = PageFaultErrorCode::from_bits_truncate(0b10);
        assert!(code.contains(PageFaultErrorCode::WRITE));
        assert!(!code.contains(PageFaultErrorCode::PRESENT));
    }
}
