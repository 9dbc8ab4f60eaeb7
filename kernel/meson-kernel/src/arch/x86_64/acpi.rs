//! Kernel-side ACPI glue.
//!
//! Locates the MADT and HPET tables through the `meson-acpi` parser and
//! publishes the handful of fields the core consumes: the LAPIC base
//! (override applied), the first I/O APIC, and the HPET register block.
//! Table memory is mapped page-by-page into the HHDM window before the
//! parser touches it, since firmware tables can live outside the regions
//! the bootloader pre-mapped.

use meson_acpi::hpet::HpetTable;
use meson_acpi::madt::Madt;
use meson_acpi::rsdp::{find_table, parse_rsdp};
use meson_acpi::{AcpiError, AcpiHandler};
use meson_core::addr::PhysAddr;

use crate::mm::vmm;

/// [`AcpiHandler`] that maps tables through the HHDM on demand.
struct HhdmHandler {
    hhdm_offset: u64,
}

// SAFETY: Every page of the requested range is mapped before the pointer is
// returned, and HHDM mappings are never torn down.
unsafe impl AcpiHandler for HhdmHandler {
    fn map_physical_region(&self, phys: u64, size: usize) -> *const u8 {
        let start = PhysAddr::new(phys).align_down(0x1000);
        let end = PhysAddr::new(phys + size as u64).align_up(0x1000);
        let mut page = start;
        while page < end {
            if vmm::map_page(
                meson_core::addr::VirtAddr::new_truncate(self.hhdm_offset + page.as_u64()),
                page,
                meson_core::arch::x86_64::structures::paging::PageTableFlags::WRITABLE,
            )
            .is_err()
            {
                return core::ptr::null();
            }
            page = page + 0x1000;
        }
        (self.hhdm_offset + phys) as *const u8
    }
}

/// The ACPI facts the kernel keeps.
#[derive(Debug, Clone, Copy)]
pub struct AcpiInfo {
    /// LAPIC physical base, address override applied.
    pub lapic_phys: u64,
    /// First I/O APIC, when present.
    pub io_apic: Option<meson_acpi::madt::IoApic>,
    /// HPET table, when present and memory-mapped.
    pub hpet: Option<HpetTable>,
}

/// Parses the tables and wires up the LAPIC, I/O APIC, and HPET drivers.
pub fn init(rsdp_phys: u64, hhdm_offset: u64) -> Result<AcpiInfo, AcpiError> {
    let handler = HhdmHandler { hhdm_offset };

    let (sdt_phys, is_xsdt) = parse_rsdp(&handler, rsdp_phys)?;
    crate::kdebug!(
        "acpi: {} at {:#x}",
        if is_xsdt { "XSDT" } else { "RSDT" },
        sdt_phys
    );

    let madt_phys = find_table(&handler, sdt_phys, is_xsdt, meson_acpi::madt::MADT_SIGNATURE)?;
    let madt = Madt::parse(&handler, madt_phys)?;
    crate::kinfo!("acpi: LAPIC base {:#x}", madt.local_apic_address);

    // Map the LAPIC registers and hand the base to the driver.
    if let Ok(virt) = vmm::ioremap(PhysAddr::new(madt.local_apic_address), 0x1000) {
        super::hw::lapic::set_base(virt);
    }

    if let Some(io_apic) = madt.io_apic {
        if let Ok(virt) = vmm::ioremap(PhysAddr::new(u64::from(io_apic.address)), 0x1000) {
            super::hw::ioapic::set_base(virt, io_apic.gsi_base);
            crate::kinfo!(
                "acpi: IOAPIC {:#x} gsi base {}",
                io_apic.address,
                io_apic.gsi_base
            );
        }
    }

    let hpet = match find_table(&handler, sdt_phys, is_xsdt, meson_acpi::hpet::HPET_SIGNATURE) {
        Ok(hpet_phys) => {
            let table = HpetTable::parse(&handler, hpet_phys)?;
            if table.is_mmio() {
                match vmm::ioremap(PhysAddr::new(table.base_address.address), 0x400) {
                    Ok(virt) if super::hw::hpet::set_base(virt) => {
                        crate::kinfo!("acpi: HPET at {:#x}", table.base_address.address);
                        Some(table)
                    }
                    _ => None,
                }
            } else {
                crate::kwarn!("acpi: HPET uses port I/O space; ignoring");
                None
            }
        }
        Err(AcpiError::TableNotFound) => None,
        Err(e) => return Err(e),
    };

    Ok(AcpiInfo {
        lapic_phys: madt.local_apic_address,
        io_apic: madt.io_apic,
        hpet,
    })
}
