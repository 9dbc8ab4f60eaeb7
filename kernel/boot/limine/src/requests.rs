//! The Limine requests this kernel places in the `.requests` section.

use limine::{
    BaseRevision, ExecutableAddressRequest, FramebufferRequest, HhdmRequest, MemMapRequest,
    MpRequest, RequestsEndMarker, RequestsStartMarker, RsdpRequest,
};

/// All requests, bracketed by the protocol markers.
#[repr(C, align(8))]
pub struct LimineRequests {
    _start_marker: RequestsStartMarker,
    /// Base protocol revision tag.
    pub base_revision: BaseRevision,
    /// Physical memory map.
    pub memmap: MemMapRequest,
    /// Higher-half direct map offset.
    pub hhdm: HhdmRequest,
    /// Framebuffer list.
    pub framebuffer: FramebufferRequest,
    /// ACPI RSDP address.
    pub rsdp: RsdpRequest,
    /// Kernel load addresses.
    pub executable_address: ExecutableAddressRequest,
    /// Multiprocessor structures.
    pub mp: MpRequest,
    _end_marker: RequestsEndMarker,
}

impl LimineRequests {
    const fn new() -> Self {
        Self {
            _start_marker: RequestsStartMarker::new(),
            base_revision: BaseRevision::new(),
            memmap: MemMapRequest::new(),
            hhdm: HhdmRequest::new(),
            framebuffer: FramebufferRequest::new(),
            rsdp: RsdpRequest::new(),
            executable_address: ExecutableAddressRequest::new(),
            mp: MpRequest::new(0),
            _end_marker: RequestsEndMarker::new(),
        }
    }
}

// SAFETY: Written only by the bootloader before kernel entry; read-only
// afterwards.
unsafe impl Sync for LimineRequests {}

/// The request block the bootloader scans for.
#[used]
#[unsafe(link_section = ".requests")]
pub static REQUESTS: LimineRequests = LimineRequests::new();
