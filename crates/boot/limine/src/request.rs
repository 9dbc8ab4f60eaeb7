//! Request structures the kernel places in the `.requests` section.
//!
//! Every request starts with a 4-word ID (two magic words shared by all
//! requests plus two request-specific words), a revision, and a response
//! pointer that the bootloader fills in. `response()` reads that pointer
//! volatile and returns `None` when the bootloader did not answer.

use core::cell::UnsafeCell;

use crate::response::{
    ExecutableAddressResponse, FramebufferResponse, HhdmResponse, MemMapResponse, MpResponse,
    RsdpResponse,
};

/// Generates the 4-word Limine request ID from the two request-specific words.
macro_rules! limine_id {
    ($part3:expr, $part4:expr) => {
        [
            0xc7b1_dd30_df4c_8b88_u64,
            0x0a82_e883_a194_f07b_u64,
            $part3,
            $part4,
        ]
    };
}

/// Declares a request struct with the common {id, revision, response} layout.
macro_rules! limine_request {
    (
        $(#[$meta:meta])*
        $name:ident, $resp:ty, id = ($part3:expr, $part4:expr)
    ) => {
        $(#[$meta])*
        #[repr(C)]
        pub struct $name {
            id: [u64; 4],
            revision: u64,
            response: UnsafeCell<*const $resp>,
        }

        impl $name {
            /// Creates a new request with a null response pointer.
            #[must_use]
            pub const fn new() -> Self {
                Self {
                    id: limine_id!($part3, $part4),
                    revision: 0,
                    response: UnsafeCell::new(core::ptr::null()),
                }
            }

            /// Returns the bootloader's response, if one was provided.
            #[must_use]
            pub fn response(&self) -> Option<&$resp> {
                // SAFETY: The bootloader writes the response pointer exactly
                // once before control reaches the kernel; after that the cell
                // is read-only. A non-null pointer references bootloader
                // memory that stays mapped through the HHDM.
                let ptr = unsafe { (*self.response.get()).cast::<$resp>() };
                if ptr.is_null() {
                    None
                } else {
                    // SAFETY: see above; the response lives for the kernel's lifetime.
                    Some(unsafe { &*ptr })
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        // SAFETY: Written only by the bootloader before the kernel starts;
        // read-only afterwards.
        unsafe impl Sync for $name {}
    };
}

/// Marker placed at the start of the `.requests` section so the bootloader
/// can bound its search. A start marker requires an end marker.
#[repr(C, align(8))]
pub struct RequestsStartMarker([u64; 4]);

impl RequestsStartMarker {
    /// The Limine ID of the start marker.
    pub const ID: [u64; 4] = [
        0xf6b8_f4b3_9de7_d1ae,
        0xfab9_1a69_40fc_b9cf,
        0x785c_6ed0_15d3_e316,
        0x181e_920a_7852_b9d9,
    ];

    /// Creates a new start marker.
    #[must_use]
    pub const fn new() -> Self {
        Self(Self::ID)
    }
}

impl Default for RequestsStartMarker {
    fn default() -> Self {
        Self::new()
    }
}

/// Marker placed at the end of the `.requests` section.
#[repr(C, align(8))]
pub struct RequestsEndMarker([u64; 2]);

impl RequestsEndMarker {
    /// The Limine ID of the end marker.
    pub const ID: [u64; 2] = [0xadc0_e053_1bb1_0d03, 0x9572_709f_3176_4c62];

    /// Creates a new end marker.
    #[must_use]
    pub const fn new() -> Self {
        Self(Self::ID)
    }
}

impl Default for RequestsEndMarker {
    fn default() -> Self {
        Self::new()
    }
}

/// Declares which protocol base revision the kernel speaks.
///
/// The bootloader rewrites the second word to signal support: the requested
/// revision word becomes 0 when the revision is accepted.
#[repr(C, align(8))]
pub struct BaseRevision(UnsafeCell<[u64; 3]>);

impl BaseRevision {
    /// The Limine ID of the base revision tag.
    pub const ID: [u64; 2] = [0xf956_2b2d_5c95_a6c8, 0x6a7b_3849_4453_6bdc];

    /// Creates a tag requesting base revision 3.
    #[must_use]
    pub const fn new() -> Self {
        Self(UnsafeCell::new([Self::ID[0], Self::ID[1], 3]))
    }

    /// Returns `true` if the loaded bootloader supports the requested revision.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        // SAFETY: Only the bootloader writes this cell, before kernel entry.
        unsafe { (*self.0.get())[2] == 0 }
    }
}

impl Default for BaseRevision {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: Written only by the bootloader before the kernel starts.
unsafe impl Sync for BaseRevision {}

limine_request! {
    /// Requests the physical memory map.
    MemMapRequest, MemMapResponse, id = (0x67cf_3d9d_378a_806f, 0xe304_acdf_c50c_3c62)
}

limine_request! {
    /// Requests the higher-half direct map offset.
    HhdmRequest, HhdmResponse, id = (0x48dc_f1cb_8ad2_b852, 0x6398_4e95_9a98_244b)
}

limine_request! {
    /// Requests the framebuffer list.
    FramebufferRequest, FramebufferResponse, id = (0x9d58_27dc_d881_dd75, 0xa314_8604_f6fa_b11b)
}

limine_request! {
    /// Requests the physical address of the ACPI RSDP.
    RsdpRequest, RsdpResponse, id = (0xc5e7_7b6b_397e_7b43, 0x2763_7845_accd_cf3c)
}

limine_request! {
    /// Requests the kernel image's physical and virtual load addresses.
    ExecutableAddressRequest, ExecutableAddressResponse,
    id = (0x71ba_76863cc5_5f63, 0xb2644a48c516a487)
}

/// Requests multiprocessor information and AP control structures.
///
/// Unlike the simple requests, MP carries a flags word (bit 0 asks the
/// bootloader to enable x2APIC where possible).
#[repr(C)]
pub struct MpRequest {
    id: [u64; 4],
    revision: u64,
    response: UnsafeCell<*const MpResponse>,
    flags: u64,
}

impl MpRequest {
    /// Creates a new MP request with the given flags.
    #[must_use]
    pub const fn new(flags: u64) -> Self {
        Self {
            id: limine_id!(0x95a6_7b81_9a1b_857e, 0xa0b6_1b72_3b6a_73e0),
            revision: 0,
            response: UnsafeCell::new(core::ptr::null()),
            flags,
        }
    }

    /// Returns the bootloader's MP response, if one was provided.
    #[must_use]
    pub fn response(&self) -> Option<&MpResponse> {
        // SAFETY: Same single-writer-before-entry contract as the other requests.
        let ptr = unsafe { *self.response.get() };
        if ptr.is_null() {
            None
        } else {
            // SAFETY: see above.
            Some(unsafe { &*ptr })
        }
    }
}

impl Default for MpRequest {
    fn default() -> Self {
        Self::new(0)
    }
}

// SAFETY: Written only by the bootloader before the kernel starts.
unsafe impl Sync for MpRequest {}
