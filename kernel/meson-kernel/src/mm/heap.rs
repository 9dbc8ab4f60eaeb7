//! Kernel heap facade: routes allocations between the slab caches and the
//! general heap, and wires both to the vheap at boot.
//!
//! Requests of at most [`SLAB_MAX_SIZE`](super::slab::SLAB_MAX_SIZE) bytes
//! go to the slab; larger ones to stelloc. Frees route by asking the slab
//! whether it owns the pointer. Supported alignment is 8 bytes (the natural
//! alignment of both tiers); the kernel keeps no over-aligned heap types —
//! page tables and stacks come straight from palloc/vheap.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use super::slab::{SLAB, SLAB_MAX_SIZE};
use super::stelloc::STELLOC;

/// Maximum alignment the heap serves.
const MAX_ALIGN: usize = 8;

/// The routing allocator installed as `#[global_allocator]` on the kernel
/// target.
pub struct KernelHeap;

// SAFETY: Both tiers return exclusive, live pointers for the requested size,
// and dealloc routes each pointer back to the tier that produced it.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_ALIGN {
            return core::ptr::null_mut();
        }
        let size = layout.size().max(1);
        if size <= SLAB_MAX_SIZE {
            match SLAB.alloc(size) {
                Some(ptr) => ptr.as_ptr(),
                // Slab pages exhausted; the general heap can still serve.
                None => STELLOC.alloc(size).unwrap_or(core::ptr::null_mut()),
            }
        } else {
            STELLOC.alloc(size).unwrap_or(core::ptr::null_mut())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(nn) = NonNull::new(ptr) else { return };
        if SLAB.owns(nn) {
            SLAB.free(nn);
        } else {
            STELLOC.free(ptr);
        }
    }
}

#[cfg_attr(target_os = "none", global_allocator)]
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
static HEAP: KernelHeap = KernelHeap;

// ---------------------------------------------------------------------------
// Boot wiring
// ---------------------------------------------------------------------------

/// One page from the vheap for a fresh slab.
#[cfg(target_os = "none")]
fn slab_page_source() -> Option<NonNull<u8>> {
    super::vheap::commit(super::PAGE_SIZE as u64).and_then(|va| NonNull::new(va.as_mut_ptr()))
}

/// A contiguous span from the vheap for stelloc growth.
#[cfg(target_os = "none")]
fn stelloc_grow(min_bytes: usize) -> Option<(usize, usize)> {
    let bytes = super::align_up(min_bytes as u64, super::PAGE_SIZE as u64);
    let va = super::vheap::commit(bytes)?;
    Some((va.as_u64() as usize, bytes as usize))
}

/// A loose frame straight from palloc for stelloc's fallback growth.
#[cfg(target_os = "none")]
fn stelloc_frame() -> Option<usize> {
    super::palloc::PALLOC
        .alloc_frame()
        .map(|va| va.as_u64() as usize)
}

/// Brings up the kernel heap: reserves the vheap window and points both heap
/// tiers at it. Requires palloc and the vmm to be initialized.
#[cfg(target_os = "none")]
pub fn init() {
    super::vheap::init();
    SLAB.set_page_source(slab_page_source);
    STELLOC.set_grow_fn(stelloc_grow);
    STELLOC.set_frame_fn(stelloc_frame);
    crate::kinfo!("heap: slab + stelloc wired to vheap");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap() -> KernelHeap {
        use std::alloc::{Layout as StdLayout, alloc_zeroed};

        fn page() -> Option<NonNull<u8>> {
            let layout = StdLayout::from_size_align(4096, 4096).unwrap();
            NonNull::new(unsafe { alloc_zeroed(layout) })
        }
        fn span(min: usize) -> Option<(usize, usize)> {
            let len = min.next_multiple_of(4096);
            let layout = StdLayout::from_size_align(len, 4096).unwrap();
            let p = unsafe { alloc_zeroed(layout) };
            if p.is_null() { None } else { Some((p as usize, len)) }
        }

        SLAB.set_page_source(page);
        STELLOC.set_grow_fn(span);
        KernelHeap
    }

    #[test]
    fn small_goes_to_slab_large_to_stelloc() {
        let heap = test_heap();
        let small = unsafe { heap.alloc(Layout::from_size_align(64, 8).unwrap()) };
        let large = unsafe { heap.alloc(Layout::from_size_align(4000, 8).unwrap()) };
        assert!(!small.is_null() && !large.is_null());

        assert!(SLAB.owns(NonNull::new(small).unwrap()));
        assert!(!SLAB.owns(NonNull::new(large).unwrap()));

        unsafe {
            heap.dealloc(small, Layout::from_size_align(64, 8).unwrap());
            heap.dealloc(large, Layout::from_size_align(4000, 8).unwrap());
        }
    }

    #[test]
    fn boundary_size_routes_to_slab() {
        let heap = test_heap();
        let layout = Layout::from_size_align(SLAB_MAX_SIZE, 8).unwrap();
        let p = unsafe { heap.alloc(layout) };
        assert!(SLAB.owns(NonNull::new(p).unwrap()));
        unsafe { heap.dealloc(p, layout) };
    }

    #[test]
    fn over_aligned_requests_refused() {
        let heap = test_heap();
        let p = unsafe { heap.alloc(Layout::from_size_align(64, 32).unwrap()) };
        assert!(p.is_null());
    }

    #[test]
    fn realloc_after_free_reuses_slab_object() {
        let heap = test_heap();
        let layout = Layout::from_size_align(24, 8).unwrap();
        let a = unsafe { heap.alloc(layout) };
        unsafe { heap.dealloc(a, layout) };
        let b = unsafe { heap.alloc(layout) };
        assert_eq!(a, b);
        unsafe { heap.dealloc(b, layout) };
    }
}
