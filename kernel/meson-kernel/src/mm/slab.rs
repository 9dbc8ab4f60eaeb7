//! Slab caches for small allocations.
//!
//! One cache per size class in {8..1024}. A slab is a single page: the
//! header sits at the page start, aligned up to max(16, object size), and
//! the object region fills the rest. Free objects form an intrusive chain
//! of 16-bit indices stored in the objects themselves. Slabs live on their
//! cache's partial or full list; pages are never returned (committed vheap
//! memory cannot be unmapped, so usage is monotonic).

use core::ptr::NonNull;

use meson_core::sync::SpinLock;

use super::PAGE_SIZE;

/// Largest size a slab cache serves; bigger requests go to the general heap.
pub const SLAB_MAX_SIZE: usize = 1024;

/// Object size classes.
const CLASSES: [u16; 8] = [8, 16, 32, 64, 128, 256, 512, 1024];

/// Minimum object alignment.
const MIN_ALIGN: usize = 8;

/// Supplies one 4 KiB page per call. Wired to the vheap in the kernel.
pub type PageSource = fn() -> Option<NonNull<u8>>;

/// Per-slab header, stored at the page start.
#[repr(C)]
struct SlabHeader {
    next: *mut SlabHeader,
    obj_size: u16,
    obj_per_slab: u16,
    free_count: u16,
    /// Head of the intrusive free-index chain; `obj_per_slab` terminates.
    first_free: u16,
}

impl SlabHeader {
    /// Offset of the object region: the header rounded up to
    /// max(16, object size) so every object is naturally aligned.
    fn objects_offset(obj_size: u16) -> usize {
        let align = (obj_size as usize).max(16);
        (core::mem::size_of::<Self>() + align - 1) & !(align - 1)
    }

    /// Address of object `index` within this slab.
    ///
    /// # Safety
    ///
    /// `index < self.obj_per_slab`.
    unsafe fn object(&self, index: u16) -> *mut u8 {
        let base = (self as *const Self as usize) + Self::objects_offset(self.obj_size);
        (base + index as usize * self.obj_size as usize) as *mut u8
    }
}

struct Cache {
    partial: *mut SlabHeader,
    full: *mut SlabHeader,
    obj_size: u16,
}

struct SlabInner {
    caches: [Cache; CLASSES.len()],
    page_source: Option<PageSource>,
}

// SAFETY: The raw slab pointers are only dereferenced under the lock, and
// the pages they point at stay mapped forever.
unsafe impl Send for SlabInner {}

/// The slab allocator: all caches behind one spinlock.
pub struct SlabAllocator {
    inner: SpinLock<SlabInner>,
}

impl SlabAllocator {
    /// Creates an allocator with empty caches and no page source.
    pub const fn new() -> Self {
        const fn cache(obj_size: u16) -> Cache {
            Cache {
                partial: core::ptr::null_mut(),
                full: core::ptr::null_mut(),
                obj_size,
            }
        }
        Self {
            inner: SpinLock::new(SlabInner {
                caches: [
                    cache(8),
                    cache(16),
                    cache(32),
                    cache(64),
                    cache(128),
                    cache(256),
                    cache(512),
                    cache(1024),
                ],
                page_source: None,
            }),
        }
    }

    /// Registers where new slab pages come from.
    pub fn set_page_source(&self, source: PageSource) {
        self.inner.lock().page_source = Some(source);
    }

    /// Allocates an object of at least `size` bytes, 8-aligned.
    ///
    /// Returns `None` for `size == 0`, sizes above [`SLAB_MAX_SIZE`], or
    /// when no page can be obtained for a fresh slab.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 || size > SLAB_MAX_SIZE {
            return None;
        }
        let size = (size + MIN_ALIGN - 1) & !(MIN_ALIGN - 1);
        let mut inner = self.inner.lock();
        let class = CLASSES.iter().position(|&c| size <= c as usize)?;

        if inner.caches[class].partial.is_null() {
            let source = inner.page_source?;
            let page = source()?;
            let slab = new_slab(page, inner.caches[class].obj_size)?;
            // SAFETY: `slab` was just carved out of a fresh page.
            unsafe {
                (*slab).next = inner.caches[class].partial;
            }
            inner.caches[class].partial = slab;
        }

        let slab = inner.caches[class].partial;
        // SAFETY: Partial slabs always have a free object; the index chain
        // is maintained by alloc/free under the lock.
        let obj = unsafe {
            let idx = (*slab).first_free;
            let obj = (*slab).object(idx);
            (*slab).first_free = (obj as *const u16).read();
            (*slab).free_count -= 1;
            obj
        };

        // SAFETY: Header fields valid under the lock.
        if unsafe { (*slab).free_count } == 0 {
            // Exhausted: move partial head to the full list.
            let cache = &mut inner.caches[class];
            // SAFETY: `slab` is the partial head.
            unsafe {
                cache.partial = (*slab).next;
                (*slab).next = cache.full;
            }
            cache.full = slab;
        }

        NonNull::new(obj)
    }

    /// Frees an object previously returned by [`SlabAllocator::alloc`].
    ///
    /// The owning slab is found through the page base (headers sit at page
    /// starts). Frees of pointers the allocator does not own are ignored;
    /// route through [`SlabAllocator::owns`] first.
    pub fn free(&self, ptr: NonNull<u8>) {
        let mut inner = self.inner.lock();
        let Some((class, slab)) = locate(&inner, ptr) else {
            return;
        };

        let addr = ptr.as_ptr() as usize;
        // SAFETY: `locate` proved the pointer lies in this slab's page.
        unsafe {
            let base = slab as usize + SlabHeader::objects_offset((*slab).obj_size);
            let Some(offset) = addr.checked_sub(base) else {
                return; // points into the header area
            };
            if offset % (*slab).obj_size as usize != 0 {
                return; // not an object start
            }
            let idx = (offset / (*slab).obj_size as usize) as u16;
            (ptr.as_ptr() as *mut u16).write((*slab).first_free);
            (*slab).first_free = idx;
            (*slab).free_count += 1;

            if (*slab).free_count == 1 {
                // Was full: move back to the partial list.
                let cache = &mut inner.caches[class];
                unlink(&mut cache.full, slab);
                (*slab).next = cache.partial;
                cache.partial = slab;
            }
        }
    }

    /// Reports whether `ptr` lies inside any slab page. O(slabs); used only
    /// on the free path to route between slab and the general heap.
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        let inner = self.inner.lock();
        locate(&inner, ptr).is_some()
    }

    /// Returns the object size backing `ptr`, or 0 for foreign pointers.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let inner = self.inner.lock();
        match locate(&inner, ptr) {
            // SAFETY: `locate` returned a live slab header.
            Some((_, slab)) => unsafe { (*slab).obj_size as usize },
            None => 0,
        }
    }
}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel's slab allocator. Wired to the vheap by `mm::heap::init`.
pub static SLAB: SlabAllocator = SlabAllocator::new();

/// Initializes a fresh slab in `page` for `obj_size` objects.
fn new_slab(page: NonNull<u8>, obj_size: u16) -> Option<*mut SlabHeader> {
    let offset = SlabHeader::objects_offset(obj_size);
    let count = ((PAGE_SIZE - offset) / obj_size as usize) as u16;
    if count == 0 {
        return None;
    }

    let slab = page.as_ptr().cast::<SlabHeader>();
    // SAFETY: The page is fresh, writable, and page-aligned; the header fits
    // well within it.
    unsafe {
        (*slab).next = core::ptr::null_mut();
        (*slab).obj_size = obj_size;
        (*slab).obj_per_slab = count;
        (*slab).free_count = count;
        (*slab).first_free = 0;

        // Thread the index chain through the objects: each object's first
        // u16 names the next free index, the last one holds `count`.
        for i in 0..count {
            let obj = (*slab).object(i);
            (obj as *mut u16).write(i + 1);
        }
    }
    Some(slab)
}

/// Finds the slab containing `ptr` by walking every cache's lists.
fn locate(inner: &SlabInner, ptr: NonNull<u8>) -> Option<(usize, *mut SlabHeader)> {
    let addr = ptr.as_ptr() as usize;
    for (class, cache) in inner.caches.iter().enumerate() {
        for &list in &[cache.partial, cache.full] {
            let mut slab = list;
            while !slab.is_null() {
                let base = slab as usize;
                if addr >= base && addr < base + PAGE_SIZE {
                    return Some((class, slab));
                }
                // SAFETY: List links are maintained under the lock.
                slab = unsafe { (*slab).next };
            }
        }
    }
    None
}

/// Unlinks `slab` from the list headed at `head`.
///
/// # Safety
///
/// `slab` must be on the list.
unsafe fn unlink(head: &mut *mut SlabHeader, slab: *mut SlabHeader) {
    if *head == slab {
        // SAFETY: `slab` is live.
        *head = unsafe { (*slab).next };
        return;
    }
    let mut cur = *head;
    // SAFETY: All links are live under the lock.
    unsafe {
        while !cur.is_null() {
            if (*cur).next == slab {
                (*cur).next = (*slab).next;
                return;
            }
            cur = (*cur).next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed};

    /// Page source backed by leaked host pages (tests only).
    fn host_page() -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        NonNull::new(unsafe { alloc_zeroed(layout) })
    }

    fn allocator() -> SlabAllocator {
        let slab = SlabAllocator::new();
        slab.set_page_source(host_page);
        slab
    }

    #[test]
    fn objects_are_aligned_and_within_one_page() {
        let slab = allocator();
        for size in [1usize, 8, 24, 100, 1000] {
            let ptr = slab.alloc(size).unwrap();
            let addr = ptr.as_ptr() as usize;
            assert_eq!(addr % MIN_ALIGN, 0, "size {size} not 8-aligned");
            let page_base = addr & !(PAGE_SIZE - 1);
            assert!(addr + size <= page_base + PAGE_SIZE, "size {size} crosses a page");
        }
    }

    #[test]
    fn header_is_at_page_base() {
        let slab = allocator();
        let ptr = slab.alloc(64).unwrap();
        let page_base = (ptr.as_ptr() as usize) & !(PAGE_SIZE - 1);
        // The header at the page base records this cache's object size, and
        // the object region begins past the aligned header.
        let header = page_base as *const SlabHeader;
        assert_eq!(unsafe { (*header).obj_size }, 64);
        assert!(ptr.as_ptr() as usize >= page_base + SlabHeader::objects_offset(64));
    }

    #[test]
    fn size_class_rounding() {
        let slab = allocator();
        let p = slab.alloc(9).unwrap();
        assert_eq!(slab.usable_size(p), 16);
        let p = slab.alloc(17).unwrap();
        assert_eq!(slab.usable_size(p), 32);
        let p = slab.alloc(1024).unwrap();
        assert_eq!(slab.usable_size(p), 1024);
    }

    #[test]
    fn oversize_and_zero_rejected() {
        let slab = allocator();
        assert!(slab.alloc(0).is_none());
        assert!(slab.alloc(SLAB_MAX_SIZE + 1).is_none());
    }

    #[test]
    fn free_then_alloc_reuses_object() {
        let slab = allocator();
        let a = slab.alloc(24).unwrap();
        slab.free(a);
        let b = slab.alloc(24).unwrap();
        assert_eq!(a, b, "freed object should be handed out again");
    }

    #[test]
    fn owns_routes_correctly() {
        let slab = allocator();
        let ours = slab.alloc(128).unwrap();
        assert!(slab.owns(ours));

        let foreign = Box::leak(Box::new(0u64));
        assert!(!slab.owns(NonNull::from(&mut *foreign).cast()));
    }

    #[test]
    fn full_slab_transitions_and_returns() {
        let slab = allocator();
        // Fill an entire 1024-class slab (3 objects per page: header takes
        // one 1024-aligned slot).
        let per_slab = (PAGE_SIZE - SlabHeader::objects_offset(1024)) / 1024;
        let mut held: Vec<_> = (0..per_slab).map(|_| slab.alloc(1024).unwrap()).collect();

        // Next alloc carves a second slab page.
        let overflow = slab.alloc(1024).unwrap();
        let first_page = held[0].as_ptr() as usize & !(PAGE_SIZE - 1);
        let second_page = overflow.as_ptr() as usize & !(PAGE_SIZE - 1);
        assert_ne!(first_page, second_page);

        // Freeing one object moves the full slab back to partial, and the
        // next alloc of that class reuses it.
        let released = held.pop().unwrap();
        slab.free(released);
        let reused = slab.alloc(1024).unwrap();
        assert_eq!(reused, released);
    }

    #[test]
    fn alloc_without_source_fails() {
        let slab = SlabAllocator::new();
        assert!(slab.alloc(8).is_none());
    }

    #[test]
    fn distinct_objects_until_exhaustion() {
        let slab = allocator();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let p = slab.alloc(64).unwrap();
            assert!(seen.insert(p.as_ptr() as usize), "object handed out twice");
        }
    }
}
