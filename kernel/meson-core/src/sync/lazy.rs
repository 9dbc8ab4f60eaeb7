//! Lazy initialization for `no_std`.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ops::Deref;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// A value initialized on first access.
///
/// Thread-safe via an atomic state machine: when several CPUs race, one runs
/// the initializer and the rest spin until the value is ready. The kernel
/// runs with `panic = abort`, so a panicking initializer halts the system
/// rather than poisoning the cell.
pub struct LazyLock<T, F = fn() -> T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
    init: UnsafeCell<Option<F>>,
}

// SAFETY: The state machine guarantees the value is fully written before any
// reader observes READY, and the initializer is consumed exactly once.
unsafe impl<T: Send + Sync, F: Send> Send for LazyLock<T, F> {}
unsafe impl<T: Send + Sync, F: Send> Sync for LazyLock<T, F> {}

impl<T, F: FnOnce() -> T> LazyLock<T, F> {
    /// Creates a new `LazyLock` with the given initializer.
    pub const fn new(init: F) -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
            init: UnsafeCell::new(Some(init)),
        }
    }

    /// Forces initialization and returns a reference to the value.
    pub fn force(&self) -> &T {
        match self.state.compare_exchange(
            UNINIT,
            INITIALIZING,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // We won the race; run the initializer.
                // SAFETY: The INITIALIZING state gives us exclusive access to
                // both cells.
                let init = unsafe { (*self.init.get()).take() }.expect("initializer taken twice");
                let value = init();
                // SAFETY: Exclusive access, see above.
                unsafe { (*self.value.get()).write(value) };
                self.state.store(READY, Ordering::Release);
            }
            Err(READY) => {}
            Err(_) => {
                // Another CPU is initializing; wait for it.
                while self.state.load(Ordering::Acquire) != READY {
                    core::hint::spin_loop();
                }
            }
        }
        // SAFETY: State is READY, so the value is initialized and immutable.
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T, F: FnOnce() -> T> Deref for LazyLock<T, F> {
    type Target = T;

    fn deref(&self) -> &T {
        self.force()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn initializes_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let lazy: LazyLock<u32> = LazyLock::new(|| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            7
        });
        assert_eq!(*lazy, 7);
        assert_eq!(*lazy, 7);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_access_single_init() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        static LAZY: LazyLock<u64> = LazyLock::new(|| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            42
        });
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| assert_eq!(*LAZY, 42)))
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
