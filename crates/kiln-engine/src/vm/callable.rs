//! Atomically swappable call targets
//!
//! Method entries and VirtualTable slots are patched after publication (a lazy
//! compilation stub is replaced by compiled code). Readers on other threads
//! must see either the old or the new target, never a torn one, so each cell
//! holds a single pointer published with release and read with acquire
//! ordering. Every value ever published stays owned by the cell, which keeps
//! a racing reader's pointer valid for the cell's whole lifetime.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A patchable call target
pub struct CallableCell<T> {
    current: AtomicPtr<T>,
    retained: Mutex<Vec<Arc<T>>>,
    _owns: PhantomData<Arc<T>>,
}

impl<T> CallableCell<T> {
    /// Create a cell holding `initial`
    pub fn new(initial: Arc<T>) -> Self {
        let ptr = Arc::as_ptr(&initial) as *mut T;
        Self {
            current: AtomicPtr::new(ptr),
            retained: Mutex::new(vec![initial]),
            _owns: PhantomData,
        }
    }

    /// Load the current target
    #[inline]
    pub fn load(&self) -> Arc<T> {
        let ptr = self.current.load(Ordering::Acquire);
        // SAFETY: `ptr` came from `Arc::as_ptr` of an Arc stored in `retained`,
        // and `retained` only grows, so the allocation outlives `self`.
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    /// Whether the cell currently holds `target`
    #[inline]
    pub fn holds(&self, target: &Arc<T>) -> bool {
        std::ptr::eq(self.current.load(Ordering::Acquire), Arc::as_ptr(target))
    }

    /// Publish a new target unconditionally
    pub fn store(&self, target: Arc<T>) {
        let mut retained = self.retained.lock();
        let ptr = Arc::as_ptr(&target) as *mut T;
        retained.push(target);
        self.current.store(ptr, Ordering::Release);
    }

    /// Publish `target` only if the cell still holds `expected`. Returns the
    /// winning target either way.
    pub fn replace(&self, expected: &Arc<T>, target: Arc<T>) -> Arc<T> {
        let mut retained = self.retained.lock();
        let ptr = Arc::as_ptr(&target) as *mut T;
        match self.current.compare_exchange(
            Arc::as_ptr(expected) as *mut T,
            ptr,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                retained.push(target.clone());
                target
            }
            Err(_) => {
                drop(retained);
                self.load()
            }
        }
    }

    /// Number of targets this cell has published over its lifetime
    pub fn generations(&self) -> usize {
        self.retained.lock().len()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CallableCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CallableCell").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_store() {
        let cell = CallableCell::new(Arc::new(1u32));
        assert_eq!(*cell.load(), 1);
        cell.store(Arc::new(2));
        assert_eq!(*cell.load(), 2);
        assert_eq!(cell.generations(), 2);
    }

    #[test]
    fn test_replace_only_from_expected() {
        let stub = Arc::new("stub");
        let cell = CallableCell::new(stub.clone());

        let winner = cell.replace(&stub, Arc::new("compiled"));
        assert_eq!(*winner, "compiled");

        // A second racer still expecting the stub loses and observes the winner
        let loser = cell.replace(&stub, Arc::new("other"));
        assert_eq!(*loser, "compiled");
        assert!(cell.holds(&winner));
    }

    #[test]
    fn test_loaded_target_survives_patch() {
        let cell = CallableCell::new(Arc::new(String::from("old")));
        let held = cell.load();
        cell.store(Arc::new(String::from("new")));
        assert_eq!(held.as_str(), "old");
    }

    #[test]
    fn test_concurrent_readers_see_whole_values() {
        let cell = Arc::new(CallableCell::new(Arc::new((0u64, 0u64))));
        crossbeam::scope(|s| {
            for _ in 0..4 {
                let cell = cell.clone();
                s.spawn(move |_| {
                    for _ in 0..1000 {
                        let pair = cell.load();
                        assert_eq!(pair.0, pair.1);
                    }
                });
            }
            for i in 1..200u64 {
                cell.store(Arc::new((i, i)));
            }
        })
        .unwrap();
    }
}
