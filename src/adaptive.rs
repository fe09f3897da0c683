//! Lock-free shared snapshots for read-mostly state (the tier table, the hash ring).
//!
//! Readers take a cheap `Arc` snapshot and never observe a half-applied update; writers replace
//! the whole value.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// `DynamicConfig<T>` gives cheap reads and atomic whole-value replacement.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    /// Create a new `DynamicConfig` with the given initial value.
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Derive the next value from the current one and swap it in, retrying if another writer
    /// got there first. `f` may run more than once. Returns the value that was replaced.
    pub fn update<F>(&self, mut f: F) -> Arc<T>
    where
        F: FnMut(&T) -> T,
    {
        self.inner.rcu(|cur| Arc::new(f(cur)))
    }
}
