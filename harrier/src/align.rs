//! Cache-line alignment for shared bookkeeping.
//!
//! Hazard records, buckets, and container head/tail words are written by
//! one thread and spun on by others; giving each its own line keeps that
//! traffic from dragging its neighbours along. Line sizes: x86_64 64 B,
//! aarch64 128 B (Apple M-series / Neoverse), s390x 256 B; everything
//! else gets the common 64 B.

use core::ops::{Deref, DerefMut};

/// Aligns a value to the target's cache line.
///
/// Used two ways: as a field wrapper for hot atomic words (queue heads
/// and tails), and around heap allocations of recycled registry entries
/// so each record or bucket starts on its own line.
#[cfg_attr(target_arch = "s390x", repr(align(256)))]
#[cfg_attr(target_arch = "aarch64", repr(align(128)))]
#[cfg_attr(
    not(any(target_arch = "s390x", target_arch = "aarch64")),
    repr(align(64))
)]
pub struct CacheAligned<T> {
    value: T,
}

impl<T> CacheAligned<T> {
    /// Wraps `value`.
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CacheAligned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}
