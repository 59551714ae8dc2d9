//! Retired items: unlinked objects waiting for a scan to prove them
//! unreachable.
//!
//! A retired item is the triple `(object, allocator, deleter)`. The
//! deleter fn pointer encodes the concrete type and the reclamation path;
//! the allocator pointer is null for plain heap objects and an opaque
//! owner handle for pooled ones, passed back to the deleter verbatim.

use std::panic::{catch_unwind, AssertUnwindSafe};

/// Type-erased reclamation function: `(object, allocator)`.
pub type DeleterFn = unsafe fn(*mut (), *const ());

/// An object handed to the reclamation system, together with the function
/// that knows how to destroy it.
pub struct RetiredItem {
    object: *mut (),
    allocator: *const (),
    deleter: DeleterFn,
}

impl RetiredItem {
    /// Builds an item with an explicit allocator handle and deleter.
    ///
    /// # Safety
    ///
    /// `deleter(object, allocator)` must be sound to call exactly once, at
    /// any later time, from any thread.
    pub unsafe fn new(object: *mut (), allocator: *const (), deleter: DeleterFn) -> Self {
        Self {
            object,
            allocator,
            deleter,
        }
    }

    /// Builds an item whose deleter drops a `Box<U>`.
    ///
    /// # Safety
    ///
    /// `object` must have come from `Box::<U>::into_raw` and must not be
    /// freed through any other path.
    pub unsafe fn boxed<U>(object: *mut U) -> Self {
        unsafe { Self::new(object.cast(), core::ptr::null(), drop_boxed::<U>) }
    }

    #[inline]
    pub(crate) fn object(&self) -> *mut () {
        self.object
    }

    /// Runs the deleter. A panicking deleter is contained: the item is
    /// still consumed (the object leaks rather than corrupting the
    /// retired list) and the caller's sweep continues.
    pub(crate) fn run_deleter(self) {
        let _ = catch_unwind(AssertUnwindSafe(|| unsafe {
            (self.deleter)(self.object, self.allocator)
        }));
    }
}

unsafe fn drop_boxed<U>(object: *mut (), _allocator: *const ()) {
    // SAFETY: constructed only via RetiredItem::boxed, whose contract
    // guarantees the pointer came from Box::<U>::into_raw.
    unsafe { drop(Box::from_raw(object.cast::<U>())) };
}

// SAFETY: the pointers are only dereferenced by the deleter, which the
// constructor contract requires to be callable from any thread.
unsafe impl Send for RetiredItem {}
