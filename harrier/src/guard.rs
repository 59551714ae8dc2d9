//! Thread contexts, scoped slot groups, and hazard pointer handles.
//!
//! The protocol for safely dereferencing a pointer read from a shared
//! atomic location:
//!
//! 1. read the pointer,
//! 2. release-store it into a hazard slot, then issue a seq-cst fence,
//! 3. re-read the location; if it changed, publish the new value and
//!    retry.
//!
//! Once the re-read matches the publication, any retirer that unlinked
//! the object afterwards is guaranteed to observe the slot during its
//! scan. [`HazardPtr::load_from`] packages this loop.

use crate::record::HazardRecord;
use crate::retired::{DeleterFn, RetiredItem};
use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{fence, AtomicPtr, Ordering};

thread_local! {
    static LOCAL_RECORD: Cell<Option<&'static HazardRecord>> = const { Cell::new(None) };
}

pub(crate) fn current_record() -> &'static HazardRecord {
    LOCAL_RECORD
        .with(|c| c.get())
        .expect("no hazard context: call HazardContext::enter() on this thread first")
}

/// Scoped claim of a hazard record for the current thread.
///
/// Every thread must hold a context across all of its hazard-based
/// operations and drop it before terminating; a thread that exits while
/// its slots are still installed keeps other threads' garbage alive
/// forever. Dropping the context clears the thread's bookkeeping, flushes
/// the retired list once, and recycles the record for the next thread.
pub struct HazardContext {
    record: &'static HazardRecord,
    _not_send: PhantomData<*mut ()>,
}

impl HazardContext {
    /// Claims a record for the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the thread already holds a context.
    pub fn enter() -> Self {
        LOCAL_RECORD.with(|c| {
            assert!(c.get().is_none(), "thread already holds a hazard context");
            let record = crate::record::root().acquire_record();
            c.set(Some(record));
            HazardContext {
                record,
                _not_send: PhantomData,
            }
        })
    }
}

impl Drop for HazardContext {
    fn drop(&mut self) {
        // try_with: TLS may already be torn down during thread exit; the
        // record release below does not depend on it.
        let _ = LOCAL_RECORD.try_with(|c| c.set(None));
        crate::record::root().release_record(self.record);
    }
}

/// A scoped reservation of `N` hazard slots from the current thread's
/// record. Individual slots are carved out with [`hazard`](Self::hazard);
/// dropping the group clears every slot and returns the reservation.
pub struct HazardGuards<const N: usize> {
    record: &'static HazardRecord,
    slots: [&'static AtomicPtr<()>; N],
    taken: Cell<usize>,
    _not_send: PhantomData<*mut ()>,
}

impl<const N: usize> HazardGuards<N> {
    /// Reserves `N` slots.
    ///
    /// # Panics
    ///
    /// Panics if the thread holds no [`HazardContext`], or (in the inline
    /// build) if the thread's live reservations would exceed
    /// `HAZARD_PTR_SIZE`.
    pub fn new() -> Self {
        let record = current_record();
        let slots = record.slots.reserve::<N>();
        Self {
            record,
            slots,
            taken: Cell::new(0),
            _not_send: PhantomData,
        }
    }

    /// Hands out the next unused slot of the group as a typed handle.
    ///
    /// # Panics
    ///
    /// Panics when called more than `N` times on one group.
    pub fn hazard<T>(&self) -> HazardPtr<'_, T> {
        let i = self.taken.get();
        assert!(i < N, "hazard group exhausted: only {N} slots reserved");
        self.taken.set(i + 1);
        HazardPtr {
            slot: self.slots[i],
            record: self.record,
            ptr: ptr::null_mut(),
            _guards: PhantomData,
        }
    }
}

impl<const N: usize> Default for HazardGuards<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Drop for HazardGuards<N> {
    fn drop(&mut self) {
        fence(Ordering::Release);
        for slot in self.slots {
            slot.store(ptr::null_mut(), Ordering::Relaxed);
        }
        if N != 0 {
            self.record.slots.release(N, self.slots[0]);
        }
    }
}

/// A single hazard slot plus the thread-local view of the pointer it
/// protects.
///
/// The local view (`get`) and the published slot usually agree; the
/// anchor and unfenced setters deliberately let them diverge for the
/// cases where the protocol does not need a publication.
pub struct HazardPtr<'g, T> {
    slot: &'static AtomicPtr<()>,
    record: &'static HazardRecord,
    ptr: *mut T,
    _guards: PhantomData<&'g ()>,
}

impl<'g, T> HazardPtr<'g, T> {
    /// The canonical safe read: loads from `src`, publishes the value,
    /// and re-reads until the publication is stable. On return the
    /// pointed-to object cannot be reclaimed while this slot holds it.
    pub fn load_from(&mut self, src: &AtomicPtr<T>) -> *mut T {
        let mut p1 = src.load(Ordering::Relaxed);
        loop {
            self.slot.store(p1.cast(), Ordering::Release);
            fence(Ordering::SeqCst);
            let p2 = src.load(Ordering::Acquire);
            if p1 == p2 {
                self.ptr = p2;
                return p2;
            }
            p1 = p2;
        }
    }

    /// Publishes an arbitrary pointer (release store + seq-cst fence).
    /// The caller must re-validate, immediately afterwards, that the
    /// object is still reachable; otherwise it may already be retired.
    pub fn protect(&mut self, p: *mut T) {
        self.slot.store(p.cast(), Ordering::Release);
        fence(Ordering::SeqCst);
        self.ptr = p;
    }

    /// Publishes a pointer with a release store but no fence. Only
    /// correct when a later seq-cst operation (typically the CAS that
    /// makes the protection matter) orders the publication before any
    /// retirer's scan.
    pub fn protect_unfenced(&mut self, p: *mut T) {
        self.slot.store(p.cast(), Ordering::Release);
        self.ptr = p;
    }

    /// Sets the local view without publishing anything, and clears the
    /// slot. For objects that are never retired, such as an embedded
    /// list-head dummy.
    pub fn set_anchor(&mut self, p: *mut T) {
        self.slot.store(ptr::null_mut(), Ordering::Release);
        self.ptr = p;
    }

    /// Clears the slot and the local view.
    pub fn clear(&mut self) {
        self.slot.store(ptr::null_mut(), Ordering::Release);
        self.ptr = ptr::null_mut();
    }

    /// Exchanges both the slots and the local views of two handles. This
    /// is how a traversal advances its `prev` hazard onto the node that
    /// `curr` already protects without a window where neither slot covers
    /// it.
    pub fn swap(&mut self, other: &mut HazardPtr<'g, T>) {
        core::mem::swap(&mut self.slot, &mut other.slot);
        core::mem::swap(&mut self.ptr, &mut other.ptr);
    }

    /// The local view.
    #[inline]
    pub fn get(&self) -> *mut T {
        self.ptr
    }

    /// Whether the local view is null.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Borrows the protected object.
    ///
    /// # Safety
    ///
    /// The local view must be non-null and valid: the result of a
    /// completed [`load_from`](Self::load_from), a re-validated
    /// [`protect`](Self::protect), or an anchor that is never retired.
    #[inline]
    pub unsafe fn deref(&self) -> &T {
        // SAFETY: caller guarantees a non-null, protected pointer.
        unsafe { &*self.ptr }
    }

    /// Retires the held object with a `Box<T>`-dropping deleter and
    /// clears the slot.
    ///
    /// # Safety
    ///
    /// The object must have come from `Box::<T>::into_raw`, must be
    /// unreachable from the data structure (no path except other threads'
    /// local/hazard views), and must not be retired twice.
    pub unsafe fn retire(&mut self) {
        // SAFETY: forwarded to the caller.
        unsafe { self.retire_as::<T>() }
    }

    /// Retires the held object as concrete type `U` and clears the slot.
    /// For handles that traverse via a base-link type while the
    /// allocation is a larger node.
    ///
    /// # Safety
    ///
    /// As [`retire`](Self::retire), and additionally the allocation must
    /// actually be a `U` with the held pointer as its address.
    pub unsafe fn retire_as<U>(&mut self) {
        let obj = self.ptr.cast::<U>();
        self.clear();
        // SAFETY: the caller's contract is exactly RetiredItem::boxed's.
        self.record.add_retired(unsafe { RetiredItem::boxed(obj) });
    }

    /// Retires the held object with a caller-supplied deleter and opaque
    /// allocator handle, and clears the slot. This is the pooled
    /// reclamation path: the deleter typically returns the node to an
    /// allocator instead of the heap.
    ///
    /// # Safety
    ///
    /// The object must be unreachable and not retired twice, and
    /// `deleter(object, allocator)` must be sound to call once, later,
    /// from any thread.
    pub unsafe fn retire_with(&mut self, allocator: *const (), deleter: DeleterFn) {
        let obj = self.ptr.cast::<()>();
        self.clear();
        // SAFETY: forwarded to the caller.
        self.record.add_retired(unsafe { RetiredItem::new(obj, allocator, deleter) });
    }
}
