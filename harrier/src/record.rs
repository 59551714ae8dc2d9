//! Hazard records, slot storage, and the global scan.
//!
//! Every thread that enters a context claims a `HazardRecord`. Records
//! live on a global append-only list and are never freed; ownership
//! cycles through the `active` flag (CAS `0 -> 1` claims, release store
//! `1 -> 0` frees). Slot storage is either an inline array per record
//! (default) or a set of fixed-size buckets recycled through a second
//! global list (`bucket-slots`).
//!
//! A flush enumerates every installed slot into the record's scratch
//! buffer (seq-cst fence first, so it is ordered against retirers' final
//! writes), sorts and dedupes it, and deletes every retired item whose
//! address is absent from the set.

use crate::align::CacheAligned;
use crate::retired::RetiredItem;
use core::cell::{Cell, UnsafeCell};
use core::ptr;
use core::sync::atomic::{fence, AtomicPtr, AtomicU32, Ordering};
use once_cell::race::OnceBox;

/// Hazard slots per record in the inline build.
#[cfg(feature = "slots-8")]
pub const HAZARD_PTR_SIZE: usize = 8;
/// Hazard slots per record in the inline build.
#[cfg(all(feature = "slots-4", not(feature = "slots-8")))]
pub const HAZARD_PTR_SIZE: usize = 4;
/// Hazard slots per record in the inline build.
#[cfg(not(any(feature = "slots-4", feature = "slots-8")))]
pub const HAZARD_PTR_SIZE: usize = 3;

/// Hazard slots per bucket in the bucketed build.
#[cfg(all(feature = "bucket-slots", feature = "bucket-size-4"))]
pub const HAZARD_BUCKET_SIZE: usize = 4;
/// Hazard slots per bucket in the bucketed build.
#[cfg(all(feature = "bucket-slots", not(feature = "bucket-size-4")))]
pub const HAZARD_BUCKET_SIZE: usize = 2;

/// Retire-list length that triggers a scan.
#[cfg(feature = "flush-64")]
pub const HAZARD_FLUSH_SIZE: usize = 64;
/// Retire-list length that triggers a scan.
#[cfg(all(feature = "flush-32", not(feature = "flush-64")))]
pub const HAZARD_FLUSH_SIZE: usize = 32;
/// Retire-list length that triggers a scan.
#[cfg(not(any(feature = "flush-32", feature = "flush-64")))]
pub const HAZARD_FLUSH_SIZE: usize = 16;

// ---------------------------------------------------------------------------
// Slot storage: inline array (default) vs recycled buckets
// ---------------------------------------------------------------------------

#[cfg(not(feature = "bucket-slots"))]
mod slots {
    use super::*;

    /// Inline slot array. `in_use` is a bump counter over `hp`; groups
    /// reserve and release in LIFO order (enforced by scoping).
    pub(crate) struct SlotStore {
        pub(super) hp: [AtomicPtr<()>; HAZARD_PTR_SIZE],
        in_use: Cell<usize>,
    }

    impl SlotStore {
        pub(super) fn new() -> Self {
            Self {
                hp: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
                in_use: Cell::new(0),
            }
        }

        pub(crate) fn reserve<const N: usize>(&'static self) -> [&'static AtomicPtr<()>; N] {
            let start = self.in_use.get();
            assert!(
                start + N <= HAZARD_PTR_SIZE,
                "hazard slot reservation exceeds HAZARD_PTR_SIZE ({HAZARD_PTR_SIZE})"
            );
            self.in_use.set(start + N);
            core::array::from_fn(|i| &self.hp[start + i])
        }

        pub(crate) fn release(&self, n: usize, first: &AtomicPtr<()>) {
            let start = self.in_use.get() - n;
            debug_assert!(ptr::eq(first, &self.hp[start]));
            self.in_use.set(start);
        }

        /// Called when the owning context leaves; all groups must be gone.
        pub(super) fn detach(&self) {
            assert_eq!(
                self.in_use.get(),
                0,
                "hazard context dropped while slot groups are live"
            );
        }
    }
}

#[cfg(feature = "bucket-slots")]
mod slots {
    use super::*;

    /// Bucketed slot storage: the record references a grown-on-demand set
    /// of global buckets, `HAZARD_BUCKET_SIZE` slots each. Slot `i` lives
    /// at `buckets[i / SIZE].hp[i % SIZE]`.
    pub(crate) struct SlotStore {
        buckets: UnsafeCell<Vec<&'static HazardBucket>>,
        in_use: Cell<usize>,
    }

    impl SlotStore {
        pub(super) fn new() -> Self {
            Self {
                buckets: UnsafeCell::new(Vec::new()),
                in_use: Cell::new(0),
            }
        }

        pub(crate) fn reserve<const N: usize>(&'static self) -> [&'static AtomicPtr<()>; N] {
            let start = self.in_use.get();
            let needed = (start + N).div_ceil(HAZARD_BUCKET_SIZE);
            // SAFETY: the bucket vector is only touched by the thread that
            // claimed the record.
            let buckets = unsafe { &mut *self.buckets.get() };
            while buckets.len() < needed {
                buckets.push(root().acquire_bucket());
            }
            self.in_use.set(start + N);
            core::array::from_fn(|i| {
                let idx = start + i;
                &buckets[idx / HAZARD_BUCKET_SIZE].hp[idx % HAZARD_BUCKET_SIZE]
            })
        }

        pub(crate) fn release(&self, n: usize, _first: &AtomicPtr<()>) {
            // Buckets stay attached until the context leaves; only the
            // bump counter retreats.
            self.in_use.set(self.in_use.get() - n);
        }

        /// Called when the owning context leaves: returns every bucket to
        /// the free pool. Slots were already cleared by the group drops.
        pub(super) fn detach(&self) {
            assert_eq!(
                self.in_use.get(),
                0,
                "hazard context dropped while slot groups are live"
            );
            // SAFETY: owner-thread only, as in reserve().
            let buckets = unsafe { &mut *self.buckets.get() };
            fence(Ordering::Release);
            for bucket in buckets.drain(..) {
                bucket.active.store(0, Ordering::Relaxed);
            }
        }
    }

    /// A fixed-size group of hazard slots, recycled through the global
    /// bucket list. Buckets outlive threads; only ownership cycles.
    /// Allocated through [`CacheAligned`] so no two buckets share a line.
    pub(crate) struct HazardBucket {
        pub(super) next: AtomicPtr<HazardBucket>,
        pub(super) active: AtomicU32,
        pub(super) hp: [AtomicPtr<()>; HAZARD_BUCKET_SIZE],
    }

    impl HazardBucket {
        pub(super) fn new() -> Self {
            Self {
                next: AtomicPtr::new(ptr::null_mut()),
                active: AtomicU32::new(1),
                hp: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            }
        }
    }
}

#[cfg(feature = "bucket-slots")]
pub(crate) use slots::HazardBucket;
pub(crate) use slots::SlotStore;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Per-thread hazard bookkeeping. Owned by at most one thread at a time;
/// the slot atomics are read by every scanning thread. Allocated through
/// [`CacheAligned`] so no two records share a line.
pub(crate) struct HazardRecord {
    next: AtomicPtr<HazardRecord>,
    active: AtomicU32,
    pub(crate) slots: SlotStore,
    retired: UnsafeCell<Vec<RetiredItem>>,
    scratch: UnsafeCell<Vec<*const ()>>,
}

// SAFETY: `next`, `active` and the hazard slots are atomics; the
// non-atomic fields (`retired`, `scratch`, the slot bump counter, the
// bucket vector) are only touched by the thread that holds `active`.
unsafe impl Sync for HazardRecord {}

impl HazardRecord {
    fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            active: AtomicU32::new(1),
            slots: SlotStore::new(),
            retired: UnsafeCell::new(Vec::with_capacity(HAZARD_FLUSH_SIZE)),
            scratch: UnsafeCell::new(Vec::new()),
        }
    }

    /// Appends an item to the retired list; scans once the list reaches
    /// the flush threshold.
    pub(crate) fn add_retired(&self, item: RetiredItem) {
        if item.object().is_null() {
            return;
        }
        let len = {
            // SAFETY: the retired list is owned by the claiming thread.
            let retired = unsafe { &mut *self.retired.get() };
            retired.push(item);
            retired.len()
        };
        if len >= HAZARD_FLUSH_SIZE {
            root().flush(self);
        }
    }
}

// ---------------------------------------------------------------------------
// Global root
// ---------------------------------------------------------------------------

/// Global registry: the record list and, in the bucketed build, the
/// bucket list. Both are append-only and leaked; entries recycle via
/// their `active` flags.
pub(crate) struct HazardRoot {
    records: AtomicPtr<HazardRecord>,
    #[cfg(feature = "bucket-slots")]
    buckets: AtomicPtr<HazardBucket>,
}

static ROOT: OnceBox<HazardRoot> = OnceBox::new();

/// The global registry singleton.
pub(crate) fn root() -> &'static HazardRoot {
    ROOT.get_or_init(|| {
        Box::new(HazardRoot {
            records: AtomicPtr::new(ptr::null_mut()),
            #[cfg(feature = "bucket-slots")]
            buckets: AtomicPtr::new(ptr::null_mut()),
        })
    })
}

impl HazardRoot {
    /// Claims a free record, or allocates and publishes a fresh one.
    pub(crate) fn acquire_record(&self) -> &'static HazardRecord {
        let mut rec = self.records.load(Ordering::Acquire);
        while !rec.is_null() {
            // SAFETY: records are leaked; any published pointer is valid.
            let r = unsafe { &*rec };
            if r.active.load(Ordering::Relaxed) == 0
                && r
                    .active
                    .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return r;
            }
            rec = r.next.load(Ordering::Acquire);
        }

        let r: &'static HazardRecord = Box::leak(Box::new(CacheAligned::new(HazardRecord::new())));
        loop {
            let head = self.records.load(Ordering::Relaxed);
            r.next.store(head, Ordering::Relaxed);
            if self
                .records
                .compare_exchange(head, r as *const _ as *mut _, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return r;
            }
        }
    }

    /// Releases a record back to the free pool. Retired residue is
    /// flushed once; whatever a scan still protects stays in the record
    /// and is re-flushed by the next claimant.
    pub(crate) fn release_record(&self, record: &'static HazardRecord) {
        record.slots.detach();
        // SAFETY: still the owning thread until `active` is cleared.
        if !unsafe { &*record.retired.get() }.is_empty() {
            self.flush(record);
        }
        record.active.store(0, Ordering::Release);
    }

    #[cfg(feature = "bucket-slots")]
    pub(crate) fn acquire_bucket(&self) -> &'static HazardBucket {
        let mut bkt = self.buckets.load(Ordering::Acquire);
        while !bkt.is_null() {
            // SAFETY: buckets are leaked; any published pointer is valid.
            let b = unsafe { &*bkt };
            if b.active.load(Ordering::Relaxed) == 0
                && b
                    .active
                    .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return b;
            }
            bkt = b.next.load(Ordering::Acquire);
        }

        let b: &'static HazardBucket = Box::leak(Box::new(CacheAligned::new(HazardBucket::new())));
        loop {
            let head = self.buckets.load(Ordering::Relaxed);
            b.next.store(head, Ordering::Relaxed);
            if self
                .buckets
                .compare_exchange(head, b as *const _ as *mut _, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return b;
            }
        }
    }

    /// Enumerates every installed hazard slot into `out`, sorted and
    /// deduped. The leading seq-cst fence pairs with the one in slot
    /// installation, so a retirer that saw its object unlinked cannot
    /// miss a protection published before the protector's re-read.
    fn collect(&self, out: &mut Vec<*const ()>) {
        fence(Ordering::SeqCst);
        out.clear();

        #[cfg(not(feature = "bucket-slots"))]
        {
            let mut rec = self.records.load(Ordering::Acquire);
            while !rec.is_null() {
                // SAFETY: records are leaked.
                let r = unsafe { &*rec };
                for slot in &r.slots.hp {
                    let p = slot.load(Ordering::Acquire);
                    if !p.is_null() {
                        out.push(p as *const ());
                    }
                }
                rec = r.next.load(Ordering::Acquire);
            }
        }

        #[cfg(feature = "bucket-slots")]
        {
            let mut bkt = self.buckets.load(Ordering::Acquire);
            while !bkt.is_null() {
                // SAFETY: buckets are leaked.
                let b = unsafe { &*bkt };
                for slot in &b.hp {
                    let p = slot.load(Ordering::Acquire);
                    if !p.is_null() {
                        out.push(p as *const ());
                    }
                }
                bkt = b.next.load(Ordering::Acquire);
            }
        }

        fence(Ordering::Acquire);
        out.sort_unstable();
        out.dedup();
    }

    /// Scans all hazard slots and deletes every retired item the scan
    /// does not protect. Protected items go back on the record's list.
    pub(crate) fn flush(&self, record: &HazardRecord) {
        // Take the list first so deleters (which may retire more items or
        // even re-enter flush) never alias our borrows.
        // SAFETY: retired/scratch are owned by the claiming thread.
        let items = core::mem::take(unsafe { &mut *record.retired.get() });

        let mut kept = Vec::new();
        let mut doomed = Vec::new();
        {
            let scratch = unsafe { &mut *record.scratch.get() };
            self.collect(scratch);
            if scratch.is_empty() {
                // No slot is installed anywhere: everything goes.
                doomed = items;
            } else {
                for item in items {
                    if scratch.binary_search(&(item.object() as *const ())).is_ok() {
                        kept.push(item);
                    } else {
                        doomed.push(item);
                    }
                }
            }
        }

        {
            let retired = unsafe { &mut *record.retired.get() };
            retired.append(&mut kept);
        }

        for item in doomed {
            item.run_deleter();
        }
    }
}
