//! Harrier: hazard-pointer safe memory reclamation for lock-free data
//! structures, plus the tagged and markable atomic pointers they are
//! built from.
//!
//! A thread that wants to dereference pointers published by a lock-free
//! structure first enters a [`HazardContext`], then reserves a small group
//! of hazard slots ([`HazardGuards`]) for the duration of an operation.
//! Loading through a slot ([`HazardPtr::load_from`]) advertises the pointer
//! to every other thread; an object whose address sits in any installed
//! slot is never reclaimed. Removal is two-phase: unlink with a CAS, then
//! [`HazardPtr::retire`] the object. Retired objects accumulate in the
//! thread's record and are swept by a global scan once the list reaches
//! the flush threshold.
//!
//! # Key properties
//!
//! - **Lock-free progress**: no operation blocks; records and slots are
//!   claimed and released with single CAS transitions.
//! - **Bounded garbage**: at most `HAZARD_FLUSH_SIZE` items per record
//!   between scans, plus whatever a scan proves is still protected.
//! - **Recycled bookkeeping**: records (and buckets, in the `bucket-slots`
//!   build) are never freed; ownership cycles through an `active` flag.
//!
//! # Example
//!
//! ```rust
//! use harrier::{HazardContext, HazardGuards};
//! use std::sync::atomic::{AtomicPtr, Ordering};
//!
//! let _ctx = HazardContext::enter();
//! let shared = AtomicPtr::new(Box::into_raw(Box::new(42u32)));
//!
//! let guards = HazardGuards::<1>::new();
//! let mut hp = guards.hazard::<u32>();
//! let p = hp.load_from(&shared);
//! assert_eq!(unsafe { *p }, 42);
//!
//! // Unlink, then hand the object to the reclamation system.
//! shared.store(std::ptr::null_mut(), Ordering::Release);
//! unsafe { hp.retire() };
//! ```

#![warn(missing_docs)]

mod align;
mod guard;
mod marked;
mod record;
mod retired;
mod tagged;

pub use align::CacheAligned;
pub use guard::{HazardContext, HazardGuards, HazardPtr};
pub use marked::{AtomicMarkedPtr, MarkedPtr};
pub use record::{HAZARD_FLUSH_SIZE, HAZARD_PTR_SIZE};
pub use retired::{DeleterFn, RetiredItem};
pub use tagged::TaggedAtomic;

#[cfg(feature = "bucket-slots")]
pub use record::HAZARD_BUCKET_SIZE;
