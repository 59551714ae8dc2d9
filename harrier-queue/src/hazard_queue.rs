//! Michael–Scott queue on hazard-pointer reclamation.
//!
//! The link layer (`QueueCore`) is monomorphic: it moves `NodeBase`
//! pointers and knows nothing about values. The typed wrappers
//! ([`HazardQueue`] here, [`PooledQueue`](crate::pool::PooledQueue) in the
//! pool module) own allocation, value transfer, and retirement.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::Backoff;
use harrier::{CacheAligned, HazardGuards, HazardPtr};

/// The intrusive link cell every queue node starts with.
pub(crate) struct NodeBase {
    pub(crate) next: AtomicPtr<NodeBase>,
}

impl NodeBase {
    fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// A queue node: link first (so `*mut NodeBase` and `*mut Node<T>` are the
/// same address), then the value slot. The slot is vacant on the dummy
/// node and on pooled free nodes.
#[repr(C)]
pub(crate) struct Node<T> {
    pub(crate) base: NodeBase,
    pub(crate) value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Node<T> {
    /// Allocates a node with a vacant value slot.
    pub(crate) fn empty() -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            base: NodeBase::new(),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }))
    }
}

/// The untyped Michael–Scott protocol over hazard-protected word links.
pub(crate) struct QueueCore {
    head: CacheAligned<AtomicPtr<NodeBase>>,
    tail: CacheAligned<AtomicPtr<NodeBase>>,
}

impl QueueCore {
    pub(crate) fn new(dummy: *mut NodeBase) -> Self {
        Self {
            head: CacheAligned::new(AtomicPtr::new(dummy)),
            tail: CacheAligned::new(AtomicPtr::new(dummy)),
        }
    }

    /// Links `node` at the tail. Reserves one hazard slot: the observed
    /// tail must stay protected while its `next` is examined and CASed.
    pub(crate) fn enqueue(&self, node: *mut NodeBase) {
        let guards = HazardGuards::<1>::new();
        let mut tail_hp = guards.hazard::<NodeBase>();
        let backoff = Backoff::new();
        loop {
            let tail = tail_hp.load_from(&self.tail);
            let next = unsafe { tail_hp.deref() }.next.load(Ordering::Acquire);
            if !next.is_null() {
                // Tail lags; help it forward before retrying.
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::SeqCst, Ordering::Acquire);
                backoff.spin();
                continue;
            }
            if unsafe { tail_hp.deref() }
                .next
                .compare_exchange(ptr::null_mut(), node, Ordering::SeqCst, Ordering::Acquire)
                .is_ok()
            {
                // Best effort: a helper may already have advanced the tail.
                let _ = self
                    .tail
                    .compare_exchange(tail, node, Ordering::SeqCst, Ordering::Acquire);
                return;
            }
            backoff.spin();
        }
    }

    /// Unlinks the head. On success `head_hp` protects the old dummy
    /// (ready to retire) and `next_hp` protects the new dummy, whose
    /// value slot holds the dequeued value.
    pub(crate) fn dequeue(
        &self,
        head_hp: &mut HazardPtr<'_, NodeBase>,
        next_hp: &mut HazardPtr<'_, NodeBase>,
    ) -> bool {
        let backoff = Backoff::new();
        loop {
            let head = head_hp.load_from(&self.head);
            let next = unsafe { head_hp.deref() }.next.load(Ordering::Acquire);
            if next.is_null() {
                return false;
            }
            let tail = self.tail.load(Ordering::Relaxed);
            if head == tail {
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::SeqCst, Ordering::Acquire);
            }

            // Publishing `next` here keeps it dereferenceable after the
            // head CAS hands the old dummy to other threads. No fence is
            // needed: the CAS below is the seq-cst operation that orders
            // this publication before any retirer's scan, and on CAS
            // failure the protection is never relied upon.
            next_hp.protect_unfenced(next);
            if self
                .head
                .compare_exchange(head, next, Ordering::SeqCst, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
            backoff.spin();
        }
    }

    /// Plain head read for teardown.
    pub(crate) fn head_ptr(&mut self) -> *mut NodeBase {
        self.head.load(Ordering::Relaxed)
    }
}

/// Lock-free unbounded FIFO with heap nodes reclaimed through hazard
/// pointers.
///
/// Unlike [`TaggedQueue`](crate::tagged_queue::TaggedQueue) this takes any
/// `T`: the value is moved out of a node that a hazard slot keeps alive,
/// so no benign-race copy is involved. Every participating thread must
/// hold a [`harrier::HazardContext`].
pub struct HazardQueue<T> {
    core: QueueCore,
    _marker: PhantomData<Box<Node<T>>>,
}

// SAFETY: values cross threads by move through the CAS protocol.
unsafe impl<T: Send> Send for HazardQueue<T> {}
unsafe impl<T: Send> Sync for HazardQueue<T> {}

impl<T: 'static> Default for HazardQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> HazardQueue<T> {
    /// Creates an empty queue holding one dummy node.
    pub fn new() -> Self {
        Self {
            core: QueueCore::new(Node::<T>::empty().cast()),
            _marker: PhantomData,
        }
    }

    /// Appends `value` at the tail.
    pub fn enqueue(&self, value: T) {
        let node = Node::<T>::empty();
        unsafe { (*node).value.get().write(MaybeUninit::new(value)) };
        self.core.enqueue(node.cast());
    }

    /// Removes the value at the head, or returns `None` when the queue is
    /// empty.
    pub fn dequeue(&self) -> Option<T> {
        let guards = HazardGuards::<2>::new();
        let mut head_hp = guards.hazard::<NodeBase>();
        let mut next_hp = guards.hazard::<NodeBase>();

        if !self.core.dequeue(&mut head_hp, &mut next_hp) {
            return None;
        }

        // The new dummy (protected by next_hp) carries the value; move it
        // out, leaving the slot vacant as the dummy contract requires.
        let node = next_hp.get().cast::<Node<T>>();
        let value = unsafe { (*node).value.get().read().assume_init() };
        next_hp.clear();

        // SAFETY: the old dummy is unlinked (the head CAS removed the last
        // reachable pointer), came from Box::into_raw, and its value slot
        // is vacant, so the boxed drop frees only the node.
        unsafe { head_hp.retire_as::<Node<T>>() };
        Some(value)
    }

    /// Like [`dequeue`](Self::dequeue), but hands the value to `receiver`
    /// in place instead of moving it out. The value is destroyed after
    /// the call returns.
    pub fn dequeue_with<R>(&self, receiver: impl FnOnce(&mut T) -> R) -> Option<R> {
        let guards = HazardGuards::<2>::new();
        let mut head_hp = guards.hazard::<NodeBase>();
        let mut next_hp = guards.hazard::<NodeBase>();

        if !self.core.dequeue(&mut head_hp, &mut next_hp) {
            return None;
        }

        let node = next_hp.get().cast::<Node<T>>();
        let out = unsafe {
            let value = (*node).value.get().cast::<T>();
            let out = receiver(&mut *value);
            ptr::drop_in_place(value);
            out
        };
        next_hp.clear();

        // SAFETY: as in dequeue().
        unsafe { head_hp.retire_as::<Node<T>>() };
        Some(out)
    }
}

impl<T> Drop for HazardQueue<T> {
    fn drop(&mut self) {
        unsafe {
            let mut node = self.core.head_ptr();
            let mut is_dummy = true;
            while !node.is_null() {
                let next = (*node).next.load(Ordering::Relaxed);
                let typed = node.cast::<Node<T>>();
                if !is_dummy {
                    (*(*typed).value.get()).assume_init_drop();
                }
                drop(Box::from_raw(typed));
                node = next;
                is_dummy = false;
            }
        }
    }
}
