//! A Treiber free-stack node allocator and the queue variant that
//! recycles through it.
//!
//! Nodes re-enter the pool only through SMR retirement, which is what
//! makes the pop-side hazard sufficient: while a popping thread's slot
//! holds the observed top, no scan will let that node be pushed back, so
//! the top cannot reappear under the CAS with a different `next` (the ABA
//! case a plain Treiber pop suffers).

use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::hazard_queue::{Node, NodeBase, QueueCore};
use crossbeam_utils::Backoff;
use harrier::{CacheAligned, HazardGuards};

/// Lock-free stack of free nodes. Drained to the heap on drop.
pub(crate) struct NodePool<T> {
    top: CacheAligned<AtomicPtr<NodeBase>>,
    _marker: std::marker::PhantomData<Box<Node<T>>>,
}

// SAFETY: pooled nodes carry no live value; the stack is maintained by CAS.
unsafe impl<T: Send> Send for NodePool<T> {}
unsafe impl<T: Send> Sync for NodePool<T> {}

impl<T: 'static> NodePool<T> {
    pub(crate) fn new() -> Self {
        Self {
            top: CacheAligned::new(AtomicPtr::new(ptr::null_mut())),
            _marker: std::marker::PhantomData,
        }
    }

    /// Pops a free node, or allocates one when the pool is empty. The
    /// observed top is read through a hazard slot so its `next` stays
    /// valid and un-recycled across the CAS.
    pub(crate) fn acquire(&self) -> *mut Node<T> {
        let guards = HazardGuards::<1>::new();
        let mut top_hp = guards.hazard::<NodeBase>();
        let backoff = Backoff::new();
        loop {
            let top = top_hp.load_from(&self.top);
            if top.is_null() {
                return Node::empty();
            }
            let next = unsafe { top_hp.deref() }.next.load(Ordering::Acquire);
            if self
                .top
                .compare_exchange(top, next, Ordering::SeqCst, Ordering::Acquire)
                .is_ok()
            {
                unsafe { top_hp.deref() }.next.store(ptr::null_mut(), Ordering::Relaxed);
                return top.cast();
            }
            backoff.spin();
        }
    }

    /// Pushes a node. Called from the reclamation deleter, i.e. only once
    /// a scan has proven no hazard slot holds the node.
    pub(crate) fn release(&self, node: *mut NodeBase) {
        let backoff = Backoff::new();
        loop {
            let top = self.top.load(Ordering::Relaxed);
            unsafe { (*node).next.store(top, Ordering::Relaxed) };
            if self
                .top
                .compare_exchange(top, node, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }
}

impl<T> Drop for NodePool<T> {
    fn drop(&mut self) {
        unsafe {
            let mut node = self.top.load(Ordering::Relaxed);
            while !node.is_null() {
                let next = (*node).next.load(Ordering::Relaxed);
                // Free nodes have vacant value slots.
                drop(Box::from_raw(node.cast::<Node<T>>()));
                node = next;
            }
        }
    }
}

/// Reclamation path for pooled nodes: reconstruct the pool handle the
/// retire site leaked into the allocator field and give the node back.
/// The per-item `Arc` keeps the pool alive until the last in-flight
/// retired node has been recycled.
unsafe fn recycle<T: 'static>(object: *mut (), allocator: *const ()) {
    // SAFETY: the retire site stored `Arc::into_raw(pool)` in `allocator`
    // and an unlinked `*mut Node<T>` in `object`.
    let pool = unsafe { Arc::from_raw(allocator.cast::<NodePool<T>>()) };
    pool.release(object.cast::<NodeBase>());
}

/// [`HazardQueue`](crate::hazard_queue::HazardQueue) with a pooled node
/// allocator: dequeued dummies are retired back into a Treiber free stack
/// and reused by later enqueues, so steady-state operation allocates
/// nothing. The pool is drained to the heap when the queue and every
/// in-flight retired node are gone.
pub struct PooledQueue<T> {
    core: QueueCore,
    pool: Arc<NodePool<T>>,
}

// SAFETY: as HazardQueue; the pool adds no shared non-atomic state.
unsafe impl<T: Send> Send for PooledQueue<T> {}
unsafe impl<T: Send> Sync for PooledQueue<T> {}

impl<T: 'static> Default for PooledQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> PooledQueue<T> {
    /// Creates an empty queue holding one dummy node.
    pub fn new() -> Self {
        Self {
            core: QueueCore::new(Node::<T>::empty().cast()),
            pool: Arc::new(NodePool::new()),
        }
    }

    /// Appends `value` at the tail, reusing a pooled node when one is
    /// free.
    pub fn enqueue(&self, value: T) {
        let node = self.pool.acquire();
        unsafe { (*node).value.get().write(MaybeUninit::new(value)) };
        self.core.enqueue(node.cast());
    }

    /// Removes the value at the head, or returns `None` when the queue is
    /// empty. The old dummy is retired back to the pool.
    pub fn dequeue(&self) -> Option<T> {
        let guards = HazardGuards::<2>::new();
        let mut head_hp = guards.hazard::<NodeBase>();
        let mut next_hp = guards.hazard::<NodeBase>();

        if !self.core.dequeue(&mut head_hp, &mut next_hp) {
            return None;
        }

        let node = next_hp.get().cast::<Node<T>>();
        let value = unsafe { (*node).value.get().read().assume_init() };
        next_hp.clear();

        let allocator = Arc::into_raw(Arc::clone(&self.pool)).cast::<()>();
        // SAFETY: the old dummy is unlinked with a vacant value slot; the
        // deleter returns it to the pool named by `allocator`.
        unsafe { head_hp.retire_with(allocator, recycle::<T>) };
        Some(value)
    }
}

impl<T> Drop for PooledQueue<T> {
    fn drop(&mut self) {
        // The chain goes straight to the heap; pooled free nodes go when
        // the last Arc (ours or an in-flight retired item's) drops.
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
