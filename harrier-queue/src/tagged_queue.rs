//! Michael–Scott queue on double-word tagged pointers.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;

use crossbeam_utils::Backoff;
use harrier::{CacheAligned, TaggedAtomic};

struct Node<T> {
    next: TaggedAtomic<Node<T>>,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Node<T> {
    fn empty() -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: TaggedAtomic::null(),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }))
    }
}

/// Lock-free unbounded FIFO whose links carry (pointer, counter) pairs.
///
/// Dequeued nodes go to an internal LIFO pool and are only freed when the
/// queue drops, so a stale pointer always refers to *some* node; the tag
/// counter makes a stale (pointer, tag) snapshot fail its CAS.
///
/// `T: Copy` is load-bearing, not a convenience: `dequeue` copies the
/// value bytes out of a node that another thread may concurrently recycle
/// and overwrite. The copy is taken before the head CAS and only trusted
/// once that CAS confirms the snapshot was stable, which is exactly the
/// contract a trivially copyable type satisfies.
pub struct TaggedQueue<T: Copy> {
    head: CacheAligned<TaggedAtomic<Node<T>>>,
    tail: CacheAligned<TaggedAtomic<Node<T>>>,
    pool: CacheAligned<TaggedAtomic<Node<T>>>,
}

// SAFETY: all shared mutation goes through the tagged CAS protocol; values
// cross threads by copy.
unsafe impl<T: Copy + Send> Send for TaggedQueue<T> {}
unsafe impl<T: Copy + Send> Sync for TaggedQueue<T> {}

impl<T: Copy> Default for TaggedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> TaggedQueue<T> {
    /// Creates an empty queue holding one dummy node.
    pub fn new() -> Self {
        let dummy = Node::empty();
        Self {
            head: CacheAligned::new(TaggedAtomic::new(dummy, 0)),
            tail: CacheAligned::new(TaggedAtomic::new(dummy, 0)),
            pool: CacheAligned::new(TaggedAtomic::new(ptr::null_mut(), 0)),
        }
    }

    /// Pops a node from the pool, or allocates one if the pool is empty.
    /// The pop bumps the tag; that increment is what defeats ABA when a
    /// popped node is pushed back between our load and CAS.
    fn alloc_node(&self, value: T) -> *mut Node<T> {
        let backoff = Backoff::new();
        loop {
            let pool_tag = self.pool.load_tag();
            let pool_ptr = self.pool.load_ptr();
            if pool_ptr.is_null() {
                let node = Node::empty();
                unsafe { (*node).value.get().write(MaybeUninit::new(value)) };
                return node;
            }
            let next_ptr = unsafe { (*pool_ptr).next.load_ptr() };
            if self
                .pool
                .compare_and_set(pool_ptr, pool_tag, next_ptr, pool_tag + 1)
            {
                unsafe {
                    (*pool_ptr).next.store_ptr(ptr::null_mut());
                    (*pool_ptr).value.get().write(MaybeUninit::new(value));
                }
                return pool_ptr;
            }
            backoff.spin();
        }
    }

    /// Pushes a dequeued node onto the pool. Other threads may still hold
    /// stale pointers to it, so it must not be freed. The tag stays put:
    /// the head slot itself is protected by the pop-side increment, and a
    /// recycled node's identity is re-checked by the next pop.
    fn free_node(&self, node: *mut Node<T>) {
        let backoff = Backoff::new();
        loop {
            let pool_tag = self.pool.load_tag();
            let pool_ptr = self.pool.load_ptr();
            unsafe { (*node).next.store_ptr(pool_ptr) };
            if self.pool.compare_and_set(pool_ptr, pool_tag, node, pool_tag) {
                return;
            }
            backoff.spin();
        }
    }

    /// Appends `value` at the tail.
    pub fn enqueue(&self, value: T) {
        let node = self.alloc_node(value);
        let backoff = Backoff::new();
        loop {
            let tail_tag = self.tail.load_tag();
            let tail_ptr = self.tail.load_ptr();
            let next_tag = unsafe { (*tail_ptr).next.load_tag() };
            let next_ptr = unsafe { (*tail_ptr).next.load_ptr() };
            if tail_tag != self.tail.load_tag() {
                continue;
            }
            if !next_ptr.is_null() {
                // Tail lags; help it forward before retrying.
                self.tail
                    .compare_and_set(tail_ptr, tail_tag, next_ptr, tail_tag + 1);
                continue;
            }
            if unsafe { &(*tail_ptr).next }.compare_and_set(next_ptr, next_tag, node, next_tag + 1)
            {
                // Best effort: a helper may already have advanced the tail.
                self.tail.compare_and_set(tail_ptr, tail_tag, node, tail_tag + 1);
                return;
            }
            backoff.spin();
        }
    }

    /// Removes the value at the head, or returns `None` when the queue is
    /// empty.
    pub fn dequeue(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            let head_tag = self.head.load_tag();
            let head_ptr = self.head.load_ptr();
            let tail_tag = self.tail.load_tag();
            let tail_ptr = self.tail.load_ptr();
            let next_ptr = unsafe { (*head_ptr).next.load_ptr() };
            if head_tag != self.head.load_tag() {
                continue;
            }
            if next_ptr.is_null() {
                return None;
            }
            if head_ptr == tail_ptr {
                self.tail
                    .compare_and_set(tail_ptr, tail_tag, next_ptr, tail_tag + 1);
                continue;
            }

            // The bytes must be copied before the head CAS: right after
            // it, another thread can recycle the old head and overwrite
            // the node. The copy stays a MaybeUninit until the CAS proves
            // the snapshot was stable, so a torn copy is never trusted.
            let value = unsafe { (*next_ptr).value.get().read() };
            if self
                .head
                .compare_and_set(head_ptr, head_tag, next_ptr, head_tag + 1)
            {
                self.free_node(head_ptr);
                return Some(unsafe { value.assume_init() });
            }
            backoff.spin();
        }
    }
}

impl<T: Copy> Drop for TaggedQueue<T> {
    fn drop(&mut self) {
        // T: Copy has no drop glue; both chains are just freed.
        unsafe {
            let mut node = self.head.load_ptr();
            while !node.is_null() {
                let next = (*node).next.load_ptr();
                drop(Box::from_raw(node));
                node = next;
            }
            let mut node = self.pool.load_ptr();
            while !node.is_null() {
                let next = (*node).next.load_ptr();
                drop(Box::from_raw(node));
                node = next;
            }
        }
    }
}
