//! Harris–Michael sorted linked list.
//!
//! The chain is strictly ascending by key, anchored by an embedded head
//! dummy. A node whose `next` link carries the mark bit is logically
//! deleted; every traverser that meets one helps unlink it before
//! proceeding, so a reader never hands out a neighbour that is already
//! gone. Replacement (`put` over an existing key) marks the victim and
//! pre-links the new node in one CAS, so there is no window where the key
//! is absent.

use std::cmp::Ordering as KeyOrder;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use harrier::{AtomicMarkedPtr, HazardGuards, HazardPtr, MarkedPtr};

/// The markable link cell every node starts with. The embedded head dummy
/// is a bare `NodeBase` with no payload.
struct NodeBase {
    next: AtomicMarkedPtr<NodeBase>,
}

impl NodeBase {
    const fn new() -> Self {
        Self {
            next: AtomicMarkedPtr::null(),
        }
    }
}

/// A keyed node: link first (so `*mut NodeBase` and `*mut Node<K, V>` are
/// the same address), then the immutable payload.
#[repr(C)]
struct Node<K, V> {
    base: NodeBase,
    key: K,
    value: V,
}

/// Lock-free sorted map over a Harris–Michael linked list.
///
/// Point operations return `Option<V>` ("the operation produced a
/// result"); [`for_each`](Self::for_each) is a concurrent,
/// non-linearisable ascending traversal. Values are handed out by clone
/// because a reader shares the node with concurrent threads.
///
/// Every participating thread must hold a [`harrier::HazardContext`].
pub struct ListMap<K, V> {
    head: NodeBase,
    _marker: PhantomData<Box<Node<K, V>>>,
}

// SAFETY: nodes are immutable after publication and shared read-only;
// unlinking and reclamation go through the marked-CAS + hazard protocol.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for ListMap<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for ListMap<K, V> {}

impl<K: Ord + 'static, V: Clone + 'static> Default for ListMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + 'static, V: Clone + 'static> ListMap<K, V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            head: NodeBase::new(),
            _marker: PhantomData,
        }
    }

    fn head_ptr(&self) -> *mut NodeBase {
        &self.head as *const NodeBase as *mut NodeBase
    }

    /// # Safety
    ///
    /// `p` must point at a keyed node of this map (never the head dummy),
    /// kept alive by a hazard slot or by `&mut self`.
    unsafe fn node<'x>(p: *mut NodeBase) -> &'x Node<K, V> {
        // SAFETY: Node is #[repr(C)] with its base as first field.
        unsafe { &*p.cast::<Node<K, V>>() }
    }

    /// Positions `prev`/`curr` around `key`.
    ///
    /// Precondition: `prev` views a node known to sort below `key` (or the
    /// head dummy). Postcondition: `prev` views the last node below `key`;
    /// `curr` views the first node at-or-above it (null past the end), and
    /// `curr_next` holds that node's link. Returns whether `curr` carries
    /// exactly `key`.
    fn search<'g>(
        &self,
        prev: &mut HazardPtr<'g, NodeBase>,
        curr: &mut HazardPtr<'g, NodeBase>,
        curr_next: &mut MarkedPtr<NodeBase>,
        key: &K,
    ) -> bool {
        'reload: loop {
            let mut prev_next = unsafe { prev.deref() }.next.load(Ordering::Acquire);
            'revalidate: loop {
                if prev_next.is_marked() {
                    // The predecessor was deleted under us; restart at the
                    // head.
                    prev.set_anchor(self.head_ptr());
                    continue 'reload;
                }
                loop {
                    if prev_next.is_null() {
                        curr.clear();
                        return false;
                    }
                    curr.protect(prev_next.as_ptr());
                    // The publication only protects if prev still links to
                    // the node we installed.
                    let reread = unsafe { prev.deref() }.next.load(Ordering::Acquire);
                    if reread != prev_next {
                        prev_next = reread;
                        continue 'revalidate;
                    }

                    *curr_next = unsafe { curr.deref() }.next.load(Ordering::Acquire);
                    if curr_next.is_marked() {
                        // curr is logically deleted: help unlink it before
                        // accepting any neighbour.
                        if unsafe { prev.deref() }.next
                            .compare_and_set(prev_next, curr_next.without_mark())
                        {
                            unsafe { curr.retire_as::<Node<K, V>>() };
                            prev_next = curr_next.without_mark();
                            continue;
                        } else {
                            continue 'reload;
                        }
                    }

                    match unsafe { Self::node(curr.get()) }.key.cmp(key) {
                        KeyOrder::Less => {
                            prev.swap(curr);
                            prev_next = *curr_next;
                            continue;
                        }
                        KeyOrder::Equal => return true,
                        KeyOrder::Greater => return false,
                    }
                }
            }
        }
    }

    /// Deletes `curr` by marking its link while pre-linking `replacement`,
    /// then helps `prev` over to it. Inputs must satisfy `search`'s
    /// postcondition. On success returns the deleted node's value; on
    /// failure refreshes `curr_next` and returns `None`.
    fn replace_curr<'g>(
        &self,
        prev: &HazardPtr<'g, NodeBase>,
        curr: &mut HazardPtr<'g, NodeBase>,
        curr_next: &mut MarkedPtr<NodeBase>,
        replacement: MarkedPtr<NodeBase>,
    ) -> Option<V> {
        debug_assert!(!curr_next.is_marked());
        debug_assert!(!replacement.is_marked());
        let curr_ptr = curr.get();
        if unsafe { curr.deref() }
            .next
            .compare_and_set(*curr_next, replacement.with_mark())
        {
            let unlinked = unsafe { prev.deref() }
                .next
                .compare_and_set(MarkedPtr::new(curr_ptr), replacement);
            let old = unsafe { Self::node(curr_ptr) }.value.clone();
            // Only retire when our unlink CAS won; a loser's unlink is
            // finished by whichever traverser helps next, and that
            // traverser retires the node.
            if unlinked {
                unsafe { curr.retire_as::<Node<K, V>>() };
            }
            Some(old)
        } else {
            *curr_next = unsafe { curr.deref() }.next.load(Ordering::Acquire);
            None
        }
    }

    /// Looks up `key` and clones its value.
    pub fn get(&self, key: &K) -> Option<V> {
        let guards = HazardGuards::<2>::new();
        let mut prev = guards.hazard::<NodeBase>();
        let mut curr = guards.hazard::<NodeBase>();
        let mut curr_next = MarkedPtr::null();

        prev.set_anchor(self.head_ptr());
        if self.search(&mut prev, &mut curr, &mut curr_next, key) {
            Some(unsafe { Self::node(curr.get()) }.value.clone())
        } else {
            None
        }
    }

    /// Inserts `key -> value`. If the key was present the old node is
    /// replaced and its value returned; otherwise `None`.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let node = Box::into_raw(Box::new(Node {
            base: NodeBase::new(),
            key,
            value,
        }));
        let node_key = unsafe { &(*node).key };

        let guards = HazardGuards::<2>::new();
        let mut prev = guards.hazard::<NodeBase>();
        let mut curr = guards.hazard::<NodeBase>();
        let mut curr_next = MarkedPtr::null();

        prev.set_anchor(self.head_ptr());
        loop {
            if self.search(&mut prev, &mut curr, &mut curr_next, node_key) {
                // Replace curr with node. Marking curr's link and
                // pre-linking node happen in one CAS, so the key never
                // goes missing in between.
                loop {
                    unsafe { (*node).base.next.store(curr_next, Ordering::Relaxed) };
                    if let Some(old) = self.replace_curr(
                        &prev,
                        &mut curr,
                        &mut curr_next,
                        MarkedPtr::new(node.cast::<NodeBase>()),
                    ) {
                        return Some(old);
                    }
                    if curr_next.is_marked() {
                        // Another thread deleted curr first; search again.
                        break;
                    }
                }
            } else {
                // Insert node between prev and curr.
                let prev_next = MarkedPtr::new(curr.get());
                unsafe { (*node).base.next.store(prev_next, Ordering::Relaxed) };
                if unsafe { prev.deref() }.next
                    .compare_and_set(prev_next, MarkedPtr::new(node.cast::<NodeBase>()))
                {
                    return None;
                }
            }
        }
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&self, key: &K) -> Option<V> {
        let guards = HazardGuards::<2>::new();
        let mut prev = guards.hazard::<NodeBase>();
        let mut curr = guards.hazard::<NodeBase>();
        let mut curr_next = MarkedPtr::null();

        prev.set_anchor(self.head_ptr());
        loop {
            if !self.search(&mut prev, &mut curr, &mut curr_next, key) {
                return None;
            }
            // Removal is replacement by curr's own successor.
            loop {
                let replacement = curr_next;
                if let Some(old) = self.replace_curr(&prev, &mut curr, &mut curr_next, replacement)
                {
                    return Some(old);
                }
                if curr_next.is_marked() {
                    break;
                }
            }
        }
    }

    /// Visits every entry in ascending key order, concurrently with
    /// writers.
    ///
    /// Guarantees: keys are visited in strictly ascending order; a key
    /// present for the whole call is visited exactly once; keys inserted
    /// or removed mid-call may or may not be seen. When a deleted
    /// predecessor forces a restart from the head, the last visited node
    /// is parked in a third hazard slot and visiting resumes only past
    /// its key.
    pub fn for_each<F: FnMut(&K, &V)>(&self, mut f: F) {
        let guards = HazardGuards::<3>::new();
        let mut prev = guards.hazard::<NodeBase>();
        let mut curr = guards.hazard::<NodeBase>();
        let mut skip = guards.hazard::<NodeBase>();

        'restart: loop {
            prev.set_anchor(self.head_ptr());
            'reload: loop {
                let mut prev_next = unsafe { prev.deref() }.next.load(Ordering::Acquire);
                'revalidate: loop {
                    if prev_next.is_marked() {
                        // Restarting from the head: park the last visited
                        // node so its key and everything below are not
                        // reported twice.
                        if skip.is_null() {
                            skip.swap(&mut prev);
                        }
                        continue 'restart;
                    }
                    loop {
                        if prev_next.is_null() {
                            return;
                        }
                        curr.protect(prev_next.as_ptr());
                        let reread = unsafe { prev.deref() }.next.load(Ordering::Acquire);
                        if reread != prev_next {
                            prev_next = reread;
                            continue 'revalidate;
                        }

                        let curr_next = unsafe { curr.deref() }.next.load(Ordering::Acquire);
                        if curr_next.is_marked() {
                            if unsafe { prev.deref() }.next
                                .compare_and_set(prev_next, curr_next.without_mark())
                            {
                                unsafe { curr.retire_as::<Node<K, V>>() };
                                prev_next = curr_next.without_mark();
                                continue;
                            } else {
                                continue 'reload;
                            }
                        }

                        // Past the resumption point: start reporting again.
                        if !skip.is_null()
                            && unsafe { Self::node(skip.get()) }.key
                                < unsafe { Self::node(curr.get()) }.key
                        {
                            skip.clear();
                        }
                        if skip.is_null() {
                            let n = unsafe { Self::node(curr.get()) };
                            f(&n.key, &n.value);
                        }

                        prev.swap(&mut curr);
                        prev_next = curr_next;
                    }
                }
            }
        }
    }
}

impl<K, V> Drop for ListMap<K, V> {
    fn drop(&mut self) {
        let mut node = self.head.next.load(Ordering::Relaxed).without_mark().as_ptr();
        while !node.is_null() {
            let next = unsafe { &(*node).next }
                .load(Ordering::Relaxed)
                .without_mark()
                .as_ptr();
            unsafe { drop(Box::from_raw(node.cast::<Node<K, V>>())) };
            node = next;
        }
    }
}
