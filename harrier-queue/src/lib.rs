//! Lock-free unbounded Michael–Scott FIFO queues.
//!
//! Three variants share the same two-pointer, dummy-node structure and
//! differ in how they keep recycled nodes from breaking CAS:
//!
//! - [`TaggedQueue`]: double-word (pointer, counter) links defeat ABA;
//!   dequeued nodes recycle through an internal pool and are never freed
//!   until the queue drops. Requires `T: Copy` (the value is copied out
//!   under a benign race that the head CAS re-validates). Needs no
//!   hazard context.
//! - [`HazardQueue`]: plain word links protected by hazard pointers;
//!   nodes are heap allocated and retired through [`harrier`]. Any `T`.
//! - [`PooledQueue`]: the hazard queue with a Treiber free-stack
//!   allocator; retirement returns nodes to the pool instead of the heap.
//!
//! The hazard variants require every participating thread to hold a
//! [`harrier::HazardContext`].

pub mod hazard_queue;
pub mod pool;
pub mod tagged_queue;

pub use hazard_queue::HazardQueue;
pub use pool::PooledQueue;
pub use tagged_queue::TaggedQueue;
