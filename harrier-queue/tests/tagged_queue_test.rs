//! Tagged-pointer queue tests. No hazard context is involved: the queue
//! is self-contained on its (pointer, counter) links and internal pool.

use harrier_queue::TaggedQueue;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn fifo_single_threaded() {
    let q = TaggedQueue::new();
    q.enqueue(1u64);
    q.enqueue(2);
    q.enqueue(3);
    assert_eq!(q.dequeue(), Some(1));
    assert_eq!(q.dequeue(), Some(2));
    q.enqueue(4);
    assert_eq!(q.dequeue(), Some(3));
    assert_eq!(q.dequeue(), Some(4));
    assert_eq!(q.dequeue(), None);
    assert_eq!(q.dequeue(), None);
}

#[test]
fn dequeued_nodes_recycle_through_the_pool() {
    let q = TaggedQueue::new();
    // Interleave so every enqueue after the first dequeue can reuse a
    // pooled node; correctness must be unaffected.
    for round in 0..100u64 {
        q.enqueue(round);
        q.enqueue(round + 1000);
        assert_eq!(q.dequeue(), Some(round));
        assert_eq!(q.dequeue(), Some(round + 1000));
    }
    assert_eq!(q.dequeue(), None);
}

#[test]
#[cfg_attr(miri, ignore)]
fn conservation_under_producers_and_consumers() {
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: usize = 10_000;

    let q = Arc::new(TaggedQueue::new());
    let consumed = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for p in 0..PRODUCERS {
        let q = q.clone();
        handles.push(thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                q.enqueue(p * PER_PRODUCER + i);
            }
            Vec::new()
        }));
    }
    for _ in 0..CONSUMERS {
        let q = q.clone();
        let consumed = consumed.clone();
        handles.push(thread::spawn(move || {
            let mut got = Vec::new();
            while consumed.load(Ordering::Relaxed) < PRODUCERS * PER_PRODUCER {
                if let Some(v) = q.dequeue() {
                    got.push(v);
                    consumed.fetch_add(1, Ordering::Relaxed);
                } else {
                    thread::yield_now();
                }
            }
            got
        }));
    }

    let mut all: Vec<usize> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
    all.sort_unstable();
    let unique: HashSet<usize> = all.iter().copied().collect();
    assert_eq!(unique.len(), PRODUCERS * PER_PRODUCER);

    assert_eq!(q.dequeue(), None);
}

#[test]
#[cfg_attr(miri, ignore)]
fn smoke_tagged_queue() {
    const THREADS: usize = 2;
    const LOOPS: u64 = 100_000;

    let q = Arc::new(TaggedQueue::new());
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let q = q.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut element = 0u64;
                for _ in 0..LOOPS {
                    element += 1;
                    q.enqueue(element);
                    element = q.dequeue().expect("queue observed empty mid-cycle");
                }
                element
            })
        })
        .collect();

    let sum: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(sum, THREADS as u64 * LOOPS);
}
