//! Hazard-queue stress driver.
//!
//! Spawns N threads behind a barrier; each repeats "bump a counter,
//! enqueue it, dequeue into the counter". After joining, the per-thread
//! final counters must sum to `threads * loops`.
//!
//! Usage: hazard_queue_stress [threads] [loops]

use harrier::HazardContext;
use harrier_queue::HazardQueue;
use std::sync::{Arc, Barrier};
use std::thread;

fn main() {
    let mut args = std::env::args().skip(1);
    let num_threads: usize = args.next().map_or(2, |a| a.parse().expect("threads"));
    let num_loops: u64 = args.next().map_or(10_000_000, |a| a.parse().expect("loops"));

    let queue = Arc::new(HazardQueue::new());
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let _ctx = HazardContext::enter();
                barrier.wait();
                let mut element: u64 = 0;
                for _ in 0..num_loops {
                    element += 1;
                    queue.enqueue(element);
                    // With one dummy node per cycle in flight, a correct
                    // queue can never look empty here.
                    element = loop {
                        match queue.dequeue() {
                            Some(e) => break e,
                            None => println!("???"),
                        }
                    };
                }
                element
            })
        })
        .collect();

    let mut sum: u64 = 0;
    for (i, handle) in handles.into_iter().enumerate() {
        let element = handle.join().unwrap();
        println!("Thread {i}: last dequeued = {element}");
        sum += element;
    }
    println!("Sum: {sum}");
    if sum == num_threads as u64 * num_loops {
        println!("OK!");
    }
}
