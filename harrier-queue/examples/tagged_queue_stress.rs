//! Tagged-queue stress driver: the same cycle as hazard_queue_stress,
//! but on the self-contained tagged-pointer queue (no hazard context).
//!
//! Usage: tagged_queue_stress [threads] [loops]

use harrier_queue::TaggedQueue;
use std::sync::{Arc, Barrier};
use std::thread;

fn main() {
    let mut args = std::env::args().skip(1);
    let num_threads: usize = args.next().map_or(2, |a| a.parse().expect("threads"));
    let num_loops: u64 = args.next().map_or(10_000_000, |a| a.parse().expect("loops"));

    let queue = Arc::new(TaggedQueue::new());
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut element: u64 = 0;
                for _ in 0..num_loops {
                    element += 1;
                    queue.enqueue(element);
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
