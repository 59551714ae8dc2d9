//! Sorted-list map tests: point-operation semantics, replacement
//! behaviour, and the traversal guarantees under concurrent churn.

use harrier::HazardContext;
use harrier_map::ListMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn entries(map: &ListMap<i32, String>) -> Vec<(i32, String)> {
    let mut out = Vec::new();
    map.for_each(|k, v| out.push((*k, v.clone())));
    out
}

#[test]
fn single_threaded_script() {
    let _ctx = HazardContext::enter();
    let map = ListMap::new();

    assert_eq!(map.put(7, "foo".to_string()), None);
    assert_eq!(map.put(3, "bar".to_string()), None);
    assert_eq!(map.put(5, "baz".to_string()), None);
    assert_eq!(
        entries(&map),
        vec![
            (3, "bar".to_string()),
            (5, "baz".to_string()),
            (7, "foo".to_string()),
        ]
    );

    assert_eq!(map.get(&5), Some("baz".to_string()));
    assert_eq!(map.get(&6), None);

    // Replacement returns the old value; fresh insert returns None.
    assert_eq!(map.put(3, "hoge".to_string()), Some("bar".to_string()));
    assert_eq!(map.put(4, "fuga".to_string()), None);
    assert_eq!(
        entries(&map),
        vec![
            (3, "hoge".to_string()),
            (4, "fuga".to_string()),
            (5, "baz".to_string()),
            (7, "foo".to_string()),
        ]
    );

    assert_eq!(map.remove(&5), Some("baz".to_string()));
    assert_eq!(map.remove(&6), None);
    assert_eq!(
        entries(&map),
        vec![
            (3, "hoge".to_string()),
            (4, "fuga".to_string()),
            (7, "foo".to_string()),
        ]
    );
}

#[test]
fn empty_map_behaviour() {
    let _ctx = HazardContext::enter();
    let map: ListMap<i32, String> = ListMap::new();
    assert_eq!(map.get(&1), None);
    assert_eq!(map.remove(&1), None);
    assert!(entries(&map).is_empty());
}

#[test]
fn put_remove_inverse() {
    let _ctx = HazardContext::enter();
    let map = ListMap::new();
    assert_eq!(map.put(11, "x".to_string()), None);
    assert_eq!(map.remove(&11), Some("x".to_string()));
    assert_eq!(map.get(&11), None);
    assert!(entries(&map).is_empty());
}

#[test]
fn replacement_chain() {
    let _ctx = HazardContext::enter();
    let map = ListMap::new();
    assert_eq!(map.put(1, "a".to_string()), None);
    assert_eq!(map.put(1, "b".to_string()), Some("a".to_string()));
    assert_eq!(map.put(1, "c".to_string()), Some("b".to_string()));
    assert_eq!(map.get(&1), Some("c".to_string()));
    assert_eq!(entries(&map), vec![(1, "c".to_string())]);
}

#[test]
#[cfg_attr(miri, ignore)]
fn churn_keeps_the_chain_sorted() {
    const THREADS: u64 = 4;
    const OPS: u64 = 20_000;
    const KEYSPACE: u64 = 64;

    let map = Arc::new(ListMap::new());
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let map = map.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let _ctx = HazardContext::enter();
                barrier.wait();
                // Cheap per-thread LCG; no need for real randomness.
                let mut state = tid.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
                for i in 0..OPS {
                    state = state
                        .wrapping_mul(6364136223846793005)
                        .wrapping_add(1442695040888963407);
                    let key = (state >> 33) % KEYSPACE;
                    if state & 1 == 0 {
                        map.put(key, tid * OPS + i);
                    } else {
                        map.remove(&key);
                    }
                }
            })
        })
        .collect();

    // Concurrent traversals must always observe strictly ascending keys.
    let stop = Arc::new(AtomicBool::new(false));
    let traverser = {
        let map = map.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let _ctx = HazardContext::enter();
            while !stop.load(Ordering::Relaxed) {
                let mut last: Option<u64> = None;
                map.for_each(|k, _| {
                    if let Some(prev) = last {
                        assert!(prev < *k, "traversal regressed: {prev} then {k}");
                    }
                    last = Some(*k);
                });
            }
        })
    };

    for h in handles {
        h.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    traverser.join().unwrap();

    let _ctx = HazardContext::enter();
    let mut keys = Vec::new();
    map.for_each(|k, _| keys.push(*k));
    let mut sorted = keys.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(keys, sorted, "post-quiescence chain not strictly sorted");
    assert!(keys.iter().all(|k| *k < KEYSPACE));
}

#[test]
#[cfg_attr(miri, ignore)]
fn stable_keys_visited_exactly_once_during_churn() {
    const STABLE_KEYS: u64 = 50;
    const OPS: u64 = 30_000;

    let map = Arc::new(ListMap::new());
    {
        let _ctx = HazardContext::enter();
        for k in 0..STABLE_KEYS {
            map.put(k * 2, u64::MAX);
        }
    }

    // Churn odd keys around the stable even ones.
    let stop = Arc::new(AtomicBool::new(false));
    let churners: Vec<_> = (0..2u64)
        .map(|tid| {
            let map = map.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let _ctx = HazardContext::enter();
                let mut i = 0u64;
                while !stop.load(Ordering::Relaxed) && i < OPS {
                    let key = (i % STABLE_KEYS) * 2 + 1;
                    if (i + tid) % 2 == 0 {
                        map.put(key, i);
                    } else {
                        map.remove(&key);
                    }
                    i += 1;
                }
            })
        })
        .collect();

    {
        let _ctx = HazardContext::enter();
        for _ in 0..50 {
            let mut seen_even = Vec::new();
            let mut last: Option<u64> = None;
            map.for_each(|k, _| {
                if let Some(prev) = last {
                    assert!(prev < *k);
                }
                last = Some(*k);
                if *k % 2 == 0 {
                    seen_even.push(*k);
                }
            });
            // Every continuously present key: exactly once, in order.
            let expected: Vec<u64> = (0..STABLE_KEYS).map(|k| k * 2).collect();
            assert_eq!(seen_even, expected);
        }
    }

    stop.store(true, Ordering::Relaxed);
    for h in churners {
        h.join().unwrap();
    }
}

#[test]
fn values_drop_with_the_map() {
    struct CountsDrop(Arc<std::sync::atomic::AtomicUsize>);
    impl Clone for CountsDrop {
        fn clone(&self) -> Self {
            CountsDrop(self.0.clone())
        }
    }
    impl Drop for CountsDrop {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let drops = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    {
        let _ctx = HazardContext::enter();
        let map = ListMap::new();
        for k in 0..5 {
            map.put(k, CountsDrop(drops.clone()));
        }
        let removed = map.remove(&2).unwrap();
        drop(removed);
    }
    // 5 node values + 1 clone handed out by remove; the removed node
    // itself is reclaimed when the context drops.
    assert_eq!(drops.load(Ordering::SeqCst), 6);
}
