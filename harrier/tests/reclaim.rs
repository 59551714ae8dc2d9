//! Reclamation tests: the scan never frees a protected object, the flush
//! threshold and context-drop flush reclaim everything unprotected, and a
//! failing deleter is contained to its own item.

use harrier::{HazardContext, HazardGuards, HAZARD_FLUSH_SIZE};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

struct Tracked {
    freed: Arc<AtomicBool>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.freed.store(true, Ordering::SeqCst);
    }
}

/// Retires `n` untracked objects on the current thread to push its
/// retired list over the flush threshold.
fn churn_retires(n: usize) {
    for _ in 0..n {
        let guards = HazardGuards::<1>::new();
        let mut hp = guards.hazard::<u64>();
        hp.protect(Box::into_raw(Box::new(0u64)));
        unsafe { hp.retire() };
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn protected_object_survives_flushes() {
    let freed = Arc::new(AtomicBool::new(false));
    let obj = Box::into_raw(Box::new(Tracked {
        freed: freed.clone(),
    }));
    let obj_addr = obj as usize;

    let (installed_tx, installed_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let protector = thread::spawn(move || {
        let _ctx = HazardContext::enter();
        let guards = HazardGuards::<1>::new();
        let mut hp = guards.hazard::<Tracked>();
        let loc = AtomicPtr::new(obj_addr as *mut Tracked);
        hp.load_from(&loc);
        installed_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        // Object must still be alive and readable right up to here.
        assert!(!hp.is_null());
    });
    installed_rx.recv().unwrap();

    thread::spawn(move || {
        let _ctx = HazardContext::enter();
        {
            let guards = HazardGuards::<1>::new();
            let mut hp = guards.hazard::<Tracked>();
            hp.protect(obj_addr as *mut Tracked);
            unsafe { hp.retire() };
        }
        // Force several scans; none may touch the protected object.
        for _ in 0..4 {
            churn_retires(HAZARD_FLUSH_SIZE);
            assert!(
                !freed.load(Ordering::SeqCst),
                "scan reclaimed an object installed in a live hazard slot"
            );
        }

        release_tx.send(()).unwrap();
    })
    .join()
    .unwrap();

    protector.join().unwrap();
}

#[test]
fn context_drop_flushes_retired() {
    let freed = Arc::new(AtomicBool::new(false));
    let freed_in = freed.clone();
    thread::spawn(move || {
        let _ctx = HazardContext::enter();
        let guards = HazardGuards::<1>::new();
        let mut hp = guards.hazard::<Tracked>();
        hp.protect(Box::into_raw(Box::new(Tracked { freed: freed_in })));
        unsafe { hp.retire() };
        // Below the threshold: nothing reclaimed yet.
    })
    .join()
    .unwrap();
    // The context drop flushed the single-item list.
    assert!(freed.load(Ordering::SeqCst));
}

#[test]
fn threshold_flush_reclaims_unprotected_batch() {
    // Two thresholds' worth of retires: however much protected residue
    // the recycled record carried, at least one scan fires mid-loop and
    // sweeps every unprotected item retired so far.
    let flags: Vec<Arc<AtomicBool>> = (0..2 * HAZARD_FLUSH_SIZE)
        .map(|_| Arc::new(AtomicBool::new(false)))
        .collect();
    let flags_in = flags.clone();
    thread::spawn(move || {
        let _ctx = HazardContext::enter();
        for freed in flags_in {
            let guards = HazardGuards::<1>::new();
            let mut hp = guards.hazard::<Tracked>();
            hp.protect(Box::into_raw(Box::new(Tracked { freed })));
            unsafe { hp.retire() };
        }
        let swept = flags
            .iter()
            .filter(|f| f.load(Ordering::SeqCst))
            .count();
        assert!(
            swept >= HAZARD_FLUSH_SIZE,
            "expected a threshold scan before the context drops, got {swept} reclaimed"
        );
        flags
    })
    .join()
    .unwrap()
    .iter()
    .enumerate()
    .for_each(|(i, freed)| {
        // The context drop flushed the stragglers.
        assert!(freed.load(Ordering::SeqCst), "item {i} not reclaimed");
    });
}

#[test]
fn custom_deleter_receives_allocator() {
    static HITS: AtomicUsize = AtomicUsize::new(0);

    unsafe fn counting_deleter(object: *mut (), allocator: *const ()) {
        unsafe {
            drop(Box::from_raw(object.cast::<u64>()));
            (*allocator.cast::<AtomicUsize>()).fetch_add(1, Ordering::SeqCst);
        }
    }

    thread::spawn(|| {
        let _ctx = HazardContext::enter();
        let guards = HazardGuards::<1>::new();
        let mut hp = guards.hazard::<u64>();
        hp.protect(Box::into_raw(Box::new(99u64)));
        unsafe { hp.retire_with(&HITS as *const AtomicUsize as *const (), counting_deleter) };
    })
    .join()
    .unwrap();
    assert_eq!(HITS.load(Ordering::SeqCst), 1);
}

#[test]
fn panicking_deleter_does_not_poison_the_batch() {
    unsafe fn faulty_deleter(object: *mut (), _allocator: *const ()) {
        unsafe { drop(Box::from_raw(object.cast::<u64>())) };
        panic!("deleter failure");
    }

    let freed = Arc::new(AtomicBool::new(false));
    let freed_in = freed.clone();
    thread::spawn(move || {
        let _ctx = HazardContext::enter();
        let guards = HazardGuards::<2>::new();

        let mut hp = guards.hazard::<u64>();
        hp.protect(Box::into_raw(Box::new(1u64)));
        unsafe { hp.retire_with(std::ptr::null(), faulty_deleter) };

        let mut hp = guards.hazard::<Tracked>();
        hp.protect(Box::into_raw(Box::new(Tracked { freed: freed_in })));
        unsafe { hp.retire() };
    })
    .join()
    .unwrap();
    // The faulty deleter panicked inside the exit flush, but the healthy
    // item in the same batch was still reclaimed.
    assert!(freed.load(Ordering::SeqCst));
}
