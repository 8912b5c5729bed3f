use gpu_sync::{Completion, Deadline, SpinLock, WorkerPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use std::{panic, thread};

#[test]
fn basic_lock_and_raii() {
    let l = SpinLock::new(0_u32);

    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }

    // previous drop must have unlocked
    assert!(!l.is_locked());
    let mut g = l.lock();
    *g += 1;
    assert_eq!(*g, 42);
}

#[test]
fn try_lock_semantics() {
    let l = SpinLock::new(1u8);

    let g1 = l.try_lock();
    assert!(g1.is_some());
    assert!(l.try_lock().is_none());

    drop(g1);
    assert!(l.try_lock().is_some());
}

#[test]
fn get_mut_and_into_inner() {
    let mut l = SpinLock::new(vec![1, 2, 3]);
    l.get_mut().push(4);
    assert_eq!(l.into_inner(), vec![1, 2, 3, 4]);
}

/// Items move between three sets under one lock, the way chunk-set
/// membership is maintained; every item must stay in exactly one set.
#[test]
fn contended_set_moves_keep_membership_disjoint() {
    const ITEMS: usize = 64;
    let threads = 8;
    let iters = 2_000;

    let sets = Arc::new(SpinLock::new([
        (0..ITEMS).collect::<Vec<_>>(),
        Vec::new(),
        Vec::new(),
    ]));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let sets = Arc::clone(&sets);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for i in 0..iters {
                    sets.with_lock(|s| {
                        let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "mutual exclusion violated");
                        let from = (t + i) % 3;
                        let to = (from + 1) % 3;
                        if let Some(item) = s[from].pop() {
                            s[to].push(item);
                        }
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let mut all = sets.with_lock(|s| s.concat());
    all.sort_unstable();
    assert_eq!(all, (0..ITEMS).collect::<Vec<_>>());
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");
    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn completion_from_pool_reaches_every_waiter() {
    let pool = WorkerPool::new("completion", 2).unwrap();
    let done = Completion::<Result<u64, &'static str>>::new();
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let c = done.clone();
            thread::spawn(move || c.wait(Duration::from_secs(5)))
        })
        .collect();

    let producer = done.clone();
    pool.execute(move || {
        thread::sleep(Duration::from_millis(5));
        producer.complete(Ok(9));
    })
    .unwrap();

    for w in waiters {
        assert_eq!(w.join().unwrap(), Some(Ok(9)));
    }
}

#[test]
fn deadline_bounds_polling() {
    let flag = Arc::new(AtomicUsize::new(0));
    let setter = Arc::clone(&flag);
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(5));
        setter.store(1, Ordering::SeqCst);
    });
    assert!(Deadline::after(Duration::from_secs(5)).poll(|| flag.load(Ordering::SeqCst) == 1));

    let d = Deadline::after(Duration::from_millis(5));
    assert!(!d.poll(|| false));
    assert!(d.expired());
    assert_eq!(d.remaining(), Duration::ZERO);
}

#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let l = SpinLock::new(0u8);
    takes_sync(&l);
}
