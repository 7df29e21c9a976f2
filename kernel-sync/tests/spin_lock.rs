use kernel_sync::SpinLock;
use std::panic;

#[test]
fn guard_drop_unlocks() {
    let lock = SpinLock::new(0u32);
    {
        let mut g = lock.lock();
        *g = 41;
    }
    {
        let mut g = lock.lock();
        *g += 1;
        assert_eq!(*g, 42);
    }
}

#[test]
fn try_lock_fails_while_held() {
    let lock = SpinLock::new(7u8);

    let g1 = lock.try_lock().expect("uncontended try_lock");
    assert_eq!(*g1, 7);
    assert!(lock.try_lock().is_none());

    drop(g1);
    assert!(lock.try_lock().is_some());
}

#[test]
fn with_lock_releases_after_closure() {
    let lock = SpinLock::new(String::from("a"));
    let len = lock.with_lock(|s| {
        s.push('b');
        s.len()
    });
    assert_eq!(len, 2);
    assert_eq!(lock.with_lock(|s: &mut String| s.clone()), "ab");
}

#[test]
fn get_mut_bypasses_locking() {
    let mut lock = SpinLock::new(vec![1, 2, 3]);
    lock.get_mut().push(4);
    assert_eq!(lock.lock().as_slice(), &[1, 2, 3, 4]);
}

#[test]
fn contended_counter_is_exact() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let inside = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let start = Arc::clone(&start);
            std::thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock(|v| {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "lock not exclusive");
                        *v += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                    std::thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn unlocks_even_when_closure_panics() {
    let lock = SpinLock::new(0u32);

    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        lock.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(result.is_err());

    assert_eq!(lock.with_lock(|v| *v), 123);
}
