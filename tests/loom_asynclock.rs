//! Model-checked coverage of [`AsyncLock`]'s mutual-exclusion property
//! under `loom`. Not run by a normal `cargo test`; requires building with
//! `--cfg loom`.
//!
//! `AsyncLock`'s holder is guarded by a `std::sync::Mutex`, not a raw CAS,
//! so this check explores scheduling order at the granularity loom gives
//! blocking `std` primitives rather than every possible atomic
//! interleaving the way `tests/loom_rwlock.rs` does for the spinlock; it
//! still catches ordering bugs a thread-based stress test could miss by
//! chance.
#![cfg(loom)]

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use loom::sync::Arc;
use loom::thread;

use interlock::AsyncLock;

/// Drives `receipt` to completion by polling in a spin loop with a no-op
/// waker. `futures::executor::block_on`'s real thread-parking wake path
/// isn't a `loom`-tracked primitive, so it is avoided here in favor of a
/// poll loop loom's scheduler can interleave with everything else.
fn spin_poll<F: Future + Unpin>(mut f: F) -> F::Output {
    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    loop {
        match Pin::new(&mut f).poll(&mut cx) {
            Poll::Ready(v) => return v,
            Poll::Pending => loom::thread::yield_now(),
        }
    }
}

#[test]
fn uncontended_then_contended_enter_is_mutually_exclusive() {
    loom::model(|| {
        let lock = Arc::new(AsyncLock::new(true));
        let inside = Arc::new(loom::sync::atomic::AtomicUsize::new(0));

        let holder = lock.enter_async();
        assert!(lock.is_held_by(&holder));

        let lock2 = Arc::clone(&lock);
        let inside2 = Arc::clone(&inside);
        let contender = thread::spawn(move || {
            let receipt = spin_poll(lock2.enter_async());
            assert_eq!(receipt, Ok(true));
            let before = inside2.fetch_add(1, loom::sync::atomic::Ordering::SeqCst);
            assert_eq!(before, 0);
            inside2.fetch_sub(1, loom::sync::atomic::Ordering::SeqCst);
        });

        assert!(lock.exit(&holder));
        contender.join().unwrap();
    });
}
