//! A one-shot latch, cheap when `set` races `wait`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// The lazily-allocated blocking primitive behind a [`BooleanFlagNoReset`].
/// Only ever constructed the first time some thread reaches the waiting
/// path before the flag is set.
struct Event {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    fn new() -> Self {
        Event {
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut guard = self.signaled.lock().unwrap();
        *guard = true;
        self.condvar.notify_all();
    }

    fn block_until_signaled(&self) {
        let mut guard = self.signaled.lock().unwrap();
        while !*guard {
            guard = self.condvar.wait(guard).unwrap();
        }
    }
}

/// A one-shot latch: starts cleared, can be set exactly once (repeat
/// `set` calls are idempotent), and can never be reset.
///
/// The blocking primitive behind [`Self::wait`] is not allocated until some
/// thread actually needs to block — a `set` that wins the race against
/// every `wait` never allocates anything.
#[derive(Default)]
pub struct BooleanFlagNoReset {
    is_set: AtomicBool,
    event: Mutex<Option<Arc<Event>>>,
}

impl BooleanFlagNoReset {
    /// Creates a new, cleared flag.
    pub fn new() -> Self {
        BooleanFlagNoReset {
            is_set: AtomicBool::new(false),
            event: Mutex::new(None),
        }
    }

    /// Returns whether [`Self::set`] has ever been called. Monotonic:
    /// once this returns `true` it returns `true` forever.
    pub fn is_set(&self) -> bool {
        self.is_set.load(Ordering::Acquire)
    }

    /// Sets the flag. Idempotent and safe to call concurrently from any
    /// number of threads; only the first caller to observe an installed
    /// [`Event`] pays the cost of waking anyone blocked on it.
    pub fn set(&self) {
        self.is_set.store(true, Ordering::Release);
        let woken = self.event.lock().unwrap().take();
        if let Some(event) = woken {
            event.signal();
        }
    }

    /// Blocks the calling thread until [`Self::set`] has been called.
    /// Returns immediately if the flag is already set.
    pub fn wait(&self) {
        if self.is_set.load(Ordering::Acquire) {
            return;
        }

        let event = {
            let mut slot = self.event.lock().unwrap();
            if self.is_set.load(Ordering::Acquire) {
                None
            } else {
                Some(Arc::clone(slot.get_or_insert_with(|| Arc::new(Event::new()))))
            }
        };

        let Some(event) = event else { return };
        event.block_until_signaled();

        // Cascade the wakeup: if we're the thread that gets here with the
        // flag now set and an event still installed, clear it so later
        // waiters don't pile onto an already-fired event unnecessarily.
        if self.is_set.load(Ordering::Acquire) {
            let leftover = self.event.lock().unwrap().take();
            if let Some(leftover) = leftover {
                leftover.signal();
            }
        }
    }
}
