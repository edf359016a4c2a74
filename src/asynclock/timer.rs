//! Background deadline-sweep thread backing [`super::AsyncLock`]'s timeout
//! support. One [`Sweeper`] is spawned lazily the first time a
//! deadline-bounded request is queued, and rescheduled to the earliest
//! outstanding deadline every time the set of waiters changes.

use std::sync::{Condvar, Mutex, Weak};
use std::thread;
use std::time::Instant;

use super::Inner;

struct State {
    next_deadline: Option<Instant>,
    generation: u64,
    running: bool,
}

pub(crate) struct Sweeper {
    state: Mutex<State>,
    condvar: Condvar,
}

impl Sweeper {
    pub(crate) fn new() -> Self {
        Sweeper {
            state: Mutex::new(State {
                next_deadline: None,
                generation: 0,
                running: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Ensures a sweep runs at or before `deadline`. Starts the background
    /// thread on first use; otherwise just nudges an already-running
    /// thread if `deadline` is sooner than what it already knows about.
    ///
    /// Takes `self` by `Arc` (rather than `&Arc<Self>`) since the spawned
    /// thread, when one is needed, takes ownership of it directly.
    pub(crate) fn schedule(self: std::sync::Arc<Self>, inner: Weak<Inner>, deadline: Instant) {
        let mut state = self.state.lock().unwrap();
        let sooner = state.next_deadline.map_or(true, |current| deadline < current);
        if sooner {
            state.next_deadline = Some(deadline);
            state.generation = state.generation.wrapping_add(1);
        }
        if !state.running {
            state.running = true;
            drop(state);
            thread::Builder::new()
                .name("interlock-asynclock-timer".into())
                .spawn(move || self.run(inner))
                .expect("failed to spawn AsyncLock timer thread");
        } else if sooner {
            self.condvar.notify_all();
        }
    }

    fn run(self: std::sync::Arc<Self>, inner: Weak<Inner>) {
        loop {
            let fired_deadline = {
                let mut state = self.state.lock().unwrap();
                loop {
                    let Some(deadline) = state.next_deadline else {
                        state.running = false;
                        return;
                    };
                    let generation = state.generation;
                    let now = Instant::now();
                    if now >= deadline {
                        break deadline;
                    }
                    let (guard, _timeout) = self
                        .condvar
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = guard;
                    if state.generation != generation {
                        // Rescheduled while we slept; recompute from the top.
                        continue;
                    }
                }
            };

            let Some(inner) = inner.upgrade() else {
                // The AsyncLock was dropped; nothing left to sweep.
                let mut state = self.state.lock().unwrap();
                state.running = false;
                return;
            };

            let next = inner.sweep_expired(fired_deadline);
            let mut state = self.state.lock().unwrap();
            // Only adopt `next` if nobody scheduled something even sooner
            // while we were sweeping.
            if state.next_deadline == Some(fired_deadline) || state.next_deadline.is_none() {
                state.next_deadline = next;
            }
        }
    }
}
