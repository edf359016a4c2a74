//! The per-request state machine shared by every queued [`crate::asynclock::AsyncLock`]
//! waiter, independent of how it is indexed (queue position, receipt-index,
//! deadline-index all live in `asynclock::mod`).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::task::Waker;
use std::time::Instant;

/// `Pending → {GrantedTrue, GrantedFalse, Canceled}` exactly once (via CAS);
/// any state may transition to `Disposed` at end of life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WaiterState {
    Pending = 0,
    GrantedTrue = 1,
    GrantedFalse = 2,
    Canceled = 3,
    Disposed = 4,
}

impl WaiterState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WaiterState::Pending,
            1 => WaiterState::GrantedTrue,
            2 => WaiterState::GrantedFalse,
            3 => WaiterState::Canceled,
            4 => WaiterState::Disposed,
            _ => unreachable!("invalid waiter state byte"),
        }
    }
}

/// One outstanding `EnterAsync`/`TryEnterAsync` request. Always reached
/// through an `Arc`, since its pointer identity *is* the receipt identity
/// once it leaves the fast path.
#[derive(Debug)]
pub(crate) struct Waiter {
    state: AtomicU8,
    waker: Mutex<Option<Waker>>,
    pub(crate) deadline: Option<Instant>,
}

impl Waiter {
    pub(crate) fn new(deadline: Option<Instant>) -> Self {
        Waiter {
            state: AtomicU8::new(WaiterState::Pending as u8),
            waker: Mutex::new(None),
            deadline,
        }
    }

    pub(crate) fn state(&self) -> WaiterState {
        WaiterState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempts the one legal `Pending -> to` transition. Returns whether
    /// this call won the race.
    pub(crate) fn transition_from_pending(&self, to: WaiterState) -> bool {
        self.state
            .compare_exchange(
                WaiterState::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Unconditionally moves to `Disposed`, regardless of current state.
    pub(crate) fn dispose(&self) {
        self.state.store(WaiterState::Disposed as u8, Ordering::Release);
    }

    pub(crate) fn register_waker(&self, cx_waker: &Waker) {
        let mut slot = self.waker.lock().unwrap();
        match slot.as_ref() {
            Some(w) if w.will_wake(cx_waker) => {}
            _ => *slot = Some(cx_waker.clone()),
        }
    }

    pub(crate) fn wake(&self) {
        if let Some(w) = self.waker.lock().unwrap().take() {
            w.wake();
        }
    }
}
