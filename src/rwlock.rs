//! A single-word, lock-free reader/writer spinlock.
//!
//! [`SpinlockReaderWriter`] packs its entire state into one [`AtomicU64`]:
//! the low 32 bits hold either a reader count or the sentinel
//! `0xFFFF_FFFF` ("exclusive lock held"); the high 32 bits hold a non-zero
//! "acquisition ticket" while some thread is mid-transition, and are zero
//! otherwise. No blocking primitive is involved — contention is resolved by
//! retrying after an OS yield, with readers given implicit priority: a
//! writer that ever observes a reader (or a reader mid-transition) backs off
//! and retries, so writers can starve under sustained read load. That
//! trade-off is intentional; see the crate-level invariants this type is
//! tested against in `tests/stress_rwlock.rs`.

use crate::loom_compat::{thread, AtomicU32, AtomicU64, Ordering};

use crate::error::InterlockError;

const WRITER_SENTINEL: u32 = 0xFFFF_FFFF;
const WRITER_SENTINEL_WORD: u64 = WRITER_SENTINEL as u64;
const MAX_READERS: u32 = 0xFFFF_FFFE;

/// A non-reentrant, non-thread-affine reader/writer lock with no blocking
/// primitive and no auxiliary state beyond a single atomic word (plus a
/// small per-instance ticket counter, below).
///
/// Every exit routine checks that the matching entry routine actually
/// published `taken = true` for this call before it does anything
/// observable; callers are expected to track `taken` themselves (see
/// [`SpinlockReaderWriter::try_enter_write`]) so that release code driven
/// from a scope guard only ever releases a lock this call actually took.
#[derive(Debug)]
pub struct SpinlockReaderWriter {
    state: AtomicU64,
    /// Allocates the acquisition tickets written into the high 32 bits of
    /// `state` to mark "a thread is mid-transition". Values handed out are
    /// always odd (hence non-zero); uniqueness across concurrent acquirers
    /// of *this* lock is not required for correctness, only non-zero-ness,
    /// so wraparound and the rare collision are harmless. Kept per-instance
    /// rather than as one process-wide counter so that two unrelated locks
    /// never share mutable state.
    ticket: AtomicU32,
}

impl Default for SpinlockReaderWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinlockReaderWriter {
    /// Creates a new, unlocked spinlock.
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            ticket: AtomicU32::new(1),
        }
    }

    /// Creates a new, unlocked spinlock.
    ///
    /// Not `const` under `#[cfg(loom)]`: loom's atomics carry model-checker
    /// bookkeeping that can only be constructed inside a running
    /// `loom::model` closure, not in a `const` context.
    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            ticket: AtomicU32::new(1),
        }
    }

    fn next_ticket(&self) -> u64 {
        let raw = self.ticket.fetch_add(2, Ordering::Relaxed);
        (raw | 1) as u64
    }

    /// Makes a single CAS attempt to take the exclusive (write) lock.
    ///
    /// `*taken` must be `false` on entry; this call sets it to `true` iff
    /// the lock was actually acquired. On a cleanly observed non-zero
    /// state this returns immediately without spinning.
    pub fn try_enter_write(&self, taken: &mut bool) -> Result<(), InterlockError> {
        if *taken {
            return Err(InterlockError::LockAlreadyHeld);
        }
        let ticket = self.next_ticket() << 32;
        match self
            .state
            .compare_exchange(0, ticket, Ordering::Acquire, Ordering::Relaxed)
        {
            Err(_) => {
                *taken = false;
                Ok(())
            }
            Ok(_) => {
                // No suspension point between this store and `*taken = true`:
                // any thread killed here would leave `state` holding the raw
                // ticket instead of the sentinel, which is exactly the
                // "IllegalRelease" bug class the crate already detects on
                // `exit_write`.
                self.state.store(WRITER_SENTINEL_WORD, Ordering::Release);
                *taken = true;
                Ok(())
            }
        }
    }

    /// Repeatedly attempts [`Self::try_enter_write`], yielding to the OS
    /// between attempts. Never gives up.
    pub fn enter_write(&self, taken: &mut bool) {
        loop {
            self.try_enter_write(taken).expect("taken was reset to false by caller");
            if *taken {
                return;
            }
            thread::yield_now();
        }
    }

    /// Releases the exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`InterlockError::InvalidReleaseState`] if the lock was not
    /// held in exclusive mode. No recovery is attempted — the state may be
    /// inconsistent afterward.
    pub fn exit_write(&self) -> Result<(), InterlockError> {
        match self.state.compare_exchange(
            WRITER_SENTINEL_WORD,
            0,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => Ok(()),
            Err(observed) => {
                tracing::debug!(observed, "exit_write on a lock not exclusively held");
                Err(InterlockError::InvalidReleaseState)
            }
        }
    }

    /// Attempts to take a shared (read) lock, retrying internally without a
    /// bound while the state shows another thread mid-acquisition or the
    /// CAS loses a race — the same unbounded-retry shape as [`Self::enter_read`],
    /// just without the OS yield between attempts.
    ///
    /// `*taken` must be `false` on entry.
    pub fn try_enter_read(&self, taken: &mut bool) -> Result<(), InterlockError> {
        if *taken {
            return Err(InterlockError::LockAlreadyHeld);
        }
        loop {
            let current = self.state.load(Ordering::Acquire);
            let low = current as u32;
            if low == WRITER_SENTINEL {
                *taken = false;
                return Ok(());
            }
            if (current >> 32) != 0 {
                // Someone else (reader or writer) is mid-transition; a
                // writer grant could land the instant we proceed, so spin.
                std::hint::spin_loop();
                continue;
            }
            debug_assert!(low < MAX_READERS, "reader count overflow");
            let ticket = self.next_ticket();
            let marked = current | (ticket << 32);
            match self.state.compare_exchange_weak(
                current,
                marked,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Err(_) => continue,
                Ok(_) => {
                    // Commit: +1 reader, clear the ticket we just set, in
                    // one atomic step so no writer can land in between.
                    self.state
                        .fetch_add(1u64.wrapping_sub(ticket << 32), Ordering::AcqRel);
                    *taken = true;
                    return Ok(());
                }
            }
        }
    }

    /// Repeatedly attempts [`Self::try_enter_read`], yielding to the OS
    /// between attempts. Never gives up.
    pub fn enter_read(&self, taken: &mut bool) {
        loop {
            self.try_enter_read(taken).expect("taken was reset to false by caller");
            if *taken {
                return;
            }
            thread::yield_now();
        }
    }

    /// Releases one shared (read) lock.
    ///
    /// # Errors
    ///
    /// Returns [`InterlockError::InvalidReleaseState`] if this would
    /// underflow the reader count or if the lock was actually held in
    /// exclusive mode. The decrement is reverted before returning the
    /// error, so a single bad `exit_read` call does not corrupt the count
    /// for other correctly-paired callers.
    pub fn exit_read(&self) -> Result<(), InterlockError> {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        let prev_low = prev as u32;
        if prev_low == 0 || prev_low == WRITER_SENTINEL {
            self.state.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(prev_low, "exit_read on a lock not held in read mode");
            return Err(InterlockError::InvalidReleaseState);
        }
        Ok(())
    }

    /// Best-effort, racy probe: would a `try_enter_read` right now succeed?
    pub fn is_readable(&self) -> bool {
        (self.state.load(Ordering::Acquire) as u32) != WRITER_SENTINEL
    }

    /// Best-effort, racy probe: is the lock currently fully unlocked?
    pub fn is_writable(&self) -> bool {
        self.state.load(Ordering::Acquire) == 0
    }
}

unsafe impl Send for SpinlockReaderWriter {}
unsafe impl Sync for SpinlockReaderWriter {}
