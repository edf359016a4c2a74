//! Swaps `std`'s atomics and thread primitives for `loom`'s under
//! `#[cfg(loom)]`, so `tests/loom_rwlock.rs` can exhaustively explore
//! [`crate::rwlock::SpinlockReaderWriter`]'s CAS interleavings instead of
//! merely sampling them the way `tests/stress_rwlock.rs` does. A normal
//! (non-loom) build is unaffected — this module just re-exports `std`.

#[cfg(loom)]
pub(crate) use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};
#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[cfg(loom)]
pub(crate) use loom::thread;
#[cfg(not(loom))]
pub(crate) use std::thread;
