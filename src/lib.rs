//! Lock-free reader/writer locking, a one-shot latch, a FIFO async mutex
//! with cancellation and timeout, and a single-flight TTL cache with LRU
//! trimming.
//!
//! The four primitives in this crate share one design principle: every
//! acquisition routine commits to "lock is held" in a single,
//! non-interruptible step, so that a thread killed between "decided to
//! acquire" and "told the caller it acquired" can never leave the lock
//! observably (but silently) held. See [`rwlock::SpinlockReaderWriter`] for
//! the sharpest example of the pattern.
//!
//! - [`rwlock::SpinlockReaderWriter`] — single-word, non-reentrant
//!   reader/writer spinlock.
//! - [`flag::BooleanFlagNoReset`] — one-shot latch with lazily allocated
//!   blocking primitive.
//! - [`asynclock::AsyncLock`] — strictly FIFO, suspension-based mutual
//!   exclusion with cancellation and deadline timeout.
//! - [`cache::TtlCache`] — concurrent memoizing cache with per-key
//!   single-flight builds, minimum-lifetime eviction and LRU trimming.
//! - [`cache::AutoEviction`] — self-arming periodic-eviction wrapper around
//!   a [`cache::TtlCache`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod error;
mod loom_compat;
pub mod rwlock;
pub mod flag;
mod waiter;
pub mod asynclock;
pub mod cache;

pub use error::InterlockError;
pub use rwlock::SpinlockReaderWriter;
pub use flag::BooleanFlagNoReset;
pub use asynclock::{AsyncLock, Receipt, CancelToken};
pub use cache::{TtlCache, AutoEviction};
