use std::sync::Arc;

/// Errors produced by this crate's primitives.
///
/// Propagation policy: errors surface to the caller without retry or
/// recovery attempted by the library itself. [`InterlockError::InvalidReleaseState`]
/// in particular is only ever raised by [`crate::rwlock::SpinlockReaderWriter`],
/// whose state is documented as potentially inconsistent afterward — treat
/// it as a programming bug, not a recoverable condition.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InterlockError {
    /// `exit_read`/`exit_write` called when the lock was not held in the
    /// matching mode. The spinlock's word may be corrupted after this is
    /// returned; see [`crate::rwlock::SpinlockReaderWriter`].
    #[error("lock released while not held in the expected mode")]
    InvalidReleaseState,

    /// An argument was out of its documented domain (e.g. a negative
    /// minimum lifetime, or a negative timeout other than the infinite
    /// sentinel).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A `try_enter_*` call was made with `taken` already `true`.
    #[error("try_enter called with `taken` already set to true")]
    LockAlreadyHeld,

    /// A cached build failure, re-raised verbatim to every waiter that
    /// observes it.
    #[error("cached build failure: {0}")]
    BuildFailure(Arc<dyn std::error::Error + Send + Sync>),

    /// An [`crate::asynclock::AsyncLock`] waiter was torn down (the lock
    /// was dropped) while still pending.
    #[error("waiter disposed before it was granted")]
    ObjectDisposed,

    /// An [`crate::asynclock::AsyncLock`] waiter's cancellation token fired
    /// before the waiter was granted.
    #[error("request canceled before grant")]
    Canceled,
}

// `BuildFailure` wraps a `dyn Error` with no `PartialEq` of its own, so this
// is implemented by hand (comparing its rendered message) rather than
// derived.
impl PartialEq for InterlockError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (InterlockError::InvalidReleaseState, InterlockError::InvalidReleaseState) => true,
            (InterlockError::InvalidArgument(a), InterlockError::InvalidArgument(b)) => a == b,
            (InterlockError::LockAlreadyHeld, InterlockError::LockAlreadyHeld) => true,
            (InterlockError::BuildFailure(a), InterlockError::BuildFailure(b)) => {
                a.to_string() == b.to_string()
            }
            (InterlockError::ObjectDisposed, InterlockError::ObjectDisposed) => true,
            (InterlockError::Canceled, InterlockError::Canceled) => true,
            _ => false,
        }
    }
}
