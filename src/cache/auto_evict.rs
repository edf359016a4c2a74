//! A self-arming periodic-eviction wrapper around a [`super::TtlCache`].
//!
//! An empty cache costs nothing to hold: no timer runs until the first
//! `get`, and the timer retires itself the moment a sweep finds the cache
//! empty. The next `get` re-arms it. This mirrors the crate's
//! `asynclock::timer::Sweeper`, which likewise only runs while there is
//! deadline-bearing work to do, but `AutoEviction`'s timer is a plain
//! fixed-interval loop rather than a deadline-heap sweep, since `delete_old`
//! itself already knows which entries are due.

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::TtlCache;

/// Wraps a [`TtlCache`] so that `get` also keeps a background
/// [`TtlCache::delete_old`] sweep running at `interval` for as long as the
/// cache is non-empty.
pub struct AutoEviction<K, V, E> {
    inner: Arc<TtlCache<K, V, E>>,
    interval: Duration,
    armed: Arc<AtomicBool>,
}

impl<K, V, E> AutoEviction<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Wraps `inner`, arming a periodic `delete_old` sweep at `interval` on
    /// the next `get`.
    pub fn new(inner: Arc<TtlCache<K, V, E>>, interval: Duration) -> Self {
        AutoEviction {
            inner,
            interval,
            armed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Delegates to the wrapped cache's `get`, arming the background sweep
    /// thread first if it isn't already running.
    pub fn get(&self, key: K) -> Result<V, E> {
        self.arm_if_disarmed();
        self.inner.get(key)
    }

    fn arm_if_disarmed(&self) {
        if self
            .armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::debug!(interval = ?self.interval, "AutoEviction timer armed");
        let inner = Arc::clone(&self.inner);
        let armed = Arc::clone(&self.armed);
        let interval = self.interval;
        thread::Builder::new()
            .name("interlock-auto-evict".into())
            .spawn(move || loop {
                thread::sleep(interval);
                inner.delete_old();
                if inner.count() == 0 {
                    armed.store(false, Ordering::Release);
                    tracing::debug!("AutoEviction timer disarmed: cache is empty");
                    return;
                }
            })
            .expect("failed to spawn AutoEviction timer thread");
    }
}
