//! A concurrent, memoizing cache: per-key single-flight builds, a minimum
//! post-access lifetime before an entry is eligible for eviction, and an
//! LRU bound enforced by [`TtlCache::trim_to`].
//!
//! The cache composes two of the crate's other primitives:
//! [`crate::rwlock::SpinlockReaderWriter`] guards `map`+`lru` (mirroring
//! `futures_util::lock::rwlock::RwLock`'s `UnsafeCell`-behind-a-lock shape),
//! and [`crate::flag::BooleanFlagNoReset`] is the per-entry latch later
//! `get` calls wait on while a build is in flight.

mod auto_evict;
mod lru;

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::flag::BooleanFlagNoReset;
use crate::rwlock::SpinlockReaderWriter;
use lru::Lru;

pub use auto_evict::AutoEviction;

struct Entry<K, V, E> {
    key: K,
    latch: BooleanFlagNoReset,
    outcome: Mutex<Option<Result<V, E>>>,
    lru_node: usize,
}

impl<K, V, E> Entry<K, V, E>
where
    V: Clone,
    E: Clone,
{
    fn store(&self, outcome: Result<V, E>) {
        *self.outcome.lock().unwrap() = Some(outcome);
    }

    /// Only ever called after [`Self::latch`] has been observed set, so the
    /// slot is always populated: the build path writes `outcome` and *then*
    /// sets the latch (§4.4.1's "publication safety" ordering).
    fn load(&self) -> Result<V, E> {
        self.outcome
            .lock()
            .unwrap()
            .clone()
            .expect("outcome missing after latch was observed set")
    }
}

struct CacheState<K, V, E> {
    map: HashMap<K, Arc<Entry<K, V, E>>>,
    lru: Lru<K>,
}

/// A simple try-lock gate: at most one evictor proceeds at a time, matching
/// §5's "an additional mutex-like gate for evictors".
struct DeleterGate {
    locked: AtomicBool,
}

impl DeleterGate {
    fn new() -> Self {
        DeleterGate {
            locked: AtomicBool::new(false),
        }
    }

    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn acquire_blocking(&self) {
        while !self.try_acquire() {
            std::thread::yield_now();
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

struct DeleterGuard<'a>(&'a DeleterGate);

impl Drop for DeleterGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// A concurrent memoizing cache keyed by `K`, producing values of type `V`
/// from a caller-supplied `build` closure that may fail with `E`.
///
/// `get` guarantees at most one in-flight `build` call per key (§4.4.1);
/// a cached failure is re-raised, verbatim, to every later caller until the
/// key is explicitly [`Self::remove`]d.
pub struct TtlCache<K, V, E> {
    build: Box<dyn Fn(&K) -> Result<V, E> + Send + Sync>,
    min_life: Duration,
    anticipate_slow_equality: bool,
    created: Instant,
    lock: SpinlockReaderWriter,
    state: UnsafeCell<CacheState<K, V, E>>,
    concurrent_accessors: AtomicUsize,
    deletion_horizon: AtomicU64,
    deleter_gate: DeleterGate,
}

// `state` is only ever touched through `self.lock`, in exactly the pattern
// `futures_util::lock::rwlock::RwLock` uses for its own `UnsafeCell<T>`: a
// successful `enter_write`/`enter_read` is required before any reference to
// `state` is formed, and the matching guard's `Drop` releases the lock
// after the reference is gone.
unsafe impl<K: Send, V: Send, E: Send> Send for TtlCache<K, V, E> {}
unsafe impl<K: Send, V: Send, E: Send> Sync for TtlCache<K, V, E> {}

struct ExclusiveGuard<'a, K, V, E> {
    lock: &'a SpinlockReaderWriter,
    state: &'a UnsafeCell<CacheState<K, V, E>>,
}

impl<'a, K, V, E> ExclusiveGuard<'a, K, V, E> {
    fn acquire(lock: &'a SpinlockReaderWriter, state: &'a UnsafeCell<CacheState<K, V, E>>) -> Self {
        let mut taken = false;
        lock.enter_write(&mut taken);
        ExclusiveGuard { lock, state }
    }

    /// Returns `None` if the lock is currently held elsewhere.
    fn try_acquire(
        lock: &'a SpinlockReaderWriter,
        state: &'a UnsafeCell<CacheState<K, V, E>>,
    ) -> Option<Self> {
        let mut taken = false;
        lock.try_enter_write(&mut taken).expect("taken starts false");
        taken.then_some(ExclusiveGuard { lock, state })
    }
}

impl<K, V, E> std::ops::Deref for ExclusiveGuard<'_, K, V, E> {
    type Target = CacheState<K, V, E>;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.state.get() }
    }
}

impl<K, V, E> std::ops::DerefMut for ExclusiveGuard<'_, K, V, E> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.state.get() }
    }
}

impl<K, V, E> Drop for ExclusiveGuard<'_, K, V, E> {
    fn drop(&mut self) {
        self.lock.exit_write().expect("exclusive guard held the write lock");
    }
}

struct SharedGuard<'a, K, V, E> {
    lock: &'a SpinlockReaderWriter,
    state: &'a UnsafeCell<CacheState<K, V, E>>,
}

impl<'a, K, V, E> SharedGuard<'a, K, V, E> {
    fn acquire(lock: &'a SpinlockReaderWriter, state: &'a UnsafeCell<CacheState<K, V, E>>) -> Self {
        let mut taken = false;
        lock.enter_read(&mut taken);
        SharedGuard { lock, state }
    }
}

impl<K, V, E> std::ops::Deref for SharedGuard<'_, K, V, E> {
    type Target = CacheState<K, V, E>;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.state.get() }
    }
}

impl<K, V, E> Drop for SharedGuard<'_, K, V, E> {
    fn drop(&mut self) {
        self.lock.exit_read().expect("shared guard held a read lock");
    }
}

impl<K, V, E> TtlCache<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    /// Creates a new, empty cache.
    ///
    /// `min_life` is the minimum interval [`Self::delete_old`] waits after
    /// an entry's last access before considering it for eviction.
    /// `anticipate_slow_equality` enables the pre-fetch-under-shared-lock
    /// path of §4.4.1 step 1, worthwhile when `K`'s `Eq`/`Hash` impls are
    /// expensive enough that rebinding to the stored key (cheap once
    /// present) pays for the extra lock round trip.
    pub fn new<F>(build: F, min_life: Duration, anticipate_slow_equality: bool) -> Self
    where
        F: Fn(&K) -> Result<V, E> + Send + Sync + 'static,
    {
        TtlCache {
            build: Box::new(build),
            min_life,
            anticipate_slow_equality,
            created: Instant::now(),
            lock: SpinlockReaderWriter::new(),
            state: UnsafeCell::new(CacheState {
                map: HashMap::new(),
                lru: Lru::new(),
            }),
            concurrent_accessors: AtomicUsize::new(0),
            deletion_horizon: AtomicU64::new(0),
            deleter_gate: DeleterGate::new(),
        }
    }

    fn now_nanos(&self) -> u64 {
        self.created.elapsed().as_nanos() as u64
    }

    fn rebind_key_if_present(&self, key: K) -> K {
        let guard = SharedGuard::acquire(&self.lock, &self.state);
        guard.map.get(&key).map(|e| e.key.clone()).unwrap_or(key)
    }

    /// Looks up (or builds) the value for `key`.
    ///
    /// At most one `build` call per key is ever in flight: a concurrent
    /// `get` for the same key that loses the race instead waits on the
    /// entry's latch and receives the same outcome (§4.4.1, invariant 8).
    /// A cached build failure is re-raised, cloned, to every caller until
    /// [`Self::remove`] clears the key (invariant: "Error caching").
    pub fn get(&self, key: K) -> Result<V, E> {
        let key = if self.anticipate_slow_equality {
            self.rebind_key_if_present(key)
        } else {
            key
        };

        self.concurrent_accessors.fetch_add(1, Ordering::AcqRel);
        let (entry, needs_compute) = {
            let mut guard = ExclusiveGuard::acquire(&self.lock, &self.state);
            let now = self.now_nanos();
            if let Some(entry) = guard.map.get(&key) {
                let entry = Arc::clone(entry);
                guard.lru.touch(entry.lru_node, now);
                (entry, false)
            } else {
                // Inserted into `map` and appended to `lru` *before* `build`
                // runs (§3's Entry lifecycle), so a concurrent DeleteOld
                // never races an Entry whose value isn't published yet: its
                // latch is unset, so it can't be "touched" old enough to
                // evict until a `get` actually completes it.
                let lru_node = guard.lru.push_tail(key.clone(), now);
                let entry = Arc::new(Entry {
                    key: key.clone(),
                    latch: BooleanFlagNoReset::new(),
                    outcome: Mutex::new(None),
                    lru_node,
                });
                guard.map.insert(key, Arc::clone(&entry));
                (entry, true)
            }
        };
        self.concurrent_accessors.fetch_sub(1, Ordering::AcqRel);

        if needs_compute {
            let outcome = (self.build)(&entry.key);
            if outcome.is_err() {
                tracing::debug!("TtlCache build failed; caching error for later gets");
            }
            entry.store(outcome.clone());
            entry.latch.set();
            outcome
        } else {
            entry.latch.wait();
            entry.load()
        }
    }

    /// Atomically raises the eviction horizon and, if no other evictor is
    /// currently running, walks the LRU from the head evicting every entry
    /// whose last access is at or before the horizon (§4.4.2).
    ///
    /// Returns without doing any work if another `delete_old` call already
    /// holds the deleter gate — the incumbent will observe the raised
    /// horizon on its own next pass (courtesy of the horizon being a
    /// monotonic "evict everything this old or older" watermark, not a
    /// one-shot request).
    pub fn delete_old(&self) {
        let target = self.now_nanos().saturating_sub(self.min_life.as_nanos() as u64);
        self.deletion_horizon.fetch_max(target, Ordering::AcqRel);

        if !self.deleter_gate.try_acquire() {
            return;
        }
        let _gate = DeleterGuard(&self.deleter_gate);

        loop {
            while self.concurrent_accessors.load(Ordering::Acquire) > 0 {
                std::thread::yield_now();
            }
            let horizon = self.deletion_horizon.load(Ordering::Acquire);
            let mut evicted = 0usize;
            if let Some(mut guard) = ExclusiveGuard::try_acquire(&self.lock, &self.state) {
                while let Some((idx, last_access)) = guard.lru.peek_head() {
                    if self.concurrent_accessors.load(Ordering::Acquire) != 0 {
                        break;
                    }
                    if last_access > horizon {
                        break;
                    }
                    let key = guard.lru.remove(idx);
                    guard.map.remove(&key);
                    evicted += 1;
                }
            }
            if evicted > 0 {
                tracing::debug!(evicted, "TtlCache delete_old swept entries");
            }
            if self.deletion_horizon.load(Ordering::Acquire) <= horizon {
                return;
            }
        }
    }

    /// Trims the cache down to at most `max` entries, discarding the
    /// least-recently-used first, then applies [`Self::delete_old`] to
    /// whatever remains (§4.4.3).
    pub fn trim_to(&self, max: usize) {
        {
            self.deleter_gate.acquire_blocking();
            let _gate = DeleterGuard(&self.deleter_gate);
            let mut guard = ExclusiveGuard::acquire(&self.lock, &self.state);
            while guard.map.len() > max {
                let Some((idx, _)) = guard.lru.peek_head() else {
                    break;
                };
                let key = guard.lru.remove(idx);
                guard.map.remove(&key);
            }
        }
        self.delete_old();
    }

    /// Removes `key`, if present. Tries the exclusive lock first; on
    /// contention, probes under a shared lock before escalating, so a
    /// `remove` of an absent key never blocks behind unrelated writers any
    /// longer than a single shared-lock round trip (§4.4.4).
    pub fn remove(&self, key: &K) -> bool {
        if let Some(mut guard) = ExclusiveGuard::try_acquire(&self.lock, &self.state) {
            return remove_locked(&mut guard, key);
        }
        let present = {
            let guard = SharedGuard::acquire(&self.lock, &self.state);
            guard.map.contains_key(key)
        };
        if !present {
            return false;
        }
        let mut guard = ExclusiveGuard::acquire(&self.lock, &self.state);
        remove_locked(&mut guard, key)
    }

    /// The number of entries currently cached.
    pub fn count(&self) -> usize {
        let guard = SharedGuard::acquire(&self.lock, &self.state);
        guard.lru.len()
    }
}

fn remove_locked<K: Eq + Hash, V, E>(guard: &mut ExclusiveGuard<'_, K, V, E>, key: &K) -> bool {
    let Some(entry) = guard.map.remove(key) else {
        return false;
    };
    guard.lru.remove(entry.lru_node);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;
    use std::thread;

    fn counting_cache(
        min_life: Duration,
    ) -> (Arc<TtlCache<String, String, String>>, Arc<Counter>) {
        let calls = Arc::new(Counter::new(0));
        let calls2 = Arc::clone(&calls);
        let cache = Arc::new(TtlCache::new(
            move |k: &String| {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(format!("{k}:built"))
            },
            min_life,
            false,
        ));
        (cache, calls)
    }

    #[test]
    fn s4_single_flight_concurrent_gets_share_one_build() {
        let (cache, calls) = counting_cache(Duration::from_millis(300));
        let c2 = Arc::clone(&cache);
        let t = thread::spawn(move || c2.get("k".to_string()));
        let a = cache.get("k".to_string());
        let b = t.join().unwrap();
        assert_eq!(a, Ok("k:built".to_string()));
        assert_eq!(b, Ok("k:built".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn s4_delete_old_evicts_after_min_life_elapses() {
        let (cache, _calls) = counting_cache(Duration::from_millis(30));
        cache.get("k".to_string()).unwrap();
        assert_eq!(cache.count(), 1);
        thread::sleep(Duration::from_millis(60));
        cache.delete_old();
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn min_life_protects_a_freshly_accessed_entry() {
        let (cache, _calls) = counting_cache(Duration::from_secs(60));
        cache.get("k".to_string()).unwrap();
        cache.delete_old();
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn s5_build_failure_is_cached_and_reraised_until_removed() {
        let calls = Arc::new(Counter::new(0));
        let calls2 = Arc::clone(&calls);
        let cache: TtlCache<&str, &str, String> = TtlCache::new(
            move |k: &&str| {
                calls2.fetch_add(1, Ordering::SeqCst);
                if *k == "bad" {
                    Err("build exploded".to_string())
                } else {
                    Ok("fine")
                }
            },
            Duration::from_secs(60),
            false,
        );

        let first = cache.get("bad");
        let second = cache.get("bad");
        assert_eq!(first, Err("build exploded".to_string()));
        assert_eq!(second, Err("build exploded".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(cache.remove(&"bad"));
        let third = cache.get("bad");
        assert_eq!(third, Err("build exploded".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn s6_trim_to_keeps_the_most_recently_used() {
        let (cache, _calls) = counting_cache(Duration::from_secs(60));
        for i in 0..100 {
            cache.get(format!("k{i}")).unwrap();
        }
        assert_eq!(cache.count(), 100);
        cache.trim_to(60);
        assert_eq!(cache.count(), 60);
        for i in 40..100 {
            assert!(cache.get(format!("k{i}")).is_ok());
        }
    }

    #[test]
    fn remove_of_absent_key_is_false() {
        let (cache, _calls) = counting_cache(Duration::from_secs(60));
        assert!(!cache.remove(&"nope".to_string()));
    }

    #[test]
    fn anticipate_slow_equality_rebinds_to_stored_key() {
        let calls = Arc::new(Counter::new(0));
        let calls2 = Arc::clone(&calls);
        let cache: TtlCache<String, String, String> = TtlCache::new(
            move |k: &String| {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(format!("{k}:built"))
            },
            Duration::from_secs(60),
            true,
        );
        assert_eq!(cache.get("k".to_string()), Ok("k:built".to_string()));
        assert_eq!(cache.get("k".to_string()), Ok("k:built".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
