//! A FIFO, suspension-based async mutex with cancellation and timeout.
//!
//! [`AsyncLock`] hands out [`Receipt`]s: futures that resolve to `Ok(true)`
//! once granted, `Ok(false)` if the request gave up without ever being
//! granted (a timeout), or `Err` if it was canceled or the lock was torn
//! down while the request was still queued. The common uncontended case
//! never touches the wait queue at all; contended requests queue in
//! first-in-first-out order and are granted one at a time as the lock is
//! released.
//!
//! Receipt identity, not a token the caller constructs, is what [`AsyncLock::exit`]
//! matches against: two `enter_async()` calls never produce
//! interchangeable receipts, even when [`AsyncLock::reuses_receipts`] is
//! `true` and both calls return what is, underneath, the same singleton.

mod timer;

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use slab::Slab;

use crate::error::InterlockError;
use crate::waiter::{Waiter, WaiterState};

const SPIN_LIMIT: usize = 200;
const MAX_SPINNERS: usize = 4;

#[derive(Debug, Clone, Copy)]
enum SyncOutcome {
    Granted(bool),
    Canceled,
}

#[derive(Debug)]
struct CompletedToken {
    outcome: SyncOutcome,
}

/// An outstanding, still-queued request's identity, carrying just enough to
/// let [`Receipt::drop`] and [`AsyncLock::exit`] remove it from the queue in
/// O(1) without scanning.
#[derive(Debug, Clone)]
struct PendingReceipt {
    waiter: Arc<Waiter>,
    inner: Weak<Inner>,
    key: usize,
}

#[derive(Debug, Clone)]
enum ReceiptRepr {
    Completed(Arc<CompletedToken>),
    Pending(PendingReceipt),
}

impl ReceiptRepr {
    fn same(a: &ReceiptRepr, b: &ReceiptRepr) -> bool {
        match (a, b) {
            (ReceiptRepr::Completed(x), ReceiptRepr::Completed(y)) => Arc::ptr_eq(x, y),
            (ReceiptRepr::Pending(x), ReceiptRepr::Pending(y)) => Arc::ptr_eq(&x.waiter, &y.waiter),
            _ => false,
        }
    }
}

/// A single `EnterAsync`/`TryEnterAsync` request. Implements [`Future`]; the
/// only way to observe its outcome is to poll it (directly, or via an
/// executor) to completion, or to inspect it through [`AsyncLock::is_held_by`].
///
/// Dropping a `Receipt` whose request is still pending cancels it, exactly
/// as if a [`CancelToken`] attached to the same request had fired.
#[derive(Debug)]
pub struct Receipt(ReceiptRepr);

impl Future for Receipt {
    type Output = Result<bool, InterlockError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &self.0 {
            ReceiptRepr::Completed(tok) => Poll::Ready(match tok.outcome {
                SyncOutcome::Granted(v) => Ok(v),
                SyncOutcome::Canceled => Err(InterlockError::Canceled),
            }),
            ReceiptRepr::Pending(p) => match p.waiter.state() {
                WaiterState::Pending => {
                    p.waiter.register_waker(cx.waker());
                    // Re-check: a grant racing the registration above must
                    // not be missed (transition happens-before wake()).
                    match p.waiter.state() {
                        WaiterState::Pending => Poll::Pending,
                        other => Poll::Ready(outcome_for(other)),
                    }
                }
                other => Poll::Ready(outcome_for(other)),
            },
        }
    }
}

impl futures_core::future::FusedFuture for Receipt {
    fn is_terminated(&self) -> bool {
        match &self.0 {
            ReceiptRepr::Completed(_) => true,
            ReceiptRepr::Pending(p) => p.waiter.state() != WaiterState::Pending,
        }
    }
}

fn outcome_for(state: WaiterState) -> Result<bool, InterlockError> {
    match state {
        WaiterState::GrantedTrue => Ok(true),
        WaiterState::GrantedFalse => Ok(false),
        WaiterState::Canceled => Err(InterlockError::Canceled),
        WaiterState::Disposed => Err(InterlockError::ObjectDisposed),
        WaiterState::Pending => unreachable!("caller only matches on a settled state"),
    }
}

impl Drop for Receipt {
    fn drop(&mut self) {
        if let ReceiptRepr::Pending(p) = &self.0 {
            if p.waiter.transition_from_pending(WaiterState::Canceled) {
                if let Some(inner) = p.inner.upgrade() {
                    let mut queue = inner.queue.lock().unwrap();
                    inner.remove_from_queue(&mut queue, p.key);
                }
                p.waiter.dispose();
            }
        }
    }
}

struct CancelRegistration {
    waiter: Weak<Waiter>,
    inner: Weak<Inner>,
    key: usize,
}

struct CancelInner {
    canceled: std::sync::atomic::AtomicBool,
    registered: Mutex<Option<CancelRegistration>>,
}

/// A handle a caller can fire to cancel a still-pending [`AsyncLock::try_enter_async_timeout`]
/// request before it is granted. Cancellation is one-shot and idempotent;
/// firing it after the request already settled (grant, timeout, or an
/// earlier cancellation) is a harmless no-op.
#[derive(Clone)]
pub struct CancelToken(Arc<CancelInner>);

impl CancelToken {
    /// Creates a fresh, unfired token.
    pub fn new() -> Self {
        CancelToken(Arc::new(CancelInner {
            canceled: std::sync::atomic::AtomicBool::new(false),
            registered: Mutex::new(None),
        }))
    }

    /// Returns whether [`Self::cancel`] has been called.
    pub fn is_canceled(&self) -> bool {
        self.0.canceled.load(Ordering::Acquire)
    }

    /// Cancels the request this token is attached to, if any. A token that
    /// is canceled before it is ever attached to a request causes that
    /// request to complete as already-canceled the moment it is queued.
    pub fn cancel(&self) {
        self.0.canceled.store(true, Ordering::Release);
        if let Some(reg) = self.0.registered.lock().unwrap().take() {
            Self::fire(reg);
        }
    }

    fn register(&self, waiter: Weak<Waiter>, inner: Weak<Inner>, key: usize) {
        if self.0.canceled.load(Ordering::Acquire) {
            Self::fire(CancelRegistration { waiter, inner, key });
            return;
        }
        *self.0.registered.lock().unwrap() = Some(CancelRegistration { waiter, inner, key });
    }

    fn fire(reg: CancelRegistration) {
        let Some(waiter) = reg.waiter.upgrade() else {
            return;
        };
        if !waiter.transition_from_pending(WaiterState::Canceled) {
            return;
        }
        if let Some(inner) = reg.inner.upgrade() {
            let mut queue = inner.queue.lock().unwrap();
            inner.remove_from_queue(&mut queue, reg.key);
        }
        waiter.dispose();
        waiter.wake();
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

struct QueueNode {
    waiter: Arc<Waiter>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct QueueInner {
    slab: Slab<QueueNode>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    deadlines: BinaryHeap<Reverse<(Instant, usize)>>,
}

impl QueueInner {
    fn new() -> Self {
        QueueInner {
            slab: Slab::new(),
            head: None,
            tail: None,
            len: 0,
            deadlines: BinaryHeap::new(),
        }
    }

    fn unlink(&mut self, key: usize) -> Option<QueueNode> {
        let node = self.slab.try_remove(key)?;
        match node.prev {
            Some(p) => self.slab[p].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.slab[n].prev = node.prev,
            None => self.tail = node.prev,
        }
        self.len -= 1;
        Some(node)
    }
}

struct Inner {
    reuse_receipts: bool,
    true_receipt: Arc<CompletedToken>,
    false_receipt: Arc<CompletedToken>,
    holder: Mutex<Option<ReceiptRepr>>,
    queue: Mutex<QueueInner>,
    queue_count: AtomicIsize,
    spin_gate: AtomicUsize,
    timer: Arc<timer::Sweeper>,
}

impl Inner {
    fn remove_from_queue(&self, queue: &mut QueueInner, key: usize) -> Option<Arc<Waiter>> {
        let node = queue.unlink(key)?;
        self.queue_count.store(queue.len as isize, Ordering::Relaxed);
        Some(node.waiter)
    }

    /// Called from the timer thread once `fired_deadline` has elapsed.
    /// Times out every expired, still-pending waiter and returns the next
    /// deadline the timer should wake up for, if any.
    fn sweep_expired(&self, _fired_deadline: Instant) -> Option<Instant> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            let Some(&Reverse((deadline, key))) = queue.deadlines.peek() else {
                return None;
            };
            let still_current = queue
                .slab
                .get(key)
                .map(|n| n.waiter.deadline == Some(deadline))
                .unwrap_or(false);
            if !still_current {
                queue.deadlines.pop();
                continue;
            }
            if deadline > Instant::now() {
                return Some(deadline);
            }
            queue.deadlines.pop();
            let Some(waiter) = self.remove_from_queue(&mut queue, key) else {
                continue;
            };
            if waiter.transition_from_pending(WaiterState::GrantedFalse) {
                waiter.dispose();
                waiter.wake();
                tracing::trace!("AsyncLock waiter timed out waiting for grant");
            }
        }
    }
}

/// A FIFO, suspension-based async mutex supporting cancellation and
/// per-request timeouts.
///
/// `reuse_receipts` controls whether every uncontended synchronous grant
/// reuses one of two process-wide singleton receipts (cheaper: no
/// allocation on the hot path, at the cost of every such grant looking
/// identical to [`Self::is_held_by`]) or always allocates a fresh one
/// (every grant individually identifiable, matching the `false`-path
/// default most mutex types use).
pub struct AsyncLock {
    inner: Arc<Inner>,
}

struct SpinGuard<'a>(&'a AtomicUsize);

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl AsyncLock {
    /// Creates a new, unheld lock.
    pub fn new(reuse_receipts: bool) -> Self {
        AsyncLock {
            inner: Arc::new(Inner {
                reuse_receipts,
                true_receipt: Arc::new(CompletedToken {
                    outcome: SyncOutcome::Granted(true),
                }),
                false_receipt: Arc::new(CompletedToken {
                    outcome: SyncOutcome::Granted(false),
                }),
                holder: Mutex::new(None),
                queue: Mutex::new(QueueInner::new()),
                queue_count: AtomicIsize::new(0),
                spin_gate: AtomicUsize::new(0),
                timer: Arc::new(timer::Sweeper::new()),
            }),
        }
    }

    /// Whether uncontended synchronous grants reuse a singleton receipt.
    pub fn reuses_receipts(&self) -> bool {
        self.inner.reuse_receipts
    }

    fn try_grant_uncontended(&self) -> Option<Receipt> {
        let mut holder = self.inner.holder.lock().unwrap();
        if holder.is_some() {
            return None;
        }
        let repr = if self.inner.reuse_receipts {
            ReceiptRepr::Completed(Arc::clone(&self.inner.true_receipt))
        } else {
            ReceiptRepr::Completed(Arc::new(CompletedToken {
                outcome: SyncOutcome::Granted(true),
            }))
        };
        *holder = Some(repr.clone());
        Some(Receipt(repr))
    }

    fn make_false_receipt(&self) -> Receipt {
        let tok = if self.inner.reuse_receipts {
            Arc::clone(&self.inner.false_receipt)
        } else {
            Arc::new(CompletedToken {
                outcome: SyncOutcome::Granted(false),
            })
        };
        Receipt(ReceiptRepr::Completed(tok))
    }

    fn make_canceled_receipt(&self) -> Receipt {
        Receipt(ReceiptRepr::Completed(Arc::new(CompletedToken {
            outcome: SyncOutcome::Canceled,
        })))
    }

    /// Enqueues (or immediately grants, if the queue is empty and nobody
    /// else wins the race first) a request with an optional deadline and
    /// cancellation token.
    fn enter_queue_or_grant(&self, deadline: Option<Instant>, cancel: Option<CancelToken>) -> Receipt {
        let waiter;
        let key;
        {
            let mut queue = self.inner.queue.lock().unwrap();
            if queue.head.is_none() {
                if let Some(r) = self.try_grant_uncontended() {
                    return r;
                }
            }
            waiter = Arc::new(Waiter::new(deadline));
            key = queue.slab.insert(QueueNode {
                waiter: Arc::clone(&waiter),
                prev: queue.tail,
                next: None,
            });
            if let Some(tail) = queue.tail {
                queue.slab[tail].next = Some(key);
            } else {
                queue.head = Some(key);
            }
            queue.tail = Some(key);
            queue.len += 1;
            self.inner.queue_count.store(queue.len as isize, Ordering::Relaxed);
            tracing::trace!(queue_len = queue.len, "AsyncLock request enqueued");
            if let Some(d) = deadline {
                queue.deadlines.push(Reverse((d, key)));
            }
        }
        if let Some(d) = deadline {
            self.inner.timer.schedule(Arc::downgrade(&self.inner), d);
        }
        if let Some(cancel) = cancel {
            cancel.register(Arc::downgrade(&waiter), Arc::downgrade(&self.inner), key);
        }
        Receipt(ReceiptRepr::Pending(PendingReceipt {
            waiter,
            inner: Arc::downgrade(&self.inner),
            key,
        }))
    }

    /// Requests the lock, suspending the caller's task until it is granted.
    /// Never completes with `Ok(false)` — only [`Self::try_enter_async_timeout`]
    /// requests can time out.
    pub fn enter_async(&self) -> Receipt {
        if let Some(r) = self.try_grant_uncontended() {
            return r;
        }
        if self.inner.queue_count.load(Ordering::Relaxed) <= 0
            && self
                .inner
                .spin_gate
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    if n < MAX_SPINNERS {
                        Some(n + 1)
                    } else {
                        None
                    }
                })
                .is_ok()
        {
            let _guard = SpinGuard(&self.inner.spin_gate);
            for _ in 0..SPIN_LIMIT {
                std::hint::spin_loop();
                if let Some(r) = self.try_grant_uncontended() {
                    return r;
                }
            }
        }
        self.enter_queue_or_grant(None, None)
    }

    /// Attempts to grant the lock immediately, without queueing. Resolves
    /// to `Ok(false)` (never queues) if the lock is currently held.
    pub fn try_enter_async(&self) -> Receipt {
        self.try_grant_uncontended()
            .unwrap_or_else(|| self.make_false_receipt())
    }

    /// Attempts to grant the lock immediately; failing that, queues the
    /// request with an optional `timeout` and a [`CancelToken`] the caller
    /// can fire to give up its place in line early.
    ///
    /// A zero `timeout` degenerates to [`Self::try_enter_async`]. An
    /// already-canceled `cancel` returns an already-canceled receipt
    /// without ever touching the queue.
    pub fn try_enter_async_timeout(&self, timeout: Option<Duration>, cancel: CancelToken) -> Receipt {
        if cancel.is_canceled() {
            return self.make_canceled_receipt();
        }
        if let Some(t) = timeout {
            if t.is_zero() {
                return self.try_enter_async();
            }
        }
        if let Some(r) = self.try_grant_uncontended() {
            return r;
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        self.enter_queue_or_grant(deadline, Some(cancel))
    }

    fn same_as_holder(&self, holder: &Option<ReceiptRepr>, receipt: &Receipt) -> bool {
        matches!(holder, Some(h) if ReceiptRepr::same(h, &receipt.0))
    }

    /// Returns whether the lock is currently held by anyone.
    pub fn is_held(&self) -> bool {
        self.inner.holder.lock().unwrap().is_some()
    }

    /// Returns whether `receipt` is the current holder.
    pub fn is_held_by(&self, receipt: &Receipt) -> bool {
        let holder = self.inner.holder.lock().unwrap();
        self.same_as_holder(&holder, receipt)
    }

    /// Releases the lock, or withdraws a still-queued request.
    ///
    /// Returns `true` if `receipt` was the current holder (the lock is now
    /// either handed to the next queued waiter or free); `false` if
    /// `receipt` was not the holder — either it was a still-pending queued
    /// request (which is withdrawn as a side effect) or it no longer refers
    /// to anything live.
    pub fn exit(&self, receipt: &Receipt) -> bool {
        let mut queue = self.inner.queue.lock().unwrap();
        let mut holder = self.inner.holder.lock().unwrap();
        if self.same_as_holder(&holder, receipt) {
            loop {
                let Some(head_key) = queue.head else {
                    *holder = None;
                    return true;
                };
                let Some(next_waiter) = self.inner.remove_from_queue(&mut queue, head_key) else {
                    continue;
                };
                if next_waiter.transition_from_pending(WaiterState::GrantedTrue) {
                    *holder = Some(ReceiptRepr::Pending(PendingReceipt {
                        waiter: Arc::clone(&next_waiter),
                        inner: Arc::downgrade(&self.inner),
                        key: head_key,
                    }));
                    drop(holder);
                    drop(queue);
                    next_waiter.wake();
                    return true;
                }
                next_waiter.dispose();
            }
        }
        drop(holder);
        if let ReceiptRepr::Pending(p) = &receipt.0 {
            if queue
                .slab
                .get(p.key)
                .map(|n| Arc::ptr_eq(&n.waiter, &p.waiter))
                .unwrap_or(false)
            {
                self.inner.remove_from_queue(&mut queue, p.key);
                p.waiter.dispose();
            }
        }
        false
    }
}

impl Drop for AsyncLock {
    fn drop(&mut self) {
        // Tear down every still-pending waiter so no task blocks forever on
        // a lock that no longer exists.
        let mut queue = self.inner.queue.lock().unwrap();
        let mut cursor = queue.head;
        while let Some(key) = cursor {
            let node = &queue.slab[key];
            cursor = node.next;
            node.waiter.dispose();
            node.waiter.wake();
        }
    }
}
