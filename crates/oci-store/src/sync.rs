//! Concurrency primitives shared by the stores.
//!
//! Everything here is built on `tokio::sync` and is safe to use from inside
//! `select!`: a waiter that is dropped mid-wait leaves no residue.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex, OnceCell, OwnedMutexGuard};

/// Where a one-shot [`Latch`] ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatchState {
    /// The producer has not finished yet.
    Pending,
    /// The producer finished and its effects are visible.
    Committed,
    /// The producer gave up; the slot is free again.
    Aborted,
}

/// A single-producer, multi-consumer completion signal.
///
/// The producer's side effects must be complete before calling
/// [`Latch::commit`]; waiters woken by the commit are allowed to assume the
/// guarded state is visible.
#[derive(Debug)]
pub struct Latch {
    tx: watch::Sender<LatchState>,
}

impl Latch {
    /// Creates a pending latch.
    pub fn new() -> Latch {
        let (tx, _rx) = watch::channel(LatchState::Pending);
        Latch { tx }
    }

    /// Marks the latch committed and wakes all waiters.
    pub fn commit(&self) {
        self.tx.send_replace(LatchState::Committed);
    }

    /// Marks the latch aborted and wakes all waiters.
    pub fn abort(&self) {
        self.tx.send_replace(LatchState::Aborted);
    }

    /// The current state, without waiting.
    pub fn state(&self) -> LatchState {
        *self.tx.borrow()
    }

    /// Waits until the latch leaves [`LatchState::Pending`].
    ///
    /// A latch whose owner disappears counts as aborted.
    pub async fn wait(&self) -> LatchState {
        let mut rx = self.tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state != LatchState::Pending {
                return state;
            }
            if rx.changed().await.is_err() {
                return LatchState::Aborted;
            }
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Latch::new()
    }
}

/// Runs an initializer at most once *successfully*: concurrent callers share
/// one attempt, and a failed attempt leaves the slot open for the next
/// caller to retry.
#[derive(Debug, Default)]
pub struct OnceOrRetry {
    cell: OnceCell<()>,
}

impl OnceOrRetry {
    /// Creates an empty slot.
    pub fn new() -> OnceOrRetry {
        OnceOrRetry { cell: OnceCell::new() }
    }

    /// Runs `init` unless a previous call already succeeded.
    pub async fn call<F, Fut, E>(&self, init: F) -> Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.cell
            .get_or_try_init(|| init())
            .await
            .map(|_| ())
    }
}

struct LockEntry {
    mutex: Arc<AsyncMutex<()>>,
    refs: usize,
}

type LockMap<K> = Arc<Mutex<HashMap<K, LockEntry>>>;

/// A pool of reference-counted per-key mutexes.
///
/// A key's mutex exists only while at least one holder or waiter references
/// it; the last release evicts the entry, so the map stays bounded by the
/// number of keys currently contended.
pub struct KeyedLocks<K: Eq + Hash + Clone> {
    inner: LockMap<K>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    /// Creates an empty pool.
    pub fn new() -> KeyedLocks<K> {
        KeyedLocks {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquires the lock for `key`, waiting if another task holds it.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let mutex = {
            let mut map = self.inner.lock().expect("keyed lock map poisoned");
            let entry = map.entry(key.clone()).or_insert_with(|| LockEntry {
                mutex: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            entry.mutex.clone()
        };
        // The refcount protects the entry while we wait; if the wait is
        // cancelled the release guard below still runs.
        let release = RefRelease {
            map: self.inner.clone(),
            key,
        };
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            _release: release,
            _guard: guard,
        }
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        KeyedLocks::new()
    }
}

struct RefRelease<K: Eq + Hash + Clone> {
    map: LockMap<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for RefRelease<K> {
    fn drop(&mut self) {
        let mut map = self.map.lock().expect("keyed lock map poisoned");
        if let Some(entry) = map.get_mut(&self.key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                map.remove(&self.key);
            }
        }
    }
}

/// Holds a per-key lock; dropping it releases the lock and, when no one else
/// wants the key, evicts it from the pool.
///
/// Field order matters: the mutex is unlocked before the refcount drops, so
/// an entry is never evicted while its lock is still held.
pub struct KeyedGuard<K: Eq + Hash + Clone> {
    _guard: OwnedMutexGuard<()>,
    _release: RefRelease<K>,
}

/// Runs a fallible job for every item with at most `limit` jobs in flight.
///
/// The first error stops the run: items that have not started are skipped,
/// and in-flight jobs are cancelled at their next await point. The first
/// error is the one returned.
pub async fn limited_for_each<T, F, Fut, E>(limit: usize, items: Vec<T>, f: F) -> Result<(), E>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    stream::iter(items)
        .map(|item| f(item))
        .buffer_unordered(limit.max(1))
        .try_for_each(|()| futures::future::ready(Ok(())))
        .await
}

/// Like [`limited_for_each`] but collects results. Completion order is
/// unspecified.
pub async fn limited_map<T, F, Fut, R, E>(limit: usize, items: Vec<T>, f: F) -> Result<Vec<R>, E>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    stream::iter(items)
        .map(|item| f(item))
        .buffer_unordered(limit.max(1))
        .try_collect()
        .await
}

struct WharfInner<T, E> {
    piloting: bool,
    tickets: Vec<(T, oneshot::Sender<Result<(), Arc<E>>>)>,
}

/// Merges concurrent callers of one slow operation.
///
/// Every caller docks a ticket. The first caller becomes the pilot: it
/// repeatedly takes everything queued so far and runs `sail` over the batch
/// until the queue drains, delivering each batch's outcome to the callers in
/// it. Tickets queued while a batch is sailing ride the next batch.
///
/// If a pilot is cancelled mid-flight its passengers re-dock and elect a new
/// pilot, so tickets are never stranded (the operation must therefore be
/// idempotent).
pub struct Wharf<T, E> {
    inner: Mutex<WharfInner<T, E>>,
}

impl<T: Clone, E> Wharf<T, E> {
    /// Creates an empty wharf.
    pub fn new() -> Wharf<T, E> {
        Wharf {
            inner: Mutex::new(WharfInner {
                piloting: false,
                tickets: Vec::new(),
            }),
        }
    }

    /// Docks a ticket and waits for a batch containing it to complete.
    pub async fn dock<F, Fut>(&self, ticket: T, mut sail: F) -> Result<(), Arc<E>>
    where
        F: FnMut(Vec<T>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        loop {
            let (tx, rx) = oneshot::channel();
            let is_pilot = {
                let mut inner = self.inner.lock().expect("wharf poisoned");
                inner.tickets.push((ticket.clone(), tx));
                if inner.piloting {
                    false
                } else {
                    inner.piloting = true;
                    true
                }
            };

            if is_pilot {
                let mut abandon = PilotGuard { wharf: self, armed: true };
                loop {
                    let batch = {
                        let mut inner = self.inner.lock().expect("wharf poisoned");
                        if inner.tickets.is_empty() {
                            inner.piloting = false;
                            abandon.armed = false;
                            break;
                        }
                        std::mem::take(&mut inner.tickets)
                    };
                    let (tickets, senders): (Vec<T>, Vec<_>) = batch.into_iter().unzip();
                    let result = sail(tickets).await.map_err(Arc::new);
                    for sender in senders {
                        let _ = sender.send(result.clone());
                    }
                }
            }

            match rx.await {
                Ok(result) => return result,
                // The pilot vanished before our batch landed; run again.
                Err(_) => continue,
            }
        }
    }
}

impl<T: Clone, E> Default for Wharf<T, E> {
    fn default() -> Self {
        Wharf::new()
    }
}

struct PilotGuard<'a, T, E> {
    wharf: &'a Wharf<T, E>,
    armed: bool,
}

impl<T, E> Drop for PilotGuard<'_, T, E> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Cancelled mid-flight: free the pilot seat and kick every queued
        // waiter back to dock() so one of them takes over.
        let mut inner = self.wharf.inner.lock().expect("wharf poisoned");
        inner.piloting = false;
        inner.tickets.clear();
    }
}
