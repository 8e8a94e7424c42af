//! Keyed work queue with de-duplication and per-key exclusivity.
//!
//! A key is queued at most once. While a worker holds a key, re-adds are
//! parked in a dirty set and the key is queued again when the worker calls
//! [`WorkQueue::done`], so no key is ever processed by two workers at once.

use std::{
    collections::VecDeque,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;

const BASE_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

struct Inner<K> {
    order: VecDeque<K>,
    queued: FxHashSet<K>,
    in_flight: FxHashSet<K>,
    dirty: FxHashSet<K>,
    failures: FxHashMap<K, u32>,
    shutdown: bool,
}

pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                queued: FxHashSet::default(),
                in_flight: FxHashSet::default(),
                dirty: FxHashSet::default(),
                failures: FxHashMap::default(),
                shutdown: false,
            }),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&self, key: K) {
        let mut q = self.lock();
        if q.shutdown {
            return;
        }
        if q.in_flight.contains(&key) {
            q.dirty.insert(key);
            return;
        }
        if q.queued.insert(key.clone()) {
            q.order.push_back(key);
            drop(q);
            self.notify.notify_one();
        }
    }

    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let q = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.add(key);
        });
    }

    /// Re-add after a per-key exponential backoff that grows with every
    /// call until [`WorkQueue::forget`].
    pub fn add_rate_limited(self: &Arc<Self>, key: K) -> Duration {
        let delay = {
            let mut q = self.lock();
            let n = q.failures.entry(key.clone()).or_insert(0);
            let delay = BASE_BACKOFF.saturating_mul(1u32 << (*n).min(16)).min(MAX_BACKOFF);
            *n += 1;
            delay
        };
        self.add_after(key, delay);
        delay
    }

    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// Wait for the next key; `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            {
                let mut q = self.lock();
                if let Some(key) = q.order.pop_front() {
                    q.queued.remove(&key);
                    q.in_flight.insert(key.clone());
                    return Some(key);
                }
                if q.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release `key`; a key re-added while in flight is queued again.
    pub fn done(&self, key: &K) {
        let mut q = self.lock();
        q.in_flight.remove(key);
        if q.dirty.remove(key) && !q.shutdown && q.queued.insert(key.clone()) {
            q.order.push_back(key.clone());
            drop(q);
            self.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }
}
