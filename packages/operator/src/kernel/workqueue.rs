//! Rate-limited deduplicating work queue of job keys.
//!
//! Semantics:
//! - A key added while already queued is dropped (dedup).
//! - A key added while being processed is remembered and re-queued when the
//!   processor calls [`WorkQueue::done`] - so at most one reconcile of a key
//!   is ever in flight.
//! - [`WorkQueue::add_rate_limited`] delays the re-add by an exponential
//!   per-key backoff; [`WorkQueue::forget`] resets the key's failure count.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(16);

#[derive(Default)]
struct Inner {
    /// Keys in FIFO order.
    queue: VecDeque<String>,
    /// Keys that need processing: queued, or in flight with a pending re-add.
    dirty: HashSet<String>,
    /// Keys currently handed out to a worker fibre.
    processing: HashSet<String>,
    /// Consecutive failures per key, reset by `forget`.
    failures: HashMap<String, u32>,
    shut_down: bool,
}

pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        })
    }

    /// Enqueue a key for processing. No-op if the key is already queued.
    pub fn add(&self, key: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.shut_down || inner.dirty.contains(key) {
                return;
            }
            inner.dirty.insert(key.to_string());
            if inner.processing.contains(key) {
                // Re-queued by `done` once the in-flight pass finishes.
                return;
            }
            inner.queue.push_back(key.to_string());
        }
        self.notify.notify_waiters();
    }

    /// Enqueue a key after its per-key backoff delay, doubling the delay on
    /// each consecutive failure up to a cap.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shut_down {
                return;
            }
            let failures = inner.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            backoff_delay(*failures)
        };
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Wait for the next key. Returns `None` once the queue is shut down and
    /// drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.shut_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark an in-flight key as finished. If the key was re-added while in
    /// flight it goes back on the queue.
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut inner = self.inner.lock().unwrap();
            inner.processing.remove(key);
            if inner.dirty.contains(key) && !inner.shut_down {
                inner.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
    }

    /// Reset the key's failure count after a successful pass.
    pub fn forget(&self, key: &str) {
        self.inner.lock().unwrap().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys and wake all waiting fibres. Keys already queued
    /// are still handed out so the dispatcher can drain.
    pub fn shut_down(&self) {
        self.inner.lock().unwrap().shut_down = true;
        self.notify.notify_waiters();
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    let delay = BASE_DELAY.saturating_mul(1u32 << exp);
    delay.min(MAX_DELAY)
}
