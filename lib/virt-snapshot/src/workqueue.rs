// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rate-limited, deduplicating work queues.
//!
//! Informer event handlers push object keys into a queue and controller
//! workers pull them back out. A key is queued at most once no matter how
//! many times it is added before a worker picks it up, and a key is never
//! handed to two workers at the same time: if it is added while a worker is
//! processing it, it is parked and re-queued when that worker calls
//! [`WorkQueue::done`].
//!
//! Keys that fail to process are re-added with a per-key exponential backoff
//! ([`WorkQueue::add_rate_limited`]) that is reset by [`WorkQueue::forget`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use slog::{debug, Logger};
use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct State {
    queue: VecDeque<String>,

    /// Keys that need processing, whether queued or parked behind an
    /// in-flight worker.
    dirty: BTreeSet<String>,

    /// Keys currently held by a worker.
    processing: BTreeSet<String>,

    /// Consecutive rate-limited requeues per key.
    failures: BTreeMap<String, u32>,

    shutting_down: bool,
}

pub struct WorkQueue {
    name: &'static str,
    state: Mutex<State>,
    notify: Notify,
    log: Logger,
}

impl WorkQueue {
    pub fn new(name: &'static str, log: &Logger) -> Arc<Self> {
        Arc::new(WorkQueue {
            name,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            log: log.new(slog::o!("queue" => name)),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Marks `key` as needing processing.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }

        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }

        state.queue.push_back(key);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Adds `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.lock().shutting_down {
            return;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Adds `key` after a delay that doubles with every consecutive call for
    /// the same key, until [`WorkQueue::forget`] is called for it.
    pub fn add_rate_limited(self: &Arc<Self>, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = backoff_delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        debug!(self.log, "requeueing with backoff";
            "key" => &key, "delay" => ?delay);
        self.add_after(key, delay);
    }

    /// Clears the backoff history of `key`.
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    /// Number of rate-limited requeues of `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for a key to process. Returns `None` once the queue is shut
    /// down and drained.
    ///
    /// Every key returned must be passed back to [`WorkQueue::done`].
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting the queue so an add that lands
            // between the check and the await is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Releases `key` after processing. If it was re-added meanwhile it goes
    /// back on the queue.
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Stops accepting new keys and wakes every waiting worker. Keys already
    /// queued are still handed out.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys waiting to be handed to a worker.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-key exponential delay matching client-go's default controller rate
/// limiter: 5ms doubled for every consecutive failure, capped at 1000s.
/// `forget` resets the count.
fn backoff_delay(failures: u32) -> Duration {
    let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
    BASE_DELAY.checked_mul(factor).map_or(MAX_DELAY, |d| d.min(MAX_DELAY))
}
