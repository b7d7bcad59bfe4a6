// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queue workers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use slog::{debug, error, Logger};
use tokio::task::JoinHandle;

use crate::workqueue::WorkQueue;
use crate::Error;

/// What a reconcile pass wants done with its key.
#[derive(Debug)]
pub struct Outcome {
    /// Look at the key again after this long. Zero means only when
    /// something changes.
    pub requeue_after: Duration,
    pub result: Result<(), Error>,
}

impl Outcome {
    pub fn done() -> Self {
        Outcome { requeue_after: Duration::ZERO, result: Ok(()) }
    }

    pub fn after(delay: Duration) -> Self {
        Outcome { requeue_after: delay, result: Ok(()) }
    }

    pub fn failed(e: Error) -> Self {
        Outcome { requeue_after: Duration::ZERO, result: Err(e) }
    }
}

impl From<Result<(), Error>> for Outcome {
    fn from(result: Result<(), Error>) -> Self {
        Outcome { requeue_after: Duration::ZERO, result }
    }
}

impl From<Result<Duration, Error>> for Outcome {
    fn from(result: Result<Duration, Error>) -> Self {
        match result {
            Ok(delay) => Outcome::after(delay),
            Err(e) => Outcome::failed(e),
        }
    }
}

pub type SyncFn = Arc<dyn Fn(String) -> BoxFuture<'static, Outcome> + Send + Sync>;

/// Takes one key off `queue` and hands it to `sync`. Returns false once the
/// queue has shut down.
///
/// A requested delay wins over an error: the key comes back after the delay
/// either way, without counting against its backoff. Otherwise a failure
/// requeues with backoff and a success resets it.
pub async fn process_work_item<F, Fut>(
    queue: &Arc<WorkQueue>,
    log: &Logger,
    sync: F,
) -> bool
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Outcome>,
{
    let Some(key) = queue.get().await else {
        return false;
    };

    let outcome = sync(key.clone()).await;
    if let Err(e) = &outcome.result {
        error!(log, "reconcile failed"; "key" => &key, "error" => %e);
    }

    if !outcome.requeue_after.is_zero() {
        debug!(log, "requeueing"; "key" => &key,
            "after_ms" => outcome.requeue_after.as_millis() as u64);
        queue.add_after(key.clone(), outcome.requeue_after);
    } else if outcome.result.is_err() {
        queue.add_rate_limited(key.clone());
    } else {
        queue.forget(&key);
    }

    queue.done(&key);
    true
}

/// Spawns `count` tasks draining `queue` until it shuts down.
pub fn spawn_workers(
    count: usize,
    queue: Arc<WorkQueue>,
    log: &Logger,
    sync: SyncFn,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| {
            let queue = Arc::clone(&queue);
            let sync = Arc::clone(&sync);
            let log = log.new(slog::o!("queue" => queue.name(), "worker" => id));
            tokio::spawn(async move {
                while process_work_item(&queue, &log, |key| sync(key)).await {}
                debug!(log, "worker exiting");
            })
        })
        .collect()
}
