// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Feeds informers from API server watches.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::Metadata;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use serde::de::DeserializeOwned;
use slog::{debug, warn, Logger};
use snapshot_api_types::ObjectMeta;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use virt_snapshot::dynamic_informer::WatchStarter;
use virt_snapshot::informer::{Informer, Informers};

/// Bounds shared by every kind we watch.
pub trait Watched:
    kube::Resource<DynamicType = ()>
    + Metadata<Ty = ObjectMeta>
    + Clone
    + Debug
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Watched for K where
    K: kube::Resource<DynamicType = ()>
        + Metadata<Ty = ObjectMeta>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Applies one watch event to `informer`. Objects delivered during a
/// (re)list are buffered in `relist` and swapped in together once the list
/// completes, so objects deleted while the watch was down are dropped.
fn apply_event<K: Watched>(
    informer: &Informer<K>,
    relist: &mut Vec<K>,
    event: Event<K>,
) {
    match event {
        Event::Apply(obj) => informer.apply(obj),
        Event::Delete(obj) => informer.delete(&obj),
        Event::Init => relist.clear(),
        Event::InitApply(obj) => relist.push(obj),
        Event::InitDone => informer.replace(std::mem::take(relist)),
    }
}

/// Watches every object of kind `K` cluster-wide until `cancel` fires.
pub fn spawn_watch<K: Watched>(
    client: kube::Client,
    informer: Arc<Informer<K>>,
    cancel: CancellationToken,
    log: &Logger,
) -> JoinHandle<()> {
    let log = log.new(slog::o!("kind" => informer.kind()));
    tokio::spawn(async move {
        let api: Api<K> = Api::all(client);
        let mut events = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();
        let mut relist = Vec::new();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.next() => next,
            };
            match next {
                Some(Ok(event)) => apply_event(&informer, &mut relist, event),
                Some(Err(e)) => warn!(log, "watch failed"; "error" => %e),
                None => break,
            }
        }
        debug!(log, "watch stopped");
    })
}

/// Starts the watches behind every static informer.
pub fn spawn_watches(
    client: &kube::Client,
    informers: &Informers,
    cancel: &CancellationToken,
    log: &Logger,
) -> Vec<JoinHandle<()>> {
    let c = || client.clone();
    let t = || cancel.clone();
    vec![
        spawn_watch(c(), Arc::clone(&informers.vm), t(), log),
        spawn_watch(c(), Arc::clone(&informers.vmi), t(), log),
        spawn_watch(c(), Arc::clone(&informers.pod), t(), log),
        spawn_watch(c(), Arc::clone(&informers.pvc), t(), log),
        spawn_watch(c(), Arc::clone(&informers.storage_class), t(), log),
        spawn_watch(c(), Arc::clone(&informers.data_volume), t(), log),
        spawn_watch(c(), Arc::clone(&informers.crd), t(), log),
        spawn_watch(c(), Arc::clone(&informers.vm_snapshot), t(), log),
        spawn_watch(c(), Arc::clone(&informers.vm_snapshot_content), t(), log),
        spawn_watch(c(), Arc::clone(&informers.vm_restore), t(), log),
    ]
}

/// Redelivers every cached object each `period` until `cancel` fires.
pub fn spawn_resync(
    informers: Arc<Informers>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        // The first tick fires immediately.
        ticks.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => informers.resync_all(),
            }
        }
    })
}

/// [`WatchStarter`] for the informers whose CRDs come and go.
pub struct KubeWatch<K> {
    client: kube::Client,
    log: Logger,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeWatch<K> {
    pub fn new(client: kube::Client, log: &Logger) -> Self {
        KubeWatch { client, log: log.clone(), _kind: PhantomData }
    }
}

impl<K: Watched> WatchStarter<K> for KubeWatch<K> {
    fn start(&self, informer: Arc<Informer<K>>, cancel: CancellationToken) {
        spawn_watch(self.client.clone(), informer, cancel, &self.log);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapshot_api_types::csi::VolumeSnapshot;

    fn vs(name: &str) -> VolumeSnapshot {
        VolumeSnapshot {
            metadata: ObjectMeta {
                namespace: Some("ns".into()),
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn relists_replace_the_cache() {
        let informer = Informer::<VolumeSnapshot>::new("VolumeSnapshot");
        let mut relist = Vec::new();

        apply_event(&informer, &mut relist, Event::Apply(vs("stale")));
        assert!(!informer.has_synced());

        apply_event(&informer, &mut relist, Event::Init);
        apply_event(&informer, &mut relist, Event::InitApply(vs("a")));
        apply_event(&informer, &mut relist, Event::InitApply(vs("b")));
        // Nothing is visible until the list completes.
        assert!(informer.contains("ns/stale"));
        assert!(!informer.contains("ns/a"));

        apply_event(&informer, &mut relist, Event::InitDone);
        assert!(informer.has_synced());
        assert_eq!(informer.list_keys(), vec!["ns/a", "ns/b"]);
        assert!(relist.is_empty());

        apply_event(&informer, &mut relist, Event::Delete(vs("a")));
        assert_eq!(informer.list_keys(), vec!["ns/b"]);
    }
}
