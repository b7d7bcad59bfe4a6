// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Informers for kinds whose CRDs may come and go.
//!
//! VolumeSnapshot and VolumeSnapshotClass are installed by the CSI external
//! snapshotter, not by KubeVirt, so their informers are only started once
//! their CRD shows up serving a version we understand, and are torn down
//! again when it goes away. Until then lookups report the kind as
//! unavailable and callers carry on as if no such objects exist.

use std::sync::{Arc, Mutex, RwLock};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::{Metadata, Resource};
use slog::{info, Logger};
use snapshot_api_types::csi::{VolumeSnapshot, VolumeSnapshotClass};
use snapshot_api_types::ObjectMeta;
use tokio_util::sync::CancellationToken;

use crate::informer::{Handler, Informer, InformerEvent};
use crate::Error;

pub const VOLUME_SNAPSHOT_CRD: &str = "volumesnapshots.snapshot.storage.k8s.io";
pub const VOLUME_SNAPSHOT_CLASS_CRD: &str =
    "volumesnapshotclasses.snapshot.storage.k8s.io";

/// CRD versions the dynamic informers know how to decode.
pub const SUPPORTED_CRD_VERSIONS: &[&str] = &["v1"];

/// True if `crd` serves one of [`SUPPORTED_CRD_VERSIONS`].
pub fn serves_supported_version(crd: &CustomResourceDefinition) -> bool {
    crd.spec.versions.iter().any(|v| {
        v.served && SUPPORTED_CRD_VERSIONS.contains(&v.name.as_str())
    })
}

/// Starts feeding an informer from the cluster.
pub trait WatchStarter<K>: Send + Sync {
    /// Begins a watch that keeps `informer` current (calling
    /// [`Informer::replace`] once the initial list completes) until `cancel`
    /// fires. Must not block.
    fn start(&self, informer: Arc<Informer<K>>, cancel: CancellationToken);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Absent,
    Starting,
    Running,
    Stopping,
}

/// Result of a non-blocking informer lookup.
pub enum Lookup<K> {
    Available(Arc<Informer<K>>),
    Unavailable,
}

struct Published<K> {
    state: SlotState,
    informer: Option<Arc<Informer<K>>>,
    cancel: Option<CancellationToken>,
}

/// One optional kind.
pub struct DynamicInformer<K> {
    crd: &'static str,

    /// Serializes `ensure` and `stop`. Held across the initial sync, which
    /// only blocks the task doing the starting.
    lifecycle: tokio::sync::Mutex<()>,

    published: RwLock<Published<K>>,
    handlers: Mutex<Vec<Handler<K>>>,
    starter: Arc<dyn WatchStarter<K>>,
    log: Logger,
}

impl<K> DynamicInformer<K>
where
    K: Resource + Metadata<Ty = ObjectMeta> + Clone + Send + Sync + 'static,
{
    pub fn new(
        crd: &'static str,
        starter: Arc<dyn WatchStarter<K>>,
        log: &Logger,
    ) -> Self {
        DynamicInformer {
            crd,
            lifecycle: tokio::sync::Mutex::new(()),
            published: RwLock::new(Published {
                state: SlotState::Absent,
                informer: None,
                cancel: None,
            }),
            handlers: Mutex::new(Vec::new()),
            starter,
            log: log.new(slog::o!("crd" => crd)),
        }
    }

    pub fn crd(&self) -> &'static str {
        self.crd
    }

    /// Registers a handler to attach to every informer this slot starts.
    pub fn add_handler(
        &self,
        handler: impl Fn(InformerEvent<'_, K>) + Send + Sync + 'static,
    ) {
        self.handlers.lock().unwrap().push(Arc::new(handler));
    }

    pub fn state(&self) -> SlotState {
        self.published.read().unwrap().state
    }

    pub fn try_get(&self) -> Lookup<K> {
        let published = self.published.read().unwrap();
        match (&published.state, &published.informer) {
            (SlotState::Running, Some(informer)) => {
                Lookup::Available(Arc::clone(informer))
            }
            _ => Lookup::Unavailable,
        }
    }

    fn publish(
        &self,
        state: SlotState,
        informer: Option<Arc<Informer<K>>>,
        cancel: Option<CancellationToken>,
    ) {
        *self.published.write().unwrap() = Published { state, informer, cancel };
    }

    /// Starts the informer if it is not already running and waits for its
    /// initial sync. The watch is stopped when `parent` is cancelled.
    pub async fn ensure(&self, parent: &CancellationToken) {
        let _guard = self.lifecycle.lock().await;
        if self.state() == SlotState::Running {
            return;
        }

        self.publish(SlotState::Starting, None, None);

        let informer = Arc::new(Informer::new(K::KIND));
        for handler in self.handlers.lock().unwrap().iter() {
            informer.add_shared_handler(Arc::clone(handler));
        }

        let cancel = parent.child_token();
        self.starter.start(Arc::clone(&informer), cancel.clone());

        if !informer.wait_for_sync(&cancel).await {
            cancel.cancel();
            self.publish(SlotState::Absent, None, None);
            info!(self.log, "informer start cancelled before sync");
            return;
        }

        self.publish(SlotState::Running, Some(informer), Some(cancel));
        info!(self.log, "successfully created informer");
    }

    /// Stops the informer. A no-op if it is not running.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        let cancel = {
            let mut published = self.published.write().unwrap();
            if published.state == SlotState::Absent {
                return;
            }
            published.state = SlotState::Stopping;
            published.informer = None;
            published.cancel.take()
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        self.publish(SlotState::Absent, None, None);
        info!(self.log, "successfully deleted informer");
    }
}

/// Looks VolumeSnapshots up by namespace and name.
pub trait VolumeSnapshotProvider: Send + Sync {
    /// Returns `None` if the VolumeSnapshot does not exist or the
    /// VolumeSnapshot CRD is not installed.
    fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<VolumeSnapshot>;
}

/// The optional kinds used by the snapshot and restore controllers.
pub struct DynamicInformers {
    pub volume_snapshot: DynamicInformer<VolumeSnapshot>,
    pub volume_snapshot_class: DynamicInformer<VolumeSnapshotClass>,
}

impl DynamicInformers {
    pub fn new(
        volume_snapshots: Arc<dyn WatchStarter<VolumeSnapshot>>,
        volume_snapshot_classes: Arc<dyn WatchStarter<VolumeSnapshotClass>>,
        log: &Logger,
    ) -> Self {
        DynamicInformers {
            volume_snapshot: DynamicInformer::new(
                VOLUME_SNAPSHOT_CRD,
                volume_snapshots,
                log,
            ),
            volume_snapshot_class: DynamicInformer::new(
                VOLUME_SNAPSHOT_CLASS_CRD,
                volume_snapshot_classes,
                log,
            ),
        }
    }

    pub fn is_managed(crd: &str) -> bool {
        crd == VOLUME_SNAPSHOT_CRD || crd == VOLUME_SNAPSHOT_CLASS_CRD
    }

    pub async fn ensure(
        &self,
        crd: &str,
        parent: &CancellationToken,
    ) -> Result<(), Error> {
        match crd {
            VOLUME_SNAPSHOT_CRD => self.volume_snapshot.ensure(parent).await,
            VOLUME_SNAPSHOT_CLASS_CRD => {
                self.volume_snapshot_class.ensure(parent).await
            }
            _ => return Err(Error::UnexpectedCrd(crd.to_string())),
        }
        Ok(())
    }

    pub async fn stop(&self, crd: &str) -> Result<(), Error> {
        match crd {
            VOLUME_SNAPSHOT_CRD => self.volume_snapshot.stop().await,
            VOLUME_SNAPSHOT_CLASS_CRD => self.volume_snapshot_class.stop().await,
            _ => return Err(Error::UnexpectedCrd(crd.to_string())),
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        self.volume_snapshot.stop().await;
        self.volume_snapshot_class.stop().await;
    }

    /// Every known VolumeSnapshotClass. Empty while the CRD is absent.
    pub fn volume_snapshot_classes(&self) -> Vec<VolumeSnapshotClass> {
        match self.volume_snapshot_class.try_get() {
            Lookup::Available(informer) => informer.list(),
            Lookup::Unavailable => Vec::new(),
        }
    }
}

impl VolumeSnapshotProvider for DynamicInformers {
    fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<VolumeSnapshot> {
        match self.volume_snapshot.try_get() {
            Lookup::Available(informer) => {
                informer.get_namespaced(namespace, name)
            }
            Lookup::Unavailable => None,
        }
    }
}
