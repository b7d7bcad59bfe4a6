// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VirtualMachineSnapshot controller.
//!
//! Five queues feed it:
//!
//! * `vmsnapshot`: VirtualMachineSnapshot keys, reconciled by
//!   [`SnapshotController::update_vm_snapshot`].
//! * `vmsnapshotcontent`: VirtualMachineSnapshotContent keys, reconciled by
//!   [`SnapshotController::update_vm_snapshot_content`].
//! * `crd`: names of the CSI snapshotter's CRDs, which start and stop the
//!   VolumeSnapshot and VolumeSnapshotClass informers.
//! * `vmsnashotstatus`: VM keys whose `volumeSnapshotStatuses` need
//!   recomputing.
//! * `vm`: VM keys whose dependants need requeueing, fed by
//!   VolumeSnapshotClass and DataVolume changes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use slog::{debug, info, Logger};
use snapshot_api_types::cdi::DataVolume;
use snapshot_api_types::snapshot::{
    VirtualMachineSnapshot, VirtualMachineSnapshotContent,
};
use snapshot_api_types::virt::VirtualMachine;
use tokio_util::sync::CancellationToken;

use crate::dynamic_informer::{serves_supported_version, DynamicInformers};
use crate::informer::{
    key, object_key, split_key, Informer, InformerEvent,
    CONTENT_BY_VOLUME_SNAPSHOT, VM_SNAPSHOT_BY_VM,
};
use crate::worker::{spawn_workers, Outcome, SyncFn};
use crate::workqueue::WorkQueue;
use crate::{Context, Error};

mod content;
mod reconcile;
mod volumes;

pub use content::resolve_volume_snapshot_class;

pub const VM_SNAPSHOT_FINALIZER: &str = "snapshot.kubevirt.io/vmsnapshot-protection";
pub const VM_SNAPSHOT_CONTENT_FINALIZER: &str =
    "snapshot.kubevirt.io/vmsnapshotcontent-protection";

/// How long to wait before looking at a snapshot whose source could not be
/// locked yet.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct Queues {
    snapshot: Arc<WorkQueue>,
    content: Arc<WorkQueue>,
    crd: Arc<WorkQueue>,
    vm_status: Arc<WorkQueue>,
    vm: Arc<WorkQueue>,
}

impl Queues {
    fn new(log: &Logger) -> Self {
        Queues {
            snapshot: WorkQueue::new("snapshot-controller-vmsnapshot", log),
            content: WorkQueue::new("snapshot-controller-vmsnapshotcontent", log),
            crd: WorkQueue::new("snapshot-controller-crd", log),
            vm_status: WorkQueue::new("snapshot-controller-vmsnashotstatus", log),
            vm: WorkQueue::new("snapshot-controller-vm", log),
        }
    }

    fn shut_down(&self) {
        self.snapshot.shut_down();
        self.content.shut_down();
        self.crd.shut_down();
        self.vm_status.shut_down();
        self.vm.shut_down();
    }

    fn enqueue_content(&self, content: &VirtualMachineSnapshotContent) {
        if let Some(name) = &content.spec.virtual_machine_snapshot_name {
            self.snapshot.add(key(content.metadata.namespace.as_deref(), name));
        }
        self.content.add(object_key(content));
    }

    /// Requeues every snapshot of `vm`, and the VM's own volume snapshot
    /// statuses.
    fn enqueue_vm(
        &self,
        vm: &VirtualMachine,
        snapshots: &Informer<VirtualMachineSnapshot>,
    ) {
        let vm_key = object_key(vm);
        for k in snapshots.index_keys(VM_SNAPSHOT_BY_VM, &vm_key) {
            self.snapshot.add(k);
        }
        self.vm_status.add(vm_key);
    }

    fn enqueue_crd(&self, crd: &CustomResourceDefinition) {
        let name = crd.metadata.name.as_deref().unwrap_or_default();
        if DynamicInformers::is_managed(name) && serves_supported_version(crd) {
            self.crd.add(name);
        }
    }

    fn enqueue_data_volume_owner(&self, dv: &DataVolume) {
        let owners = dv.metadata.owner_references.iter().flatten();
        for owner in owners.filter(|o| o.kind == "VirtualMachine") {
            self.vm.add(key(dv.metadata.namespace.as_deref(), &owner.name));
        }
    }
}

pub struct SnapshotController {
    ctx: Context,
    dynamic: Arc<DynamicInformers>,
    retry_interval: Duration,
    queues: Queues,
    log: Logger,
}

impl SnapshotController {
    /// Creates the controller and registers its event handlers. Must be
    /// called before the informers start delivering events.
    pub fn new(
        ctx: Context,
        dynamic: Arc<DynamicInformers>,
        retry_interval: Duration,
        log: &Logger,
    ) -> Arc<Self> {
        let log = log.new(slog::o!("component" => "snapshot-controller"));
        let queues = Queues::new(&log);
        let informers = &ctx.informers;

        let q = queues.clone();
        informers.vm_snapshot.add_handler(move |event| match event {
            InformerEvent::Added(s) | InformerEvent::Updated { new: s, .. } => {
                q.snapshot.add(object_key(s))
            }
            InformerEvent::Deleted(_) => {}
        });

        let q = queues.clone();
        informers.vm_snapshot_content.add_handler(move |event| match event {
            InformerEvent::Added(c) | InformerEvent::Updated { new: c, .. } => {
                q.enqueue_content(c)
            }
            InformerEvent::Deleted(_) => {}
        });

        let q = queues.clone();
        let snapshots = Arc::clone(&informers.vm_snapshot);
        informers.vm.add_handler(move |event| match event {
            InformerEvent::Added(vm) | InformerEvent::Updated { new: vm, .. } => {
                q.enqueue_vm(vm, &snapshots)
            }
            InformerEvent::Deleted(_) => {}
        });

        let q = queues.clone();
        informers.crd.add_handler(move |event| q.enqueue_crd(event.object()));

        let q = queues.clone();
        informers
            .data_volume
            .add_handler(move |event| q.enqueue_data_volume_owner(event.object()));

        let q = queues.clone();
        let contents = Arc::clone(&informers.vm_snapshot_content);
        dynamic.volume_snapshot.add_handler(move |event| {
            let vs_key = object_key(event.object());
            for k in contents.index_keys(CONTENT_BY_VOLUME_SNAPSHOT, &vs_key) {
                q.content.add(k);
            }
        });

        let q = queues.clone();
        let vms = Arc::clone(&informers.vm);
        dynamic.volume_snapshot_class.add_handler(move |_| {
            for k in vms.list_keys() {
                q.vm.add(k);
            }
        });

        Arc::new(SnapshotController { ctx, dynamic, retry_interval, queues, log })
    }

    /// Runs `threadiness` workers per queue until `cancel` fires.
    pub async fn run(self: Arc<Self>, threadiness: usize, cancel: CancellationToken) {
        info!(self.log, "starting snapshot controller"; "threadiness" => threadiness);

        if !self.ctx.informers.wait_for_sync(&cancel).await {
            info!(self.log, "cancelled before informers synced");
            return;
        }

        let crd_cancel = cancel.clone();
        let queues = [
            (
                &self.queues.snapshot,
                self.sync_with(|ctrl, key| async move {
                    ctrl.sync_vm_snapshot(&key).await
                }),
            ),
            (
                &self.queues.content,
                self.sync_with(|ctrl, key| async move {
                    ctrl.sync_vm_snapshot_content(&key).await
                }),
            ),
            (
                &self.queues.crd,
                self.sync_with(move |ctrl, key| {
                    let cancel = crd_cancel.clone();
                    async move { ctrl.sync_crd(&key, &cancel).await }
                }),
            ),
            (
                &self.queues.vm_status,
                self.sync_with(|ctrl, key| async move {
                    ctrl.sync_volume_snapshot_statuses(&key).await
                }),
            ),
            (
                &self.queues.vm,
                self.sync_with(|ctrl, key| async move { ctrl.sync_vm(&key) }),
            ),
        ];

        let mut workers = Vec::new();
        for (queue, sync) in queues {
            workers.extend(spawn_workers(
                threadiness,
                Arc::clone(queue),
                &self.log,
                sync,
            ));
        }

        cancel.cancelled().await;
        info!(self.log, "stopping snapshot controller");
        self.queues.shut_down();
        self.dynamic.stop_all().await;
        futures::future::join_all(workers).await;
    }

    fn sync_with<F, Fut>(self: &Arc<Self>, f: F) -> SyncFn
    where
        F: Fn(Arc<Self>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let ctrl = Arc::clone(self);
        Arc::new(move |key| Box::pin(f(Arc::clone(&ctrl), key)))
    }

    async fn sync_vm_snapshot(&self, key: &str) -> Outcome {
        match self.ctx.informers.vm_snapshot.get(key) {
            Some(snapshot) => self.update_vm_snapshot(snapshot).await.into(),
            None => Outcome::done(),
        }
    }

    async fn sync_vm_snapshot_content(&self, key: &str) -> Outcome {
        match self.ctx.informers.vm_snapshot_content.get(key) {
            Some(content) => self.update_vm_snapshot_content(content).await.into(),
            None => Outcome::done(),
        }
    }

    async fn sync_crd(&self, key: &str, parent: &CancellationToken) -> Outcome {
        let crd = self.ctx.informers.crd.get(key);
        let result = match crd {
            Some(crd) if crd.metadata.deletion_timestamp.is_none() => {
                debug!(self.log, "ensuring dynamic informer"; "crd" => key);
                self.dynamic.ensure(key, parent).await
            }
            _ => {
                let (_, name) = split_key(key);
                debug!(self.log, "deleting dynamic informer"; "crd" => name);
                self.dynamic.stop(name).await
            }
        };
        result.into()
    }

    async fn sync_volume_snapshot_statuses(&self, key: &str) -> Outcome {
        match self.ctx.informers.vm.get(key) {
            Some(vm) => self.update_volume_snapshot_statuses(&vm).await.into(),
            None => Outcome::done(),
        }
    }

    fn sync_vm(&self, key: &str) -> Outcome {
        if let Some(vm) = self.ctx.informers.vm.get(key) {
            self.queues.enqueue_vm(&vm, &self.ctx.informers.vm_snapshot);
        }
        Outcome::done()
    }

    /// The content a snapshot refers to, or will once it is created.
    fn get_content(
        &self,
        snapshot: &VirtualMachineSnapshot,
    ) -> Option<VirtualMachineSnapshotContent> {
        self.ctx.informers.vm_snapshot_content.get_namespaced(
            snapshot.metadata.namespace.as_deref().unwrap_or_default(),
            &content_name(snapshot),
        )
    }

    fn get_vm_snapshot(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<Option<VirtualMachineSnapshot>, Error> {
        let name = content
            .spec
            .virtual_machine_snapshot_name
            .as_deref()
            .ok_or(Error::NoSnapshotName)?;
        Ok(self.ctx.informers.vm_snapshot.get_namespaced(
            content.metadata.namespace.as_deref().unwrap_or_default(),
            name,
        ))
    }
}

/// Name of the content object for `snapshot`.
pub fn content_name(snapshot: &VirtualMachineSnapshot) -> String {
    snapshot
        .status
        .as_ref()
        .and_then(|s| s.virtual_machine_snapshot_content_name.clone())
        .unwrap_or_else(|| {
            format!(
                "vmsnapshot-content-{}",
                snapshot.metadata.uid.as_deref().unwrap_or_default()
            )
        })
}

/// Name of the VolumeSnapshot taken of `volume` for `snapshot`.
pub fn volume_snapshot_name(snapshot: &VirtualMachineSnapshot, volume: &str) -> String {
    format!(
        "vmsnapshot-{}-volume-{volume}",
        snapshot.metadata.uid.as_deref().unwrap_or_default()
    )
}
