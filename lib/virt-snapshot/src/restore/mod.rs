// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VirtualMachineRestore controller.
//!
//! One queue of VirtualMachineRestore keys, reconciled by
//! [`RestoreController::update_vm_restore`]. Restores are requeued when
//! their target VM changes, and when a PVC they created changes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use slog::{info, Logger};
use tokio_util::sync::CancellationToken;

use crate::dynamic_informer::VolumeSnapshotProvider;
use crate::informer::{key, object_key, InformerEvent, RESTORE_BY_VM};
use crate::worker::{spawn_workers, Outcome, SyncFn};
use crate::workqueue::WorkQueue;
use crate::Context;

mod reconcile;

pub use reconcile::{restore_pvc, restore_pvc_name};

/// Names the restore that created a PVC.
pub const RESTORE_NAME_ANNOTATION: &str = "restore.kubevirt.io/name";
pub const RESTORE_SOURCE_NAME_LABEL: &str = "restore.kubevirt.io/source-vm-name";
pub const RESTORE_SOURCE_NAMESPACE_LABEL: &str =
    "restore.kubevirt.io/source-vm-namespace";

/// How long to wait for a target VM to stop. Nothing else wakes the restore
/// when its VMI goes away.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

pub struct RestoreController {
    ctx: Context,
    volume_snapshots: Arc<dyn VolumeSnapshotProvider>,
    retry_interval: Duration,
    queue: Arc<WorkQueue>,
    log: Logger,
}

impl RestoreController {
    /// Creates the controller and registers its event handlers. Must be
    /// called before the informers start delivering events.
    pub fn new(
        ctx: Context,
        volume_snapshots: Arc<dyn VolumeSnapshotProvider>,
        retry_interval: Duration,
        log: &Logger,
    ) -> Arc<Self> {
        let log = log.new(slog::o!("component" => "restore-controller"));
        let queue = WorkQueue::new("restore-controller-vmrestore", &log);
        let informers = &ctx.informers;

        let q = Arc::clone(&queue);
        informers.vm_restore.add_handler(move |event| match event {
            InformerEvent::Added(r) | InformerEvent::Updated { new: r, .. } => {
                q.add(object_key(r))
            }
            InformerEvent::Deleted(_) => {}
        });

        let q = Arc::clone(&queue);
        let restores = Arc::clone(&informers.vm_restore);
        informers.vm.add_handler(move |event| {
            let vm_key = object_key(event.object());
            for k in restores.index_keys(RESTORE_BY_VM, &vm_key) {
                q.add(k);
            }
        });

        let q = Arc::clone(&queue);
        informers.pvc.add_handler(move |event| {
            if let Some(k) = owning_restore_key(event.object()) {
                q.add(k);
            }
        });

        Arc::new(RestoreController {
            ctx,
            volume_snapshots,
            retry_interval,
            queue,
            log,
        })
    }

    /// Runs `threadiness` workers until `cancel` fires.
    pub async fn run(self: Arc<Self>, threadiness: usize, cancel: CancellationToken) {
        info!(self.log, "starting restore controller"; "threadiness" => threadiness);

        if !self.ctx.informers.wait_for_sync(&cancel).await {
            info!(self.log, "cancelled before informers synced");
            return;
        }

        let sync = self.sync_with(|ctrl, key| async move {
            ctrl.sync_vm_restore(&key).await
        });
        let workers =
            spawn_workers(threadiness, Arc::clone(&self.queue), &self.log, sync);

        cancel.cancelled().await;
        info!(self.log, "stopping restore controller");
        self.queue.shut_down();
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

    async fn sync_vm_restore(&self, key: &str) -> Outcome {
        match self.ctx.informers.vm_restore.get(key) {
            Some(restore) => self.update_vm_restore(restore).await.into(),
            None => Outcome::done(),
        }
    }
}

/// Key of the restore that created `pvc`, if any.
fn owning_restore_key(pvc: &PersistentVolumeClaim) -> Option<String> {
    let name = pvc
        .metadata
        .annotations
        .as_ref()?
        .get(RESTORE_NAME_ANNOTATION)?;
    Some(key(pvc.metadata.namespace.as_deref(), name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fixtures, FakeCluster};
    use std::collections::BTreeMap;

    fn controller(cluster: &FakeCluster) -> Arc<RestoreController> {
        RestoreController::new(
            cluster.context(),
            Arc::clone(&cluster.dynamic) as Arc<dyn VolumeSnapshotProvider>,
            DEFAULT_RETRY_INTERVAL,
            &cluster.log,
        )
    }

    #[test]
    fn restores_are_queued_on_add() {
        let cluster = FakeCluster::new();
        let ctrl = controller(&cluster);
        cluster.add_restore(fixtures::restore("ns", "restore", "vm", "snap"));
        assert_eq!(ctrl.queue.len(), 1);
    }

    #[test]
    fn vm_changes_requeue_restores_targeting_it() {
        let cluster = FakeCluster::new();
        cluster.add_restore(fixtures::restore("ns", "restore", "vm", "snap"));
        cluster.add_restore(fixtures::restore("ns", "other", "other-vm", "snap"));
        cluster.add_restore(fixtures::restore("elsewhere", "restore", "vm", "snap"));

        let ctrl = controller(&cluster);
        cluster.add_vm(fixtures::vm("ns", "vm"));
        assert_eq!(ctrl.queue.len(), 1);
    }

    #[test]
    fn restored_pvcs_requeue_their_restore() {
        let cluster = FakeCluster::new();
        let ctrl = controller(&cluster);

        cluster.add_pvc(fixtures::pvc("ns", "unrelated", None, "pv-0"));
        assert!(ctrl.queue.is_empty());

        let mut pvc = fixtures::pvc("ns", "restored", None, "");
        pvc.metadata.annotations = Some(BTreeMap::from([(
            RESTORE_NAME_ANNOTATION.to_string(),
            "restore".to_string(),
        )]));
        assert_eq!(owning_restore_key(&pvc).as_deref(), Some("ns/restore"));
        cluster.add_pvc(pvc);
        assert_eq!(ctrl.queue.len(), 1);
    }
}
