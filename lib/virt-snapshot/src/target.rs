// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Things a snapshot can be restored into.
//!
//! A restore target may not exist yet, in which case the restore creates it
//! from the VM captured in the snapshot. An existing target is locked for
//! the duration of the restore through `status.restoreInProgress`, and its
//! spec is replaced in two steps: the restore first records which
//! DataVolume will own each restored PVC, and only on a later pass rewrites
//! the VM itself.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::Resource;
use slog::{debug, info, Logger};
use snapshot_api_types::cdi::POPULATED_FOR_ANNOTATION;
use snapshot_api_types::snapshot::{
    VirtualMachineRestore, VirtualMachineSnapshotContent,
};
use snapshot_api_types::virt::{
    RunStrategy, VirtualMachine, VirtualMachineStatus, Volume,
};
use snapshot_api_types::ObjectMeta;

use crate::informer::{key, object_key};
use crate::{Context, Error};

/// Records which restore last rewrote a VM, as `<restore name>-<restore uid>`.
pub const LAST_RESTORE_ANNOTATION: &str = "restore.kubevirt.io/lastRestoreUID";

pub enum RestoreTarget {
    VirtualMachine(VmRestoreTarget),
}

pub struct VmRestoreTarget {
    vm: Option<VirtualMachine>,
    namespace: String,
    name: String,
}

impl RestoreTarget {
    /// Resolves the target named by `restore`. A VM that does not exist is
    /// still a valid target.
    pub fn resolve(
        ctx: &Context,
        restore: &VirtualMachineRestore,
    ) -> Result<RestoreTarget, Error> {
        let target = &restore.spec.target;
        match target.kind.as_str() {
            "VirtualMachine" => {
                let namespace = restore
                    .metadata
                    .namespace
                    .clone()
                    .unwrap_or_default();
                let vm = ctx.informers.vm.get_namespaced(&namespace, &target.name);
                Ok(RestoreTarget::VirtualMachine(VmRestoreTarget {
                    vm,
                    namespace,
                    name: target.name.clone(),
                }))
            }
            kind => Err(Error::UnknownTarget(format!("{kind}/{}", target.name))),
        }
    }

    pub fn exists(&self) -> bool {
        match self {
            RestoreTarget::VirtualMachine(t) => t.vm.is_some(),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        match self {
            RestoreTarget::VirtualMachine(t) => {
                t.vm.as_ref().and_then(|vm| vm.metadata.uid.as_deref())
            }
        }
    }

    /// Whether `restore` has already rewritten this target.
    pub fn restored_by(&self, restore: &VirtualMachineRestore) -> bool {
        match self {
            RestoreTarget::VirtualMachine(t) => t.restored_by(restore),
        }
    }

    /// Whether the target is quiet enough to have its spec replaced. A
    /// target that is neither halted nor about to be is an error, not a
    /// wait.
    pub fn ready(&self, ctx: &Context) -> Result<bool, Error> {
        match self {
            RestoreTarget::VirtualMachine(t) => t.ready(ctx),
        }
    }

    /// Makes the target the controlling owner of `meta`. Does nothing when
    /// the target does not exist yet.
    pub fn own(&self, meta: &mut ObjectMeta) {
        match self {
            RestoreTarget::VirtualMachine(t) => t.own(meta),
        }
    }

    /// Claims the target for `restore`. Fails if another restore holds it.
    pub async fn update_restore_in_progress(
        &mut self,
        ctx: &Context,
        restore: &VirtualMachineRestore,
        log: &Logger,
    ) -> Result<(), Error> {
        match self {
            RestoreTarget::VirtualMachine(t) => {
                t.update_restore_in_progress(ctx, restore, log).await
            }
        }
    }

    /// Releases the claim `restore` holds on the target. Returns whether
    /// anything was written.
    pub async fn update_done_restore(
        &self,
        ctx: &Context,
        restore: &VirtualMachineRestore,
        log: &Logger,
    ) -> Result<bool, Error> {
        match self {
            RestoreTarget::VirtualMachine(t) => {
                t.update_done_restore(ctx, restore, log).await
            }
        }
    }

    /// Moves the target one step closer to the snapshot's contents. Returns
    /// whether it wrote anything; `restore` is updated in place with any
    /// status the step produced.
    pub async fn reconcile(
        &mut self,
        ctx: &Context,
        restore: &mut VirtualMachineRestore,
        content: &VirtualMachineSnapshotContent,
        log: &Logger,
    ) -> Result<bool, Error> {
        match self {
            RestoreTarget::VirtualMachine(t) => {
                t.reconcile(ctx, restore, content, log).await
            }
        }
    }

    /// Deletes the DataVolumes the restore made obsolete.
    pub async fn cleanup(
        &self,
        ctx: &Context,
        restore: &VirtualMachineRestore,
        log: &Logger,
    ) -> Result<(), Error> {
        match self {
            RestoreTarget::VirtualMachine(t) => t.cleanup(ctx, restore, log).await,
        }
    }
}

impl VmRestoreTarget {
    fn restored_by(&self, restore: &VirtualMachineRestore) -> bool {
        self.vm.as_ref().is_some_and(|vm| {
            vm.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(LAST_RESTORE_ANNOTATION))
                .is_some_and(|v| *v == last_restore_value(restore))
        })
    }

    fn ready(&self, ctx: &Context) -> Result<bool, Error> {
        let Some(vm) = &self.vm else {
            return Ok(true);
        };

        let rs = vm.run_strategy()?;
        if rs != RunStrategy::Halted {
            return Err(Error::InvalidRunStrategy(rs.to_string()));
        }

        Ok(!ctx.informers.vmi.contains(&object_key(vm)))
    }

    fn own(&self, meta: &mut ObjectMeta) {
        let Some(vm) = &self.vm else {
            return;
        };
        meta.owner_references = Some(vec![OwnerReference {
            api_version: VirtualMachine::API_VERSION.to_string(),
            kind: VirtualMachine::KIND.to_string(),
            name: vm.metadata.name.clone().unwrap_or_default(),
            uid: vm.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]);
    }

    async fn update_restore_in_progress(
        &mut self,
        ctx: &Context,
        restore: &VirtualMachineRestore,
        log: &Logger,
    ) -> Result<(), Error> {
        // A VM this restore created, or already rewrote, needs no claim.
        if self.restored_by(restore) {
            return Ok(());
        }
        let Some(vm) = &self.vm else {
            return Ok(());
        };

        let name = restore.metadata.name.as_deref().unwrap_or_default();
        match vm.status.restore_in_progress.as_deref() {
            Some(holder) if holder != name => {
                Err(Error::RestoreInProgress(holder.to_string()))
            }
            Some(_) => Ok(()),
            None => {
                info!(log, "claiming restore lock on target vm");
                let mut vm = vm.clone();
                vm.status.restore_in_progress = Some(name.to_string());
                self.vm = Some(ctx.client.update_vm_status(&vm).await?);
                Ok(())
            }
        }
    }

    async fn update_done_restore(
        &self,
        ctx: &Context,
        restore: &VirtualMachineRestore,
        log: &Logger,
    ) -> Result<bool, Error> {
        let Some(vm) = &self.vm else {
            return Ok(false);
        };
        if vm.status.restore_in_progress.as_deref() != restore.metadata.name.as_deref()
        {
            return Ok(false);
        }

        info!(log, "releasing restore lock on target vm");
        let mut vm = vm.clone();
        vm.status.restore_in_progress = None;
        vm.status.memory_dump_request = None;
        ctx.client.update_vm_status(&vm).await?;
        Ok(true)
    }

    async fn reconcile(
        &mut self,
        ctx: &Context,
        restore: &mut VirtualMachineRestore,
        content: &VirtualMachineSnapshotContent,
        log: &Logger,
    ) -> Result<bool, Error> {
        if self.restored_by(restore) {
            return Ok(false);
        }

        let snapshot_vm = content
            .spec
            .source
            .virtual_machine
            .as_ref()
            .ok_or(Error::UnexpectedSnapshotSource)?;

        let mut templates = snapshot_vm.spec.data_volume_templates.clone();
        let mut volumes = Vec::new();
        let mut updated_status = false;
        let status = restore.status.get_or_insert_with(Default::default);

        for volume in snapshot_vm.volumes() {
            if volume.memory_dump.is_some() {
                continue;
            }
            if volume.data_volume.is_none() && volume.persistent_volume_claim.is_none() {
                volumes.push(volume.clone());
                continue;
            }

            let mut nv = volume.clone();
            for vr in status.restores.iter_mut().filter(|vr| vr.volume_name == volume.name) {
                if ctx
                    .informers
                    .pvc
                    .get_namespaced(&self.namespace, &vr.persistent_volume_claim_name)
                    .is_none()
                {
                    return Err(Error::RestorePvcMissing {
                        namespace: self.namespace.clone(),
                        name: vr.persistent_volume_claim_name.clone(),
                    });
                }

                let Some(dv) = &volume.data_volume else {
                    if let Some(claim) = nv.persistent_volume_claim.as_mut() {
                        claim.claim_name = vr.persistent_volume_claim_name.clone();
                    }
                    continue;
                };

                let Some(index) = templates.iter().position(|t| t.name() == dv.name)
                else {
                    // No template to recreate the DataVolume from, so the
                    // volume mounts the restored PVC directly.
                    nv = Volume::from_claim(&volume.name, &vr.persistent_volume_claim_name);
                    continue;
                };

                let dv_name = match &vr.data_volume_name {
                    Some(name) => name.clone(),
                    None => {
                        // Same name as the PVC, so the DataVolume adopts it.
                        let dv_name = vr.persistent_volume_claim_name.clone();
                        self.adopt_pvc(ctx, &vr.persistent_volume_claim_name, &dv_name, log)
                            .await?;
                        vr.data_volume_name = Some(dv_name.clone());
                        updated_status = true;
                        dv_name
                    }
                };
                templates[index].metadata.name = Some(dv_name.clone());
                if let Some(source) = nv.data_volume.as_mut() {
                    source.name = dv_name;
                }
            }
            volumes.push(nv);
        }

        if updated_status {
            if let Some(vm) = &self.vm {
                status.deleted_data_volumes = vm
                    .spec
                    .data_volume_templates
                    .iter()
                    .map(|t| t.name())
                    .filter(|name| !templates.iter().any(|t| t.name() == *name))
                    .map(str::to_string)
                    .collect();
            }
            return Ok(true);
        }

        let mut new_vm = match &self.vm {
            Some(vm) => VirtualMachine { spec: snapshot_vm.spec.clone(), ..vm.clone() },
            None => {
                let mut spec = snapshot_vm.spec.clone();
                if let Some(template) = spec.template.as_mut() {
                    template.spec.strip_firmware_uuid();
                }
                VirtualMachine {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        namespace: Some(self.namespace.clone()),
                        labels: snapshot_vm.metadata.labels.clone(),
                        annotations: snapshot_vm.metadata.annotations.clone(),
                        ..Default::default()
                    },
                    spec,
                    status: VirtualMachineStatus::default(),
                }
            }
        };

        // The snapshot may have been taken of a running VM.
        if new_vm.spec.run_strategy.is_some() {
            new_vm.spec.run_strategy = Some(RunStrategy::Halted);
        } else if new_vm.spec.running.is_some() {
            new_vm.spec.running = Some(false);
        }
        new_vm.spec.data_volume_templates = templates;
        new_vm.spec.template.get_or_insert_with(Default::default).spec.volumes = volumes;
        new_vm
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(LAST_RESTORE_ANNOTATION.to_string(), last_restore_value(restore));

        let vm = if self.vm.is_some() {
            info!(log, "rewriting target vm spec");
            ctx.client.update_vm(&new_vm).await?
        } else {
            info!(log, "creating target vm");
            ctx.client.create_vm(&new_vm).await?
        };
        self.vm = Some(vm);
        Ok(true)
    }

    /// Hands a restored PVC over to the DataVolume `dv_name`, which will
    /// take ownership of it once the VM recreates the DataVolume.
    async fn adopt_pvc(
        &self,
        ctx: &Context,
        pvc_name: &str,
        dv_name: &str,
        log: &Logger,
    ) -> Result<(), Error> {
        let Some(pvc) = ctx.informers.pvc.get_namespaced(&self.namespace, pvc_name)
        else {
            return Err(Error::RestorePvcMissing {
                namespace: self.namespace.clone(),
                name: pvc_name.to_string(),
            });
        };
        if populated_for(&pvc) == Some(dv_name) {
            return Ok(());
        }

        debug!(log, "marking restored pvc as populated"; "pvc" => pvc_name);
        let mut pvc = pvc;
        pvc.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(POPULATED_FOR_ANNOTATION.to_string(), dv_name.to_string());
        pvc.metadata.owner_references = None;
        ctx.client.update_pvc(&pvc).await?;
        Ok(())
    }

    async fn cleanup(
        &self,
        ctx: &Context,
        restore: &VirtualMachineRestore,
        log: &Logger,
    ) -> Result<(), Error> {
        let Some(status) = &restore.status else {
            return Ok(());
        };
        for name in &status.deleted_data_volumes {
            if !ctx.informers.data_volume.contains(&key(Some(&self.namespace), name)) {
                continue;
            }
            info!(log, "deleting obsolete datavolume"; "dv" => name);
            match ctx.client.delete_data_volume(&self.namespace, name).await {
                Err(e) if e.is_not_found() => {}
                r => r?,
            }
        }
        Ok(())
    }
}

fn populated_for(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(POPULATED_FOR_ANNOTATION))
        .map(String::as_str)
}

fn last_restore_value(restore: &VirtualMachineRestore) -> String {
    format!(
        "{}-{}",
        restore.metadata.name.as_deref().unwrap_or_default(),
        restore.metadata.uid.as_deref().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fixtures, FakeCluster};
    use snapshot_api_types::snapshot::{
        SourceSpec, VirtualMachineRestoreStatus,
        VirtualMachineSnapshotContentSpec, VolumeRestore,
    };

    fn resolve(cluster: &FakeCluster, restore: &VirtualMachineRestore) -> RestoreTarget {
        RestoreTarget::resolve(&cluster.context(), restore).unwrap()
    }

    fn admitted_restore(name: &str, vm: &str) -> VirtualMachineRestore {
        let mut restore = fixtures::restore("ns", name, vm, "snap");
        restore.metadata.uid = Some(format!("{name}-uid"));
        restore
    }

    #[test]
    fn unknown_target_kind_is_rejected() {
        let cluster = FakeCluster::new();
        let mut restore = admitted_restore("restore", "vm");
        restore.spec.target.kind = "Pod".into();
        let err = RestoreTarget::resolve(&cluster.context(), &restore)
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "unknown target Pod/vm");
    }

    #[test]
    fn missing_target_is_ready_and_owns_nothing() {
        let cluster = FakeCluster::new();
        let restore = admitted_restore("restore", "vm");
        let target = resolve(&cluster, &restore);
        assert!(!target.exists());
        assert!(target.ready(&cluster.context()).unwrap());

        let mut meta = fixtures::meta("ns", "pvc");
        target.own(&mut meta);
        assert_eq!(meta.owner_references, None);
    }

    #[test]
    fn readiness_follows_run_strategy_and_vmi() {
        let cluster = FakeCluster::new();
        cluster.add_vm(fixtures::vm("ns", "vm"));
        let restore = admitted_restore("restore", "vm");
        let ctx = cluster.context();

        assert!(resolve(&cluster, &restore).ready(&ctx).unwrap());

        // Stopping but not yet stopped.
        cluster.add_vmi(fixtures::vmi("ns", "vm", false));
        assert!(!resolve(&cluster, &restore).ready(&ctx).unwrap());
        cluster.remove_vmi("ns", "vm");

        let mut running = cluster.vm("ns", "vm");
        running.spec.running = Some(true);
        running.metadata.resource_version = None;
        cluster.add_vm(running);
        let err = resolve(&cluster, &restore).ready(&ctx).unwrap_err();
        assert_eq!(err.to_string(), "invalid RunStrategy \"Always\"");
    }

    #[tokio::test]
    async fn restore_lock_is_exclusive() {
        let cluster = FakeCluster::new();
        cluster.add_vm(fixtures::vm("ns", "vm"));
        let ctx = cluster.context();
        let first = admitted_restore("first", "vm");
        let second = admitted_restore("second", "vm");

        let mut target = resolve(&cluster, &first);
        target.update_restore_in_progress(&ctx, &first, &cluster.log).await.unwrap();
        assert_eq!(
            cluster.vm("ns", "vm").status.restore_in_progress.as_deref(),
            Some("first")
        );

        // Holding it already is not a write.
        let mut target = resolve(&cluster, &first);
        target.update_restore_in_progress(&ctx, &first, &cluster.log).await.unwrap();
        assert_eq!(cluster.writes(), vec!["update_vm_status ns/vm"]);

        let mut target = resolve(&cluster, &second);
        let err = target
            .update_restore_in_progress(&ctx, &second, &cluster.log)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "vm restore first in progress");

        // Only the holder can release it.
        let target = resolve(&cluster, &second);
        assert!(!target.update_done_restore(&ctx, &second, &cluster.log).await.unwrap());
        let target = resolve(&cluster, &first);
        assert!(target.update_done_restore(&ctx, &first, &cluster.log).await.unwrap());
        assert_eq!(cluster.vm("ns", "vm").status.restore_in_progress, None);
    }

    #[tokio::test]
    async fn releasing_the_lock_clears_a_memory_dump_request() {
        let cluster = FakeCluster::new();
        let mut vm = fixtures::vm("ns", "vm");
        vm.status.restore_in_progress = Some("restore".into());
        vm.status.memory_dump_request = Some(serde_json::json!({ "claimName": "dump" }));
        cluster.add_vm(vm);
        let restore = admitted_restore("restore", "vm");

        let target = resolve(&cluster, &restore);
        assert!(target
            .update_done_restore(&cluster.context(), &restore, &cluster.log)
            .await
            .unwrap());
        let vm = cluster.vm("ns", "vm");
        assert_eq!(vm.status.restore_in_progress, None);
        assert_eq!(vm.status.memory_dump_request, None);
    }

    #[tokio::test]
    async fn memory_dumps_are_dropped_and_untemplated_data_volumes_become_claims() {
        let cluster = FakeCluster::new();
        let mut snapshot_vm = fixtures::vm_with_data_volume("ns", "vm", "disk1", "alpine-dv");
        snapshot_vm.spec.data_volume_templates.clear();
        let volumes = &mut snapshot_vm.spec.template.as_mut().unwrap().spec.volumes;
        volumes.push(Volume {
            name: "dump".into(),
            memory_dump: Some(serde_json::json!({ "claimName": "dump-pvc" })),
            ..Default::default()
        });
        cluster.add_vm(fixtures::vm("ns", "vm"));
        cluster.add_pvc(fixtures::pvc("ns", "restore-restore-uid-disk1", None, "pv-1"));

        let content = VirtualMachineSnapshotContent {
            metadata: fixtures::meta("ns", "content"),
            spec: VirtualMachineSnapshotContentSpec {
                source: SourceSpec {
                    virtual_machine: Some(snapshot_vm),
                },
                ..Default::default()
            },
            status: None,
        };
        let mut restore = admitted_restore("restore", "vm");
        restore.status = Some(VirtualMachineRestoreStatus {
            restores: vec![VolumeRestore {
                volume_name: "disk1".into(),
                persistent_volume_claim_name: "restore-restore-uid-disk1".into(),
                volume_snapshot_name: "vs".into(),
                data_volume_name: None,
            }],
            ..Default::default()
        });

        let ctx = cluster.context();
        let mut target = resolve(&cluster, &restore);
        assert!(target.reconcile(&ctx, &mut restore, &content, &cluster.log).await.unwrap());

        let vm = cluster.vm("ns", "vm");
        assert_eq!(vm.volumes(), &[Volume::from_claim("disk1", "restore-restore-uid-disk1")]);
        assert_eq!(vm.spec.running, Some(false));
        assert!(RestoreTarget::resolve(&ctx, &restore).unwrap().restored_by(&restore));
        assert_eq!(restore.status.unwrap().restores[0].data_volume_name, None);
    }

    #[tokio::test]
    async fn missing_restored_pvc_is_an_error() {
        let cluster = FakeCluster::new();
        let snapshot_vm = fixtures::vm_with_data_volume("ns", "vm", "disk1", "alpine-dv");
        cluster.add_vm(fixtures::vm("ns", "vm"));
        let content = VirtualMachineSnapshotContent {
            metadata: fixtures::meta("ns", "content"),
            spec: VirtualMachineSnapshotContentSpec {
                source: SourceSpec {
                    virtual_machine: Some(snapshot_vm),
                },
                ..Default::default()
            },
            status: None,
        };
        let mut restore = admitted_restore("restore", "vm");
        restore.status = Some(VirtualMachineRestoreStatus {
            restores: vec![VolumeRestore {
                volume_name: "disk1".into(),
                persistent_volume_claim_name: "gone".into(),
                volume_snapshot_name: "vs".into(),
                data_volume_name: None,
            }],
            ..Default::default()
        });

        let mut target = resolve(&cluster, &restore);
        let err = target
            .reconcile(&cluster.context(), &mut restore, &content, &cluster.log)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "pvc ns/gone does not exist and should");
        assert!(cluster.writes().is_empty());
    }
}
