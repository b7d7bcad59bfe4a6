// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, TypedLocalObjectReference,
};
use slog::{debug, info, Logger};
use snapshot_api_types::csi::VolumeSnapshot;
use snapshot_api_types::snapshot::{
    ConditionStatus, VirtualMachineRestore, VirtualMachineRestoreStatus,
    VirtualMachineSnapshotContent, VolumeBackup, VolumeRestore,
};
use snapshot_api_types::units::compare_quantities;
use snapshot_api_types::virt::VirtualMachine;
use snapshot_api_types::ObjectMeta;

use super::{
    RestoreController, RESTORE_NAME_ANNOTATION, RESTORE_SOURCE_NAMESPACE_LABEL,
    RESTORE_SOURCE_NAME_LABEL,
};
use crate::conditions::{self, update_condition};
use crate::events::{
    object_reference, EventType, RESTORE_COMPLETE_EVENT, RESTORE_ERROR_EVENT,
};
use crate::informer::{key, object_key};
use crate::target::RestoreTarget;
use crate::Error;

/// Annotations copied from the source PVC that describe its binding or
/// provisioning, and would confuse whoever handles the new one.
const STRIPPED_ANNOTATION_PREFIXES: &[&str] = &[
    "pv.kubernetes.io",
    "volume.beta.kubernetes.io",
    "cdi.kubevirt.io",
    "volume.kubernetes.io",
];

fn status_mut(restore: &mut VirtualMachineRestore) -> &mut VirtualMachineRestoreStatus {
    restore.status.get_or_insert_with(|| VirtualMachineRestoreStatus {
        complete: Some(false),
        ..Default::default()
    })
}

impl RestoreController {
    /// One reconcile pass over `restore`. Each pass makes at most one
    /// externally visible step and relies on the resulting watch event, or
    /// the returned delay, to be called again.
    pub async fn update_vm_restore(
        &self,
        restore: VirtualMachineRestore,
    ) -> Result<Duration, Error> {
        let log = self.log.new(slog::o!("restore" => object_key(&restore)));
        debug!(log, "updating restore");

        let mut updated = restore.clone();
        status_mut(&mut updated);

        let mut target = match RestoreTarget::resolve(&self.ctx, &updated) {
            Ok(target) => target,
            Err(e) => return self.do_update_error(&restore, e).await,
        };

        if !updated.progressing() {
            target.update_done_restore(&self.ctx, &updated, &log).await?;
            return Ok(Duration::ZERO);
        }

        // A target created by this restore only exists, and so can only
        // own it, some passes in.
        if updated.metadata.owner_references.as_ref().map_or(true, Vec::is_empty) {
            target.own(&mut updated.metadata);
        }
        if status_mut(&mut updated).conditions.is_empty() {
            self.set_conditions(
                &mut updated,
                (ConditionStatus::True, "Initializing VirtualMachineRestore"),
                (ConditionStatus::False, "Initializing VirtualMachineRestore"),
            );
        }

        target.update_restore_in_progress(&self.ctx, &updated, &log).await?;

        // Everything above must be persisted before any PVC is created.
        if updated != restore {
            self.ctx.client.update_vm_restore(&updated).await?;
            return Ok(Duration::ZERO);
        }

        match self.reconcile_restore(&mut updated, &mut target, &log).await {
            Ok(requeue) => {
                if updated != restore {
                    self.ctx.client.update_vm_restore(&updated).await?;
                }
                Ok(requeue)
            }
            Err(e) => self.do_update_error(&restore, e).await,
        }
    }

    async fn reconcile_restore(
        &self,
        restore: &mut VirtualMachineRestore,
        target: &mut RestoreTarget,
        log: &Logger,
    ) -> Result<Duration, Error> {
        let content = self.get_snapshot_content(restore)?;

        if self.reconcile_volume_restores(restore, target, &content, log).await? {
            self.set_conditions(
                restore,
                (ConditionStatus::True, "Creating new PVCs"),
                (ConditionStatus::False, "Waiting for new PVCs"),
            );
            return Ok(Duration::ZERO);
        }

        if !target.ready(&self.ctx)? {
            debug!(log, "waiting for target to stop");
            self.set_conditions(
                restore,
                (ConditionStatus::False, "Waiting for target to be ready"),
                (ConditionStatus::False, "Waiting for target to be ready"),
            );
            return Ok(self.retry_interval);
        }

        if target.reconcile(&self.ctx, restore, &content, log).await? {
            self.set_conditions(
                restore,
                (ConditionStatus::True, "Updating target spec"),
                (ConditionStatus::False, "Waiting for target update"),
            );
            return Ok(Duration::ZERO);
        }

        target.cleanup(&self.ctx, restore, log).await?;

        info!(log, "restore complete");
        let name = restore.metadata.name.clone().unwrap_or_default();
        self.ctx.recorder.event(
            object_reference(&*restore),
            EventType::Normal,
            RESTORE_COMPLETE_EVENT,
            format!("Successfully completed VirtualMachineRestore {name}"),
        );
        let now = self.ctx.clock.now();
        let status = status_mut(restore);
        status.complete = Some(true);
        status.restore_time = Some(now);
        self.set_conditions(
            restore,
            (ConditionStatus::False, "Operation complete"),
            (ConditionStatus::True, "Operation complete"),
        );
        Ok(Duration::ZERO)
    }

    fn set_conditions(
        &self,
        restore: &mut VirtualMachineRestore,
        progressing: (ConditionStatus, &str),
        ready: (ConditionStatus, &str),
    ) {
        let now = self.ctx.clock.now();
        let conditions = &mut status_mut(restore).conditions;
        update_condition(
            conditions,
            conditions::progressing(progressing.0, progressing.1, &now),
            true,
        );
        update_condition(conditions, conditions::ready(ready.0, ready.1, &now), true);
    }

    /// Records `err` on `restore` and hands it back, so the key is retried
    /// with backoff.
    async fn do_update_error(
        &self,
        restore: &VirtualMachineRestore,
        err: Error,
    ) -> Result<Duration, Error> {
        self.ctx.recorder.event(
            object_reference(restore),
            EventType::Warning,
            RESTORE_ERROR_EVENT,
            format!("VirtualMachineRestore encountered error {err}"),
        );

        let reason = err.to_string();
        let mut updated = restore.clone();
        self.set_conditions(
            &mut updated,
            (ConditionStatus::False, reason.as_str()),
            (ConditionStatus::False, reason.as_str()),
        );
        if updated != *restore {
            self.ctx.client.update_vm_restore(&updated).await?;
        }
        Err(err)
    }

    /// The content of the snapshot `restore` restores from, which must be
    /// ready.
    fn get_snapshot_content(
        &self,
        restore: &VirtualMachineRestore,
    ) -> Result<VirtualMachineSnapshotContent, Error> {
        let namespace = restore.metadata.namespace.as_deref();
        let informers = &self.ctx.informers;

        let snapshot_key = key(namespace, &restore.spec.virtual_machine_snapshot_name);
        let snapshot = informers
            .vm_snapshot
            .get(&snapshot_key)
            .ok_or_else(|| Error::SnapshotNotFound(snapshot_key.clone()))?;
        if !snapshot.ready() {
            return Err(Error::SnapshotNotReady(snapshot_key));
        }

        let content_name = snapshot
            .status
            .as_ref()
            .and_then(|s| s.virtual_machine_snapshot_content_name.as_deref())
            .ok_or_else(|| Error::NoContentName(snapshot_key.clone()))?;
        let content_key = key(namespace, content_name);
        let content = informers
            .vm_snapshot_content
            .get(&content_key)
            .ok_or_else(|| Error::ContentNotFound(content_key.clone()))?;
        if !content.ready() {
            return Err(Error::ContentNotReady(content_key));
        }
        Ok(content)
    }

    /// Makes sure a PVC exists, and is bound, for every volume to restore.
    /// Returns true while there is still something to wait for.
    async fn reconcile_volume_restores(
        &self,
        restore: &mut VirtualMachineRestore,
        target: &RestoreTarget,
        content: &VirtualMachineSnapshotContent,
        log: &Logger,
    ) -> Result<bool, Error> {
        let source_vm = content
            .spec
            .source
            .virtual_machine
            .as_ref()
            .ok_or(Error::UnexpectedSnapshotSource)?;

        // Restoring over a different VM than the one snapshotted is refused.
        // A VM this restore created carries its own UID, which is fine.
        if target.exists()
            && !target.restored_by(restore)
            && target.uid() != source_vm.metadata.uid.as_deref()
        {
            return Err(Error::SourceTargetMismatch);
        }

        let memory_dumps: BTreeSet<&str> = source_vm
            .volumes()
            .iter()
            .filter(|v| v.memory_dump.is_some())
            .map(|v| v.name.as_str())
            .collect();

        let existing = restore
            .status
            .as_ref()
            .map(|s| s.restores.as_slice())
            .unwrap_or_default();
        let mut restores = Vec::new();
        for backup in &content.spec.volume_backups {
            if memory_dumps.contains(backup.volume_name.as_str()) {
                continue;
            }
            if let Some(vr) = existing.iter().find(|vr| vr.volume_name == backup.volume_name)
            {
                restores.push(vr.clone());
                continue;
            }
            let volume_snapshot_name = backup
                .volume_snapshot_name
                .clone()
                .ok_or_else(|| Error::VolumeSnapshotNameMissing(backup.volume_name.clone()))?;
            restores.push(VolumeRestore {
                volume_name: backup.volume_name.clone(),
                persistent_volume_claim_name: restore_pvc_name(restore, &backup.volume_name),
                volume_snapshot_name,
                data_volume_name: None,
            });
        }

        if restores.as_slice() != existing {
            debug!(log, "recording volume restores"; "count" => restores.len());
            status_mut(restore).restores = restores;
            return Ok(true);
        }

        let namespace = restore.metadata.namespace.as_deref().unwrap_or_default();
        let mut created = false;
        let mut waiting = false;
        for vr in &restores {
            let Some(pvc) = self
                .ctx
                .informers
                .pvc
                .get_namespaced(namespace, &vr.persistent_volume_claim_name)
            else {
                let backup = content
                    .spec
                    .volume_backups
                    .iter()
                    .find(|b| b.volume_name == vr.volume_name)
                    .ok_or_else(|| Error::VolumeBackupNotFound(vr.volume_name.clone()))?;
                self.create_restore_pvc(restore, target, source_vm, backup, vr, log)
                    .await?;
                created = true;
                continue;
            };

            let phase = pvc.status.as_ref().and_then(|s| s.phase.as_deref());
            match phase {
                None | Some("Pending") => waiting |= self.waits_for_binding(&pvc)?,
                Some("Bound") => {}
                Some(phase) => {
                    return Err(Error::PvcPhase {
                        namespace: namespace.to_string(),
                        name: vr.persistent_volume_claim_name.clone(),
                        phase: phase.to_string(),
                    })
                }
            }
        }

        Ok(created || waiting)
    }

    /// Whether a pending PVC is expected to bind on its own. PVCs whose
    /// storage class binds on first consumer stay pending until the VM
    /// starts, so they are not waited for.
    fn waits_for_binding(&self, pvc: &PersistentVolumeClaim) -> Result<bool, Error> {
        let Some(sc_name) = pvc.spec.as_ref().and_then(|s| s.storage_class_name.as_deref())
        else {
            return Ok(true);
        };
        let sc = self
            .ctx
            .informers
            .storage_class
            .get(sc_name)
            .ok_or_else(|| Error::StorageClassNotFound(sc_name.to_string()))?;
        Ok(matches!(sc.volume_binding_mode.as_deref(), None | Some("Immediate")))
    }

    async fn create_restore_pvc(
        &self,
        restore: &VirtualMachineRestore,
        target: &RestoreTarget,
        source_vm: &VirtualMachine,
        backup: &VolumeBackup,
        vr: &VolumeRestore,
        log: &Logger,
    ) -> Result<(), Error> {
        let namespace = restore.metadata.namespace.as_deref().unwrap_or_default();
        let vs = self
            .volume_snapshots
            .get_volume_snapshot(namespace, &vr.volume_snapshot_name)
            .ok_or_else(|| Error::MissingVolumeSnapshot(vr.volume_snapshot_name.clone()))?;

        let mut pvc = restore_pvc(restore, source_vm, backup, vr, &vs)?;
        target.own(&mut pvc.metadata);

        info!(log, "creating restore pvc";
            "pvc" => &vr.persistent_volume_claim_name,
            "volumesnapshot" => &vr.volume_snapshot_name);
        match self.ctx.client.create_pvc(&pvc).await {
            Err(e) if e.is_already_exists() => {}
            r => {
                r?;
            }
        }
        Ok(())
    }
}

/// Name of the PVC restoring `volume` for `restore`.
pub fn restore_pvc_name(restore: &VirtualMachineRestore, volume: &str) -> String {
    format!(
        "restore-{}-{volume}",
        restore.metadata.uid.as_deref().unwrap_or_default()
    )
}

/// The PVC that restores `backup` from VolumeSnapshot `vs`: the captured
/// manifest, stripped of provisioning state, sourced from the snapshot and
/// grown to the snapshot's restore size if that is larger.
pub fn restore_pvc(
    restore: &VirtualMachineRestore,
    source_vm: &VirtualMachine,
    backup: &VolumeBackup,
    vr: &VolumeRestore,
    vs: &VolumeSnapshot,
) -> Result<PersistentVolumeClaim, Error> {
    let source = &backup.persistent_volume_claim;

    let mut annotations = source.metadata.annotations.clone().unwrap_or_default();
    annotations.retain(|k, _| {
        !STRIPPED_ANNOTATION_PREFIXES.iter().any(|prefix| k.starts_with(prefix))
    });
    annotations.insert(
        RESTORE_NAME_ANNOTATION.to_string(),
        restore.metadata.name.clone().unwrap_or_default(),
    );

    let mut labels = source.metadata.labels.clone().unwrap_or_default();
    labels.insert(
        RESTORE_SOURCE_NAME_LABEL.to_string(),
        source_vm.metadata.name.clone().unwrap_or_default(),
    );
    labels.insert(
        RESTORE_SOURCE_NAMESPACE_LABEL.to_string(),
        source_vm.metadata.namespace.clone().unwrap_or_default(),
    );

    let mut spec = source.spec.clone();
    spec.volume_name = None;
    spec.data_source_ref = None;
    spec.data_source = Some(TypedLocalObjectReference {
        api_group: Some("snapshot.storage.k8s.io".to_string()),
        kind: "VolumeSnapshot".to_string(),
        name: vr.volume_snapshot_name.clone(),
    });

    if let Some(restore_size) = vs.status.as_ref().and_then(|s| s.restore_size.as_ref()) {
        let requests = spec
            .resources
            .get_or_insert_with(Default::default)
            .requests
            .get_or_insert_with(BTreeMap::new);
        let grow = match requests.get("storage") {
            Some(current) => compare_quantities(restore_size, current)? == Ordering::Greater,
            None => true,
        };
        if grow {
            requests.insert("storage".to_string(), restore_size.clone());
        }
    }

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(vr.persistent_volume_claim_name.clone()),
            namespace: restore.metadata.namespace.clone(),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    })
}
