// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciling VirtualMachineSnapshotContent: one VolumeSnapshot per volume
//! backup, and a status aggregated from them.

use std::time::Duration;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::Resource;
use slog::{debug, info, warn, Logger};
use snapshot_api_types::csi::{
    VolumeSnapshot, VolumeSnapshotClass, VolumeSnapshotSource, VolumeSnapshotSpec,
};
use snapshot_api_types::snapshot::{
    Indication, SnapshotError, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent, VirtualMachineSnapshotContentStatus,
    VolumeBackup, VolumeSnapshotStatus,
};
use snapshot_api_types::virt::AGENT_CONNECTED_CONDITION;
use snapshot_api_types::ObjectMeta;

use super::SnapshotController;
use crate::dynamic_informer::VolumeSnapshotProvider;
use crate::events::{
    object_reference, EventType, VOLUME_SNAPSHOT_CREATE_EVENT,
    VOLUME_SNAPSHOT_MISSING_EVENT,
};
use crate::informer::object_key;
use crate::Error;

/// Picks the VolumeSnapshotClass to use for volumes of storage class `sc`.
///
/// Candidates are the classes whose driver is the storage class's
/// provisioner. With several candidates, the first one annotated as the
/// default wins; if none is, the choice is ambiguous.
pub fn resolve_volume_snapshot_class(
    sc: &StorageClass,
    classes: &[VolumeSnapshotClass],
) -> Result<Option<String>, Error> {
    let matches: Vec<&VolumeSnapshotClass> =
        classes.iter().filter(|c| c.driver == sc.provisioner).collect();

    match matches.as_slice() {
        [] => Ok(None),
        [only] => Ok(only.metadata.name.clone()),
        several => several
            .iter()
            .find(|c| c.is_default())
            .map(|c| Some(c.metadata.name.clone().unwrap_or_default()))
            .ok_or_else(|| Error::AmbiguousVolumeSnapshotClass {
                count: several.len(),
                storage_class: sc.metadata.name.clone().unwrap_or_default(),
            }),
    }
}

fn volume_snapshot_status(vs: &VolumeSnapshot) -> VolumeSnapshotStatus {
    let mut status = VolumeSnapshotStatus {
        volume_snapshot_name: vs.metadata.name.clone().unwrap_or_default(),
        ..Default::default()
    };
    if let Some(s) = &vs.status {
        status.ready_to_use = s.ready_to_use;
        status.creation_time = s.creation_time.clone();
        status.error = s.error.as_ref().map(|e| SnapshotError {
            time: e.time.clone(),
            message: e.message.clone(),
        });
    }
    status
}

impl SnapshotController {
    /// Name of the VolumeSnapshotClass for volumes of storage class
    /// `storage_class`. `None` means such volumes cannot be snapshotted.
    pub(super) fn get_volume_snapshot_class(
        &self,
        storage_class: &str,
        log: &Logger,
    ) -> Result<Option<String>, Error> {
        let Some(sc) = self.ctx.informers.storage_class.get(storage_class) else {
            debug!(log, "storage class does not exist"; "storage_class" => storage_class);
            return Ok(None);
        };

        let classes = self.dynamic.volume_snapshot_classes();
        let class = resolve_volume_snapshot_class(&sc, &classes)?;
        if class.is_none() {
            warn!(log, "no VolumeSnapshotClass for storage class";
                "storage_class" => storage_class,
                "provisioner" => &sc.provisioner);
        }
        Ok(class)
    }

    /// The PVC `name` if it can be snapshotted: it exists, is bound, and its
    /// storage class has a VolumeSnapshotClass.
    pub(super) fn get_snapshot_pvc(
        &self,
        namespace: &str,
        name: &str,
        log: &Logger,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        let Some(pvc) = self.ctx.informers.pvc.get_namespaced(namespace, name) else {
            return Ok(None);
        };
        let Some(spec) = pvc.spec.as_ref() else {
            return Ok(None);
        };

        if spec.volume_name.as_deref().unwrap_or_default().is_empty() {
            warn!(log, "unbound PVC"; "pvc" => name);
            return Ok(None);
        }

        let Some(storage_class) = spec.storage_class_name.as_deref() else {
            warn!(log, "no storage class for PVC"; "pvc" => name);
            return Ok(None);
        };

        match self.get_volume_snapshot_class(storage_class, log)? {
            Some(_) => Ok(Some(pvc)),
            None => Ok(None),
        }
    }

    /// One reconcile pass over `content`.
    pub async fn update_vm_snapshot_content(
        &self,
        content: VirtualMachineSnapshotContent,
    ) -> Result<Duration, Error> {
        let log = self.log.new(slog::o!("vmsnapshotcontent" => object_key(&content)));
        debug!(log, "updating VirtualMachineSnapshotContent");

        let namespace = content.metadata.namespace.clone().unwrap_or_default();
        let currently_ready = content.ready();
        let currently_error = content.in_error();

        let mut snapshot: Option<Option<VirtualMachineSnapshot>> = None;
        let mut statuses = Vec::new();
        let mut deleted = Vec::new();
        let mut skipped = Vec::new();

        for backup in &content.spec.volume_backups {
            let Some(vs_name) = backup.volume_snapshot_name.as_deref() else {
                continue;
            };

            let vs = match self.dynamic.get_volume_snapshot(&namespace, vs_name) {
                Some(vs) => vs,
                None if currently_ready => {
                    warn!(log, "VolumeSnapshot no longer exists"; "volumesnapshot" => vs_name);
                    self.ctx.recorder.event(
                        object_reference(&content),
                        EventType::Warning,
                        VOLUME_SNAPSHOT_MISSING_EVENT,
                        format!("VolumeSnapshot {vs_name} no longer exists"),
                    );
                    deleted.push(vs_name.to_string());
                    continue;
                }
                None if currently_error => {
                    debug!(log, "not creating VolumeSnapshot in error state";
                        "volumesnapshot" => vs_name);
                    skipped.push(vs_name.to_string());
                    continue;
                }
                None => {
                    if snapshot.is_none() {
                        let s = self.get_vm_snapshot(&content)?;
                        if let Some(s) = &s {
                            if s.metadata.deletion_timestamp.is_none() {
                                self.freeze_guest_fs_if_needed(s, &log).await?;
                            }
                        }
                        snapshot = Some(s);
                    }

                    let deleting = match snapshot.as_ref().and_then(Option::as_ref) {
                        Some(s) => s.metadata.deletion_timestamp.is_some(),
                        None => true,
                    };
                    if deleting {
                        debug!(log, "not creating VolumeSnapshot, vm snapshot is gone";
                            "volumesnapshot" => vs_name);
                        skipped.push(vs_name.to_string());
                        continue;
                    }

                    self.create_volume_snapshot(&content, backup, &log).await?
                }
            };

            statuses.push(volume_snapshot_status(&vs));
        }

        let mut ready = true;
        let mut error_message = None;
        if !deleted.is_empty() {
            ready = false;
            error_message = Some(format!("VolumeSnapshots ({}) missing", deleted.join(",")));
        } else if !skipped.is_empty() {
            ready = false;
            error_message = Some(format!(
                "VolumeSnapshots ({}) skipped because in error state",
                skipped.join(",")
            ));
        } else {
            for status in &statuses {
                if status.ready_to_use != Some(true) {
                    ready = false;
                }
                if let Some(message) = status.error.as_ref().and_then(|e| e.message.as_ref()) {
                    error_message = Some(format!(
                        "VolumeSnapshot {} error: {message}",
                        status.volume_snapshot_name
                    ));
                    break;
                }
            }
        }

        let mut updated = content.clone();
        let previous = content.status.as_ref().and_then(|s| s.error.as_ref());
        let status = updated
            .status
            .get_or_insert_with(VirtualMachineSnapshotContentStatus::default);
        status.error = error_message.map(|message| match previous {
            Some(e) if e.message.as_deref() == Some(message.as_str()) => e.clone(),
            _ => SnapshotError { time: Some(self.ctx.clock.now()), message: Some(message) },
        });
        status.ready_to_use = Some(ready);
        status.volume_snapshot_status = statuses;
        if ready && !currently_ready {
            status.creation_time = Some(self.ctx.clock.now());
        }

        if updated != content {
            self.ctx.client.update_vm_snapshot_content(&updated).await?;
        }

        Ok(Duration::ZERO)
    }

    /// Freezes the guest filesystems of an online snapshot's VM before its
    /// first VolumeSnapshot is cut, if the guest agent is there to do it.
    async fn freeze_guest_fs_if_needed(
        &self,
        snapshot: &VirtualMachineSnapshot,
        log: &Logger,
    ) -> Result<(), Error> {
        if !snapshot.has_indication(Indication::Online)
            || !snapshot.has_indication(Indication::NoGuestAgent)
        {
            return Ok(());
        }

        let namespace = snapshot.metadata.namespace.as_deref().unwrap_or_default();
        let vm = &snapshot.spec.source.name;
        let agent_connected = self
            .ctx
            .informers
            .vmi
            .get_namespaced(namespace, vm)
            .is_some_and(|vmi| vmi.has_condition(AGENT_CONNECTED_CONDITION));
        if !agent_connected {
            return Ok(());
        }

        info!(log, "freezing guest filesystems"; "vm" => vm);
        if let Err(e) = self.ctx.client.freeze_vmi(namespace, vm).await {
            let reason = "Failed freezing guest FS";
            if let Err(update_err) =
                self.update_vm_snapshot_error(snapshot.clone(), reason).await
            {
                warn!(log, "failed to record error";
                    "reason" => reason, "error" => %update_err);
            }
            return Err(e.into());
        }

        let mut updated = snapshot.clone();
        if let Some(status) = updated.status.as_mut() {
            for indication in status.indications.iter_mut() {
                if *indication == Indication::NoGuestAgent {
                    *indication = Indication::GuestAgent;
                }
            }
        }
        self.ctx.client.update_vm_snapshot(&updated).await?;
        Ok(())
    }

    async fn create_volume_snapshot(
        &self,
        content: &VirtualMachineSnapshotContent,
        backup: &VolumeBackup,
        log: &Logger,
    ) -> Result<VolumeSnapshot, Error> {
        let namespace = content.metadata.namespace.clone().unwrap_or_default();
        let pvc = &backup.persistent_volume_claim;
        let pvc_name = pvc.metadata.name.clone().unwrap_or_default();

        let Some(storage_class) = pvc.spec.storage_class_name.as_deref() else {
            return Err(Error::NoStorageClass { namespace, pvc: pvc_name });
        };
        let class = self.get_volume_snapshot_class(storage_class, log)?;

        let vs = VolumeSnapshot {
            metadata: ObjectMeta {
                name: backup.volume_snapshot_name.clone(),
                namespace: Some(namespace),
                owner_references: Some(vec![OwnerReference {
                    api_version: VirtualMachineSnapshotContent::API_VERSION.to_string(),
                    kind: VirtualMachineSnapshotContent::KIND.to_string(),
                    name: content.metadata.name.clone().unwrap_or_default(),
                    uid: content.metadata.uid.clone().unwrap_or_default(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]),
                ..Default::default()
            },
            spec: VolumeSnapshotSpec {
                source: VolumeSnapshotSource {
                    persistent_volume_claim_name: Some(pvc_name),
                    volume_snapshot_content_name: None,
                },
                volume_snapshot_class_name: class,
            },
            status: None,
        };

        let created = self.ctx.client.create_volume_snapshot(&vs).await?;
        let name = created.metadata.name.as_deref().unwrap_or_default();
        info!(log, "created VolumeSnapshot"; "volumesnapshot" => name);
        self.ctx.recorder.event(
            object_reference(content),
            EventType::Normal,
            VOLUME_SNAPSHOT_CREATE_EVENT,
            format!("Successfully created VolumeSnapshot {name}"),
        );
        Ok(created)
    }
}
