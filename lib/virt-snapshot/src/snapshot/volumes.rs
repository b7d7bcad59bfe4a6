// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `status.volumeSnapshotStatuses` on VirtualMachines: which of a VM's
//! volumes could be snapshotted right now, and why not for the rest.

use slog::{debug, Logger};
use snapshot_api_types::virt::{VirtualMachine, VmVolumeSnapshotStatus, Volume};
use thiserror::Error;

use super::SnapshotController;
use crate::informer::{key, object_key};
use crate::Error;

/// Why a volume's storage class could not be determined.
#[derive(Error, Debug, PartialEq, Eq)]
enum StorageClassError {
    #[error("PVC not found")]
    PvcNotFound,

    #[error("DV '{0}' not found")]
    DataVolumeNotFound(String),

    #[error("PVC for the DataVolume `{0}` not found")]
    DataVolumePvcNotFound(String),

    #[error("Volume type has no StorageClass defined")]
    NoStorageClass,
}

impl SnapshotController {
    /// Recomputes the volume snapshot statuses of `vm`, writing them if they
    /// changed.
    pub(super) async fn update_volume_snapshot_statuses(
        &self,
        vm: &VirtualMachine,
    ) -> Result<(), Error> {
        let log = self.log.new(slog::o!("vm" => object_key(vm)));
        let namespace = vm.metadata.namespace.as_deref().unwrap_or_default();

        let statuses: Vec<_> = vm
            .volumes()
            .iter()
            .map(|volume| self.volume_snapshot_status(namespace, volume, &log))
            .collect();

        if statuses != vm.status.volume_snapshot_statuses {
            debug!(log, "updating volume snapshot statuses");
            let mut updated = vm.clone();
            updated.status.volume_snapshot_statuses = statuses;
            self.ctx.client.update_vm_status(&updated).await?;
        }
        Ok(())
    }

    fn volume_snapshot_status(
        &self,
        namespace: &str,
        volume: &Volume,
        log: &Logger,
    ) -> VmVolumeSnapshotStatus {
        let disabled = |reason: String| VmVolumeSnapshotStatus {
            name: volume.name.clone(),
            enabled: false,
            reason: Some(reason),
        };

        let sc = match self.volume_storage_class(namespace, volume) {
            Ok(sc) => sc,
            Err(e) => return disabled(e.to_string()),
        };

        match self.get_volume_snapshot_class(&sc, log) {
            Ok(Some(_)) => VmVolumeSnapshotStatus {
                name: volume.name.clone(),
                enabled: true,
                reason: None,
            },
            Ok(None) => disabled(format!(
                "No VolumeSnapshotClass: Volume snapshots are not configured for this StorageClass [{sc}] [{}]",
                volume.name
            )),
            Err(e) => disabled(e.to_string()),
        }
    }

    fn volume_storage_class(
        &self,
        namespace: &str,
        volume: &Volume,
    ) -> Result<String, StorageClassError> {
        if let Some(claim) = &volume.persistent_volume_claim {
            let pvc = self
                .ctx
                .informers
                .pvc
                .get_namespaced(namespace, &claim.claim_name)
                .ok_or(StorageClassError::PvcNotFound)?;
            return Ok(pvc
                .spec
                .and_then(|s| s.storage_class_name)
                .unwrap_or_default());
        }

        if let Some(dv) = &volume.data_volume {
            return self.data_volume_storage_class(namespace, &dv.name);
        }

        Err(StorageClassError::NoStorageClass)
    }

    /// The storage class of DataVolume `name`: from its own spec, else from
    /// the template of the VM that owns it, else from the PVC it populated.
    fn data_volume_storage_class(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<String, StorageClassError> {
        let dv_key = key(Some(namespace), name);
        let dv = self
            .ctx
            .informers
            .data_volume
            .get(&dv_key)
            .ok_or(StorageClassError::DataVolumeNotFound(dv_key))?;

        if let Some(sc) = dv.spec.storage_class_name() {
            return Ok(sc.to_string());
        }

        let owners = dv.metadata.owner_references.iter().flatten();
        for owner in owners.filter(|o| o.kind == "VirtualMachine") {
            let Some(vm) = self.ctx.informers.vm.get_namespaced(namespace, &owner.name)
            else {
                continue;
            };
            let from_template = vm
                .spec
                .data_volume_templates
                .iter()
                .find(|t| t.name() == name)
                .and_then(|t| t.spec.storage_class_name());
            if let Some(sc) = from_template {
                return Ok(sc.to_string());
            }
        }

        let pvc = self
            .ctx
            .informers
            .pvc
            .get_namespaced(namespace, name)
            .ok_or_else(|| StorageClassError::DataVolumePvcNotFound(name.to_string()))?;
        Ok(pvc.spec.and_then(|s| s.storage_class_name).unwrap_or_default())
    }
}
