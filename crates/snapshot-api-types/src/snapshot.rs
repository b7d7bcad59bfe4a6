// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! KubeVirt snapshot types (`snapshot.kubevirt.io/v1alpha1`).

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaimSpec, TypedLocalObjectReference,
};
use k8s_openapi::NamespaceResourceScope;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::virt::VirtualMachine;
use crate::{impl_resource, ObjectMeta, Time};

pub const GROUP: &str = "snapshot.kubevirt.io";

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct VirtualMachineSnapshot {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: VirtualMachineSnapshotSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VirtualMachineSnapshotStatus>,
}

impl_resource!(
    VirtualMachineSnapshot,
    group: "snapshot.kubevirt.io",
    version: "v1alpha1",
    kind: "VirtualMachineSnapshot",
    plural: "virtualmachinesnapshots",
    scope: NamespaceResourceScope,
);

impl VirtualMachineSnapshot {
    pub fn ready(&self) -> bool {
        self.status.as_ref().and_then(|s| s.ready_to_use) == Some(true)
    }

    pub fn error(&self) -> Option<&SnapshotError> {
        self.status.as_ref().and_then(|s| s.error.as_ref())
    }

    /// A snapshot is progressing until it is either ready or failed.
    pub fn progressing(&self) -> bool {
        self.error().is_none() && !self.ready()
    }

    pub fn has_indication(&self, indication: Indication) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.indications.contains(&indication))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotSpec {
    pub source: TypedLocalObjectReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,

    /// How long a snapshot may stay in progress before it is failed, in Go
    /// duration syntax.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_deadline: Option<String>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum DeletionPolicy {
    Delete,
    Retain,
}

/// Facts recorded about how a snapshot was taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Indication {
    /// The VM was running while the snapshot was taken.
    Online,
    /// The guest agent was not involved, so filesystems were not frozen.
    NoGuestAgent,
    /// The guest agent froze guest filesystems for the snapshot.
    GuestAgent,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotStatus {
    #[serde(default, rename = "sourceUID", skip_serializing_if = "Option::is_none")]
    pub source_uid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine_snapshot_content_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indications: Vec<Indication>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SnapshotError>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct SnapshotError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ConditionType {
    Progressing,
    Ready,
    Failure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct VirtualMachineSnapshotContent {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: VirtualMachineSnapshotContentSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VirtualMachineSnapshotContentStatus>,
}

impl_resource!(
    VirtualMachineSnapshotContent,
    group: "snapshot.kubevirt.io",
    version: "v1alpha1",
    kind: "VirtualMachineSnapshotContent",
    plural: "virtualmachinesnapshotcontents",
    scope: NamespaceResourceScope,
);

impl VirtualMachineSnapshotContent {
    pub fn ready(&self) -> bool {
        self.status.as_ref().and_then(|s| s.ready_to_use) == Some(true)
    }

    pub fn in_error(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.error.is_some())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotContentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine_snapshot_name: Option<String>,

    #[serde(default)]
    pub source: SourceSpec,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_backups: Vec<VolumeBackup>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine: Option<VirtualMachine>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBackup {
    pub volume_name: String,

    pub persistent_volume_claim: PersistentVolumeClaimManifest,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_name: Option<String>,
}

/// The metadata and spec of a PVC as captured at snapshot time.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct PersistentVolumeClaimManifest {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PersistentVolumeClaimSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotContentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SnapshotError>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_snapshot_status: Vec<VolumeSnapshotStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    pub volume_snapshot_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SnapshotError>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct VirtualMachineRestore {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: VirtualMachineRestoreSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VirtualMachineRestoreStatus>,
}

impl_resource!(
    VirtualMachineRestore,
    group: "snapshot.kubevirt.io",
    version: "v1alpha1",
    kind: "VirtualMachineRestore",
    plural: "virtualmachinerestores",
    scope: NamespaceResourceScope,
);

impl VirtualMachineRestore {
    /// A restore is progressing until it is marked complete.
    pub fn progressing(&self) -> bool {
        self.status.as_ref().and_then(|s| s.complete) != Some(true)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineRestoreSpec {
    pub target: TypedLocalObjectReference,

    pub virtual_machine_snapshot_name: String,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineRestoreStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restores: Vec<VolumeRestore>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_data_volumes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRestore {
    pub volume_name: String,

    pub persistent_volume_claim_name: String,

    pub volume_snapshot_name: String,

    /// Set once the restored PVC has been handed to a new DataVolume. Never
    /// changes afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume_name: Option<String>,
}
