// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! KubeVirt core types (`kubevirt.io/v1`).

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::NamespaceResourceScope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cdi::DataVolumeSpec;
use crate::{impl_resource, ObjectMeta};

/// Name of the VMI condition reported when the guest agent is connected.
pub const AGENT_CONNECTED_CONDITION: &str = "AgentConnected";

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct VirtualMachine {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VirtualMachineSpec,
    #[serde(default)]
    pub status: VirtualMachineStatus,
}

impl_resource!(
    VirtualMachine,
    group: "kubevirt.io",
    version: "v1",
    kind: "VirtualMachine",
    plural: "virtualmachines",
    scope: NamespaceResourceScope,
);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Running and RunStrategy are mutually exclusive")]
pub struct RunStrategyConflict;

impl VirtualMachine {
    /// Resolves the effective run strategy of the VM.
    ///
    /// `spec.running` and `spec.runStrategy` may not both be set. With
    /// neither set the VM is halted.
    pub fn run_strategy(&self) -> Result<RunStrategy, RunStrategyConflict> {
        match (self.spec.running, &self.spec.run_strategy) {
            (Some(_), Some(_)) => Err(RunStrategyConflict),
            (Some(true), None) => Ok(RunStrategy::Always),
            (Some(false), None) | (None, None) => Ok(RunStrategy::Halted),
            (None, Some(rs)) => Ok(rs.clone()),
        }
    }

    /// The volumes of the VM's instance template.
    pub fn volumes(&self) -> &[Volume] {
        self.spec
            .template
            .as_ref()
            .map(|t| t.spec.volumes.as_slice())
            .unwrap_or_default()
    }

    /// Maps volume name to the name of the PVC backing it, for every volume
    /// backed by a PVC or a DataVolume. A DataVolume's PVC shares its name.
    pub fn persistent_volume_claims(&self) -> BTreeMap<String, String> {
        self.volumes()
            .iter()
            .filter_map(|v| Some((v.name.clone(), v.claim_name()?.to_string())))
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_strategy: Option<RunStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<VirtualMachineInstanceTemplateSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_volume_templates: Vec<DataVolumeTemplateSpec>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// The policy deciding whether and when a VM's instance should run.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum RunStrategy {
    Always,
    RerunOnFailure,
    Manual,
    Halted,
    Once,
    WaitAsReceiver,
    Other(String),
}

impl RunStrategy {
    pub fn as_str(&self) -> &str {
        match self {
            RunStrategy::Always => "Always",
            RunStrategy::RerunOnFailure => "RerunOnFailure",
            RunStrategy::Manual => "Manual",
            RunStrategy::Halted => "Halted",
            RunStrategy::Once => "Once",
            RunStrategy::WaitAsReceiver => "WaitAsReceiver",
            RunStrategy::Other(s) => s,
        }
    }
}

impl From<String> for RunStrategy {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Always" => RunStrategy::Always,
            "RerunOnFailure" => RunStrategy::RerunOnFailure,
            "Manual" => RunStrategy::Manual,
            "Halted" => RunStrategy::Halted,
            "Once" => RunStrategy::Once,
            "WaitAsReceiver" => RunStrategy::WaitAsReceiver,
            _ => RunStrategy::Other(value),
        }
    }
}

impl From<RunStrategy> for String {
    fn from(value: RunStrategy) -> Self {
        match value {
            RunStrategy::Other(s) => s,
            rs => rs.as_str().to_string(),
        }
    }
}

impl fmt::Display for RunStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct VirtualMachineInstanceTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,
    #[serde(default)]
    pub spec: VirtualMachineInstanceSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct VirtualMachineInstanceSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl VirtualMachineInstanceSpec {
    /// Clears `domain.firmware.uuid` so a VM created from this spec gets a
    /// fresh identity.
    pub fn strip_firmware_uuid(&mut self) {
        if let Some(firmware) = self
            .other
            .get_mut("domain")
            .and_then(|d| d.get_mut("firmware"))
            .and_then(Value::as_object_mut)
        {
            firmware.remove("uuid");
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimVolumeSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<DataVolumeSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_dump: Option<Value>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl Volume {
    /// A volume backed by the named PVC.
    pub fn from_claim(name: &str, claim_name: &str) -> Volume {
        Volume {
            name: name.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// The name of the PVC backing this volume, if it is PVC or DataVolume
    /// backed.
    pub fn claim_name(&self) -> Option<&str> {
        if let Some(pvc) = &self.persistent_volume_claim {
            Some(&pvc.claim_name)
        } else {
            self.data_volume.as_ref().map(|dv| dv.name.as_str())
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimVolumeSource {
    pub claim_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct DataVolumeSource {
    pub name: String,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct DataVolumeTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DataVolumeSpec,
}

impl DataVolumeTemplateSpec {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Name of the VirtualMachineSnapshot holding the snapshot lock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_in_progress: Option<String>,

    /// Name of the VirtualMachineRestore holding the restore lock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_in_progress: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_dump_request: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_snapshot_statuses: Vec<VmVolumeSnapshotStatus>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// Whether a single VM volume can be snapshotted, and if not, why.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct VmVolumeSnapshotStatus {
    pub name: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct VirtualMachineInstance {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub status: VirtualMachineInstanceStatus,
}

impl_resource!(
    VirtualMachineInstance,
    group: "kubevirt.io",
    version: "v1",
    kind: "VirtualMachineInstance",
    plural: "virtualmachineinstances",
    scope: NamespaceResourceScope,
);

impl VirtualMachineInstance {
    /// True if the VMI reports a condition of type `condition` with status
    /// `True`.
    pub fn has_condition(&self, condition: &str) -> bool {
        self.status
            .conditions
            .iter()
            .any(|c| c.type_ == condition && c.status == "True")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct VirtualMachineInstanceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<VirtualMachineInstanceCondition>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct VirtualMachineInstanceCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}
