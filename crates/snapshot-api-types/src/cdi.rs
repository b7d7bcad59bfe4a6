// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Containerized Data Importer types (`cdi.kubevirt.io/v1beta1`).

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
use k8s_openapi::NamespaceResourceScope;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{impl_resource, ObjectMeta};

/// Annotation on a PVC naming the DataVolume that should adopt it instead of
/// provisioning a new claim.
pub const POPULATED_FOR_ANNOTATION: &str = "cdi.kubevirt.io/storage.populatedFor";

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct DataVolume {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DataVolumeSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

impl_resource!(
    DataVolume,
    group: "cdi.kubevirt.io",
    version: "v1beta1",
    kind: "DataVolume",
    plural: "datavolumes",
    scope: NamespaceResourceScope,
);

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct DataVolumeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<PersistentVolumeClaimSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl DataVolumeSpec {
    /// The storage class requested by the spec, if any. An empty name counts
    /// as unset.
    pub fn storage_class_name(&self) -> Option<&str> {
        let from_pvc =
            self.pvc.as_ref().and_then(|p| p.storage_class_name.as_deref());
        let from_storage =
            self.storage.as_ref().and_then(|s| s.storage_class_name.as_deref());
        from_pvc.or(from_storage).filter(|name| !name.is_empty())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}
