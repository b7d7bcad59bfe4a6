// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kubernetes events emitted by the controllers. The reason strings are
//! matched on by users and tooling and must not change.

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::{Metadata, Resource};
use snapshot_api_types::ObjectMeta;

pub const VM_SNAPSHOT_CONTENT_CREATE_EVENT: &str =
    "SuccessfulVirtualMachineSnapshotContentCreate";
pub const VOLUME_SNAPSHOT_CREATE_EVENT: &str = "SuccessfulVolumeSnapshotCreate";
pub const VOLUME_SNAPSHOT_MISSING_EVENT: &str = "VolumeSnapshotMissing";
pub const RESTORE_COMPLETE_EVENT: &str = "VirtualMachineRestoreComplete";
pub const RESTORE_ERROR_EVENT: &str = "VirtualMachineRestoreError";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Records events against objects. Recording must not block; delivery is
/// best effort.
pub trait EventRecorder: Send + Sync {
    fn event(
        &self,
        object: ObjectReference,
        event_type: EventType,
        reason: &'static str,
        message: String,
    );
}

/// A reference to `obj` suitable for an event's `involvedObject`.
pub fn object_reference<K>(obj: &K) -> ObjectReference
where
    K: Resource + Metadata<Ty = ObjectMeta>,
{
    let meta = obj.metadata();
    ObjectReference {
        api_version: Some(K::API_VERSION.to_string()),
        kind: Some(K::KIND.to_string()),
        name: meta.name.clone(),
        namespace: meta.namespace.clone(),
        uid: meta.uid.clone(),
        resource_version: meta.resource_version.clone(),
        ..Default::default()
    }
}
