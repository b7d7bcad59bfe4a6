// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Writes to the cluster.
//!
//! Every update carries the resourceVersion of the object it was derived
//! from, and implementations must reject it with [`ClientError::Conflict`]
//! if the stored object has moved on. The controllers depend on that
//! compare-and-swap for the VM lock protocol.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use snapshot_api_types::csi::VolumeSnapshot;
use snapshot_api_types::snapshot::{
    VirtualMachineRestore, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent,
};
use snapshot_api_types::virt::VirtualMachine;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    /// The object was modified since it was read.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Api(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClientError::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_))
    }
}

/// Namespaced writes performed by the controllers. The namespace of each
/// object is taken from its metadata.
#[async_trait]
pub trait Client: Send + Sync {
    /// Updates the metadata and spec of a VM. Any status carried by `vm` is
    /// ignored.
    async fn update_vm(
        &self,
        vm: &VirtualMachine,
    ) -> Result<VirtualMachine, ClientError>;

    /// Updates only the status of a VM.
    async fn update_vm_status(
        &self,
        vm: &VirtualMachine,
    ) -> Result<VirtualMachine, ClientError>;

    async fn create_vm(
        &self,
        vm: &VirtualMachine,
    ) -> Result<VirtualMachine, ClientError>;

    async fn update_vm_snapshot(
        &self,
        snapshot: &VirtualMachineSnapshot,
    ) -> Result<VirtualMachineSnapshot, ClientError>;

    async fn create_vm_snapshot_content(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<VirtualMachineSnapshotContent, ClientError>;

    async fn update_vm_snapshot_content(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<VirtualMachineSnapshotContent, ClientError>;

    async fn delete_vm_snapshot_content(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError>;

    async fn update_vm_restore(
        &self,
        restore: &VirtualMachineRestore,
    ) -> Result<VirtualMachineRestore, ClientError>;

    async fn create_pvc(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, ClientError>;

    async fn update_pvc(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, ClientError>;

    async fn create_volume_snapshot(
        &self,
        snapshot: &VolumeSnapshot,
    ) -> Result<VolumeSnapshot, ClientError>;

    async fn delete_data_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError>;

    /// Asks the guest agent of a running VMI to freeze its filesystems.
    async fn freeze_vmi(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError>;

    async fn unfreeze_vmi(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError>;
}
