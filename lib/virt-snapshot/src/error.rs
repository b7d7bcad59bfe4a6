// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use snapshot_api_types::units::UnitError;
use snapshot_api_types::virt::RunStrategyConflict;
use thiserror::Error;

use crate::client::ClientError;

/// Errors from a reconcile pass. The `Display` text of several variants is
/// written into object conditions and events, so it is user visible.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown source {0}")]
    UnknownSource(String),

    #[error("unknown target {0}")]
    UnknownTarget(String),

    #[error("unexpected CRD {0}")]
    UnexpectedCrd(String),

    #[error("{count} matching VolumeSnapshotClasses for {storage_class}")]
    AmbiguousVolumeSnapshotClass { count: usize, storage_class: String },

    #[error("{namespace}/{pvc} VolumeSnapshot requested but no storage class")]
    NoStorageClass { namespace: String, pvc: String },

    #[error("VirtualMachineSnapshotName is not initialized in vm snapshot content")]
    NoSnapshotName,

    #[error("VMSnapshot {0} does not exist")]
    SnapshotNotFound(String),

    #[error("VMSnapshot {0} not ready")]
    SnapshotNotReady(String),

    #[error("no snapshot content name in {0}")]
    NoContentName(String),

    #[error("VMSnapshotContent {0} does not exist")]
    ContentNotFound(String),

    #[error("VMSnapshotContent {0} not ready")]
    ContentNotReady(String),

    #[error("VMSnapshot source and restore target differ")]
    SourceTargetMismatch,

    #[error("VolumeSnapshotName missing for volume {0}")]
    VolumeSnapshotNameMissing(String),

    #[error("volume backup for volume {0} not found")]
    VolumeBackupNotFound(String),

    #[error("missing VolumeSnapshot {0}")]
    MissingVolumeSnapshot(String),

    #[error("StorageClass {0} does not exist")]
    StorageClassNotFound(String),

    #[error("PVC {namespace}/{name} in status {phase:?}")]
    PvcPhase { namespace: String, name: String, phase: String },

    #[error("pvc {namespace}/{name} does not exist and should")]
    RestorePvcMissing { namespace: String, name: String },

    #[error("invalid RunStrategy {0:?}")]
    InvalidRunStrategy(String),

    #[error("vm restore {0} in progress")]
    RestoreInProgress(String),

    #[error("unexpected snapshot source")]
    UnexpectedSnapshotSource,

    #[error(transparent)]
    RunStrategy(#[from] RunStrategyConflict),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Unit(#[from] UnitError),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Client(e) if e.is_not_found())
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Client(e) if e.is_already_exists())
    }
}
