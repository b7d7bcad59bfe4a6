// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconcilers for KubeVirt VM snapshots and restores.
//!
//! Two controllers live here. The [`snapshot::SnapshotController`] drives
//! VirtualMachineSnapshot and VirtualMachineSnapshotContent objects: it locks
//! the source VM, captures its spec and PVC manifests into a content object,
//! and asks the CSI snapshotter for one VolumeSnapshot per volume. The
//! [`restore::RestoreController`] drives VirtualMachineRestore objects: it
//! creates PVCs from those VolumeSnapshots and rewrites the target VM to use
//! them.
//!
//! Neither controller talks to the API server directly. They read from
//! [`informer`] caches fed by someone else's watches and write through the
//! [`client::Client`] trait, which keeps everything here testable against an
//! in-memory cluster.

use std::sync::Arc;

pub mod client;
pub mod clock;
pub mod conditions;
pub mod dynamic_informer;
pub mod error;
pub mod events;
pub mod informer;
pub mod restore;
pub mod snapshot;
pub mod source;
pub mod target;
pub mod worker;
pub mod workqueue;

#[cfg(test)]
mod testutil;

pub use error::Error;

/// The collaborators shared by both controllers.
#[derive(Clone)]
pub struct Context {
    pub client: Arc<dyn client::Client>,
    pub informers: Arc<informer::Informers>,
    pub recorder: Arc<dyn events::EventRecorder>,
    pub clock: Arc<dyn clock::Clock>,
}
