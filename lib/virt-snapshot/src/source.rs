// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Things a snapshot can be taken of, and the lock that keeps them still
//! while it happens.
//!
//! The lock is advisory and lives on the VM object itself:
//! `status.snapshotInProgress` names the holder and the
//! [`SOURCE_FINALIZER`] keeps the VM from being deleted underneath the
//! snapshot. Acquiring it takes two writes, observed through two separate
//! reconcile passes: first the status field, then the finalizer. Each write
//! is a compare-and-swap on the VM's resourceVersion, so two snapshots
//! racing for the same VM cannot both win.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Pod;
use slog::{debug, info, Logger};
use snapshot_api_types::snapshot::{SourceSpec, VirtualMachineSnapshot};
use snapshot_api_types::virt::{RunStrategy, VirtualMachine, VirtualMachineStatus};
use snapshot_api_types::{add_finalizer, has_finalizer, remove_finalizer};

use crate::informer::{key, object_key, Informer};
use crate::{Context, Error};

pub const SOURCE_FINALIZER: &str =
    "snapshot.kubevirt.io/snapshot-source-protection";

/// The snapshot lock as recorded on a VM.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockState {
    /// Name of the snapshot named in `status.snapshotInProgress`.
    pub holder: Option<String>,
    pub finalizer_present: bool,
}

impl LockState {
    pub fn of(vm: &VirtualMachine) -> Self {
        LockState {
            holder: vm.status.snapshot_in_progress.clone(),
            finalizer_present: has_finalizer(&vm.metadata, SOURCE_FINALIZER),
        }
    }

    /// Fully held by `snapshot`: both steps of the acquisition are visible.
    pub fn held_by(&self, snapshot: &str) -> bool {
        self.finalizer_present && self.holder.as_deref() == Some(snapshot)
    }

    /// Claimed by a snapshot other than `snapshot`.
    pub fn claimed_by_other(&self, snapshot: &str) -> bool {
        self.holder.as_deref().is_some_and(|h| h != snapshot)
    }
}

pub enum SnapshotSource {
    VirtualMachine(VmSnapshotSource),
}

pub struct VmSnapshotSource {
    vm: VirtualMachine,
    snapshot: String,
}

impl SnapshotSource {
    /// Resolves the source named by `snapshot`. A source that does not exist
    /// yields `None`.
    pub fn resolve(
        ctx: &Context,
        snapshot: &VirtualMachineSnapshot,
    ) -> Result<Option<SnapshotSource>, Error> {
        let source = &snapshot.spec.source;
        match source.kind.as_str() {
            "VirtualMachine" => {
                let namespace =
                    snapshot.metadata.namespace.as_deref().unwrap_or_default();
                let Some(vm) =
                    ctx.informers.vm.get_namespaced(namespace, &source.name)
                else {
                    return Ok(None);
                };
                Ok(Some(SnapshotSource::VirtualMachine(VmSnapshotSource {
                    vm,
                    snapshot: snapshot
                        .metadata
                        .name
                        .clone()
                        .unwrap_or_default(),
                })))
            }
            kind => Err(Error::UnknownSource(format!("{kind}/{}", source.name))),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        match self {
            SnapshotSource::VirtualMachine(s) => s.vm.metadata.uid.as_deref(),
        }
    }

    pub fn locked(&self) -> bool {
        match self {
            SnapshotSource::VirtualMachine(s) => s.locked(),
        }
    }

    /// Attempts to take the lock. `Ok(false)` means not yet: either the
    /// source is busy, or the first half of the acquisition was just written
    /// and the second half must wait for the resulting VM update.
    pub async fn lock(&self, ctx: &Context, log: &Logger) -> Result<bool, Error> {
        match self {
            SnapshotSource::VirtualMachine(s) => s.lock(ctx, log).await,
        }
    }

    /// Releases the lock if this snapshot holds it. Returns whether anything
    /// was written.
    pub async fn unlock(&self, ctx: &Context) -> Result<bool, Error> {
        match self {
            SnapshotSource::VirtualMachine(s) => s.unlock(ctx).await,
        }
    }

    /// The spec captured into the snapshot content.
    pub fn spec(&self) -> SourceSpec {
        match self {
            SnapshotSource::VirtualMachine(s) => s.spec(),
        }
    }

    /// Volume name to PVC name, for every PVC-backed volume.
    pub fn persistent_volume_claims(&self) -> BTreeMap<String, String> {
        match self {
            SnapshotSource::VirtualMachine(s) => s.vm.persistent_volume_claims(),
        }
    }

    /// Whether the source is running, so that the snapshot is taken online.
    pub fn online(&self, ctx: &Context) -> Result<bool, Error> {
        match self {
            SnapshotSource::VirtualMachine(s) => s.online(ctx),
        }
    }
}

impl VmSnapshotSource {
    fn locked(&self) -> bool {
        LockState::of(&self.vm).held_by(&self.snapshot)
    }

    fn online(&self, ctx: &Context) -> Result<bool, Error> {
        let running = self.vm.run_strategy()? != RunStrategy::Halted;
        Ok(running || ctx.informers.vmi.contains(&object_key(&self.vm)))
    }

    async fn lock(&self, ctx: &Context, log: &Logger) -> Result<bool, Error> {
        let state = LockState::of(&self.vm);
        if state.held_by(&self.snapshot) {
            return Ok(true);
        }

        let namespace = self.vm.metadata.namespace.as_deref().unwrap_or_default();
        if !self.online(ctx)? {
            let claims: BTreeSet<String> =
                self.vm.persistent_volume_claims().into_values().collect();
            let pods = pods_using_pvcs(&ctx.informers.pod, namespace, &claims);
            if !pods.is_empty() {
                debug!(log, "vm is offline but pods are using its PVCs";
                    "pods" => pods.len());
                return Ok(false);
            }
        }

        if state.claimed_by_other(&self.snapshot) {
            debug!(log, "another snapshot in progress";
                "holder" => state.holder.as_deref());
            return Ok(false);
        }

        let mut vm = self.vm.clone();
        if state.holder.is_none() {
            info!(log, "claiming snapshot lock on source vm");
            vm.status.snapshot_in_progress = Some(self.snapshot.clone());
            ctx.client.update_vm_status(&vm).await?;
            return Ok(false);
        }

        if !state.finalizer_present {
            info!(log, "adding snapshot source finalizer");
            add_finalizer(&mut vm.metadata, SOURCE_FINALIZER);
            ctx.client.update_vm(&vm).await?;
        }

        Ok(true)
    }

    async fn unlock(&self, ctx: &Context) -> Result<bool, Error> {
        if self.vm.status.snapshot_in_progress.as_deref() != Some(&self.snapshot) {
            return Ok(false);
        }

        let mut vm = self.vm.clone();
        if has_finalizer(&vm.metadata, SOURCE_FINALIZER) {
            remove_finalizer(&mut vm.metadata, SOURCE_FINALIZER);
            vm = ctx.client.update_vm(&vm).await?;
        }

        vm.status.snapshot_in_progress = None;
        ctx.client.update_vm_status(&vm).await?;
        Ok(true)
    }

    fn spec(&self) -> SourceSpec {
        let mut vm = self.vm.clone();
        vm.status = VirtualMachineStatus::default();
        SourceSpec { virtual_machine: Some(vm) }
    }
}

/// Pods in `namespace` that have not terminated and mount one of `claims`.
pub fn pods_using_pvcs(
    pods: &Informer<Pod>,
    namespace: &str,
    claims: &BTreeSet<String>,
) -> Vec<Pod> {
    pods.list()
        .into_iter()
        .filter(|pod| pod.metadata.namespace.as_deref() == Some(namespace))
        .filter(|pod| {
            let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
            !matches!(phase, Some("Succeeded") | Some("Failed"))
        })
        .filter(|pod| {
            pod.spec
                .as_ref()
                .and_then(|spec| spec.volumes.as_ref())
                .is_some_and(|volumes| {
                    volumes.iter().any(|v| {
                        v.persistent_volume_claim
                            .as_ref()
                            .is_some_and(|c| claims.contains(&c.claim_name))
                    })
                })
        })
        .collect()
}

/// Key of the VM a snapshot's source refers to.
pub fn source_vm_key(snapshot: &VirtualMachineSnapshot) -> String {
    key(snapshot.metadata.namespace.as_deref(), &snapshot.spec.source.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fixtures, FakeCluster};

    async fn lock_once(
        cluster: &FakeCluster,
        snapshot: &VirtualMachineSnapshot,
    ) -> bool {
        let ctx = cluster.context();
        let source = SnapshotSource::resolve(&ctx, snapshot).unwrap().unwrap();
        source.lock(&ctx, &cluster.log).await.unwrap()
    }

    #[test]
    fn lock_state_requires_both_halves() {
        let mut vm = fixtures::vm("ns", "vm");
        assert!(!LockState::of(&vm).held_by("snap"));

        vm.status.snapshot_in_progress = Some("snap".into());
        assert!(!LockState::of(&vm).held_by("snap"));
        assert!(LockState::of(&vm).claimed_by_other("other"));

        add_finalizer(&mut vm.metadata, SOURCE_FINALIZER);
        assert!(LockState::of(&vm).held_by("snap"));
        assert!(!LockState::of(&vm).held_by("other"));
    }

    #[tokio::test]
    async fn lock_takes_two_writes() {
        let cluster = FakeCluster::new();
        cluster.add_vm(fixtures::vm("ns", "vm"));
        let snapshot = fixtures::snapshot("ns", "snap", "vm");

        // First pass only claims the status field.
        assert!(!lock_once(&cluster, &snapshot).await);
        let vm = cluster.vm("ns", "vm");
        assert_eq!(vm.status.snapshot_in_progress.as_deref(), Some("snap"));
        assert!(!has_finalizer(&vm.metadata, SOURCE_FINALIZER));

        // Second pass adds the finalizer and reports the lock held.
        assert!(lock_once(&cluster, &snapshot).await);
        let vm = cluster.vm("ns", "vm");
        assert!(LockState::of(&vm).held_by("snap"));
        assert_eq!(cluster.writes(), vec!["update_vm_status ns/vm", "update_vm ns/vm"]);

        // Further passes write nothing.
        assert!(lock_once(&cluster, &snapshot).await);
        assert_eq!(cluster.writes().len(), 2);
    }

    #[tokio::test]
    async fn second_snapshot_cannot_take_a_held_lock() {
        let cluster = FakeCluster::new();
        cluster.add_vm(fixtures::vm("ns", "vm"));
        let first = fixtures::snapshot("ns", "first", "vm");
        let second = fixtures::snapshot("ns", "second", "vm");

        assert!(!lock_once(&cluster, &first).await);
        assert!(!lock_once(&cluster, &second).await);
        assert!(lock_once(&cluster, &first).await);
        assert!(!lock_once(&cluster, &second).await);

        let vm = cluster.vm("ns", "vm");
        assert_eq!(vm.status.snapshot_in_progress.as_deref(), Some("first"));
        assert_eq!(cluster.writes().len(), 2);
    }

    #[tokio::test]
    async fn stale_read_loses_the_race() {
        let cluster = FakeCluster::new();
        cluster.add_vm(fixtures::vm("ns", "vm"));
        let ctx = cluster.context();

        // Both snapshots resolve the VM before either writes.
        let first = SnapshotSource::resolve(&ctx, &fixtures::snapshot("ns", "first", "vm"))
            .unwrap()
            .unwrap();
        let second = SnapshotSource::resolve(&ctx, &fixtures::snapshot("ns", "second", "vm"))
            .unwrap()
            .unwrap();

        assert!(!first.lock(&ctx, &cluster.log).await.unwrap());
        let err = second.lock(&ctx, &cluster.log).await.unwrap_err();
        assert!(matches!(err, Error::Client(ref e) if e.is_conflict()));
        assert_eq!(
            cluster.vm("ns", "vm").status.snapshot_in_progress.as_deref(),
            Some("first")
        );
    }

    #[tokio::test]
    async fn offline_vm_with_attached_pod_is_not_locked() {
        let cluster = FakeCluster::new();
        cluster.add_vm(fixtures::vm_with_data_volume("ns", "vm", "disk1", "alpine-dv"));
        cluster.add_pod(fixtures::pod_using_claim("ns", "launcher", "alpine-dv", "Running"));

        let snapshot = fixtures::snapshot("ns", "snap", "vm");
        assert!(!lock_once(&cluster, &snapshot).await);
        assert!(cluster.writes().is_empty());

        // A finished pod does not hold the claim.
        cluster.add_pod(fixtures::pod_using_claim("ns", "launcher", "alpine-dv", "Succeeded"));
        assert!(!lock_once(&cluster, &snapshot).await);
        assert_eq!(cluster.writes(), vec!["update_vm_status ns/vm"]);
    }

    #[tokio::test]
    async fn unlock_restores_the_pre_lock_state() {
        let cluster = FakeCluster::new();
        let original = fixtures::vm("ns", "vm");
        cluster.add_vm(original.clone());
        let snapshot = fixtures::snapshot("ns", "snap", "vm");
        lock_once(&cluster, &snapshot).await;
        assert!(lock_once(&cluster, &snapshot).await);

        let ctx = cluster.context();
        let source = SnapshotSource::resolve(&ctx, &snapshot).unwrap().unwrap();
        assert!(source.unlock(&ctx).await.unwrap());

        let vm = cluster.vm("ns", "vm");
        assert_eq!(LockState::of(&vm), LockState::default());
        assert_eq!(vm.metadata.finalizers, original.metadata.finalizers);
        assert_eq!(vm.status, original.status);

        // Nothing left to release.
        let source = SnapshotSource::resolve(&ctx, &snapshot).unwrap().unwrap();
        assert!(!source.unlock(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn unlock_ignores_other_holders() {
        let cluster = FakeCluster::new();
        let mut vm = fixtures::vm("ns", "vm");
        vm.status.snapshot_in_progress = Some("other".into());
        add_finalizer(&mut vm.metadata, SOURCE_FINALIZER);
        cluster.add_vm(vm);

        let ctx = cluster.context();
        let snapshot = fixtures::snapshot("ns", "snap", "vm");
        let source = SnapshotSource::resolve(&ctx, &snapshot).unwrap().unwrap();
        assert!(!source.unlock(&ctx).await.unwrap());
        assert!(cluster.writes().is_empty());
    }

    #[test]
    fn unknown_source_kinds_are_errors() {
        let cluster = FakeCluster::new();
        let mut snapshot = fixtures::snapshot("ns", "snap", "vm");
        snapshot.spec.source.kind = "Pod".into();
        let err = SnapshotSource::resolve(&cluster.context(), &snapshot).err().unwrap();
        assert_eq!(err.to_string(), "unknown source Pod/vm");
    }
}
