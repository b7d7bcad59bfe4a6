// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciling a single VirtualMachineSnapshot.
//!
//! Every pass makes at most one change and returns; the informer event that
//! change produces brings the snapshot back for the next step. A snapshot
//! moves through: status initialized, source locked, finalizer added,
//! content created, then status mirrored from the content until it is
//! ready or in error, at which point the source is unlocked again.

use std::time::Duration;

use slog::{debug, error, info, Logger};
use snapshot_api_types::snapshot::{
    ConditionStatus, DeletionPolicy, Indication, PersistentVolumeClaimManifest,
    SnapshotError, VirtualMachineSnapshot, VirtualMachineSnapshotContent,
    VirtualMachineSnapshotContentSpec, VirtualMachineSnapshotStatus,
    VolumeBackup,
};
use snapshot_api_types::units::parse_go_duration;
use snapshot_api_types::{add_finalizer, has_finalizer, remove_finalizer};
use snapshot_api_types::{ObjectMeta, Time};

use super::{
    content_name, volume_snapshot_name, SnapshotController,
    VM_SNAPSHOT_CONTENT_FINALIZER, VM_SNAPSHOT_FINALIZER,
};
use crate::conditions::{failure, progressing, ready, update_condition};
use crate::events::{object_reference, EventType, VM_SNAPSHOT_CONTENT_CREATE_EVENT};
use crate::informer::object_key;
use crate::source::SnapshotSource;
use crate::Error;

const DEADLINE_EXCEEDED: &str = "snapshot deadline exceeded";

fn status_mut(snapshot: &mut VirtualMachineSnapshot) -> &mut VirtualMachineSnapshotStatus {
    snapshot.status.get_or_insert_with(|| VirtualMachineSnapshotStatus {
        ready_to_use: Some(false),
        ..Default::default()
    })
}

/// Puts `snapshot` into the error state with `reason`.
fn set_error(snapshot: &mut VirtualMachineSnapshot, reason: &str, now: &Time) {
    let status = status_mut(snapshot);
    status.error = Some(SnapshotError {
        time: Some(now.clone()),
        message: Some(reason.to_string()),
    });
    update_condition(
        &mut status.conditions,
        progressing(ConditionStatus::False, reason, now),
        false,
    );
    update_condition(
        &mut status.conditions,
        ready(ConditionStatus::False, reason, now),
        false,
    );
}

/// The instant `snapshot` fails if it is still progressing, if it has a
/// failure deadline.
fn deadline(snapshot: &VirtualMachineSnapshot) -> Result<Option<Time>, Error> {
    let Some(spec) = snapshot.spec.failure_deadline.as_deref() else {
        return Ok(None);
    };
    let limit = parse_go_duration(spec)?;
    if limit.is_zero() {
        return Ok(None);
    }
    let Some(created) = &snapshot.metadata.creation_timestamp else {
        return Ok(None);
    };
    Ok(chrono::Duration::from_std(limit)
        .ok()
        .and_then(|limit| created.0.checked_add_signed(limit))
        .map(Time))
}

fn deadline_exceeded(snapshot: &VirtualMachineSnapshot, now: &Time) -> Result<bool, Error> {
    Ok(deadline(snapshot)?.is_some_and(|d| now.0 >= d.0))
}

impl SnapshotController {
    /// One reconcile pass over `snapshot`. Returns how long to wait before
    /// looking again when nothing else will trigger it.
    pub async fn update_vm_snapshot(
        &self,
        snapshot: VirtualMachineSnapshot,
    ) -> Result<Duration, Error> {
        let log = self.log.new(slog::o!("vmsnapshot" => object_key(&snapshot)));
        debug!(log, "updating VirtualMachineSnapshot");

        if snapshot.status.is_none() {
            return self.update_snapshot_status(&snapshot, None, &log).await;
        }

        let source = SnapshotSource::resolve(&self.ctx, &snapshot)?;

        // Release the source as soon as the work is done, deleted or not.
        if let Some(source) = source.as_ref().filter(|_| !snapshot.progressing()) {
            if source.unlock(&self.ctx).await? {
                return Ok(Duration::ZERO);
            }
        }

        if snapshot.metadata.deletion_timestamp.is_some() {
            self.cleanup_vm_snapshot(&snapshot, &log).await?;
            return Ok(Duration::ZERO);
        }

        let now = self.ctx.clock.now();
        let active = snapshot.progressing() && !deadline_exceeded(&snapshot, &now)?;
        if let Some(source) = source.as_ref().filter(|_| active) {
            if !source.locked() {
                let locked = source.lock(&self.ctx, &log).await?;
                debug!(log, "attempted to lock source"; "locked" => locked);
                return Ok(self.retry_interval);
            }

            if self.init_vm_snapshot(&snapshot, source, &log).await? {
                return Ok(Duration::ZERO);
            }

            if self.get_content(&snapshot).is_none() {
                self.create_content(&snapshot, source, &log).await?;
                return Ok(Duration::ZERO);
            }
        }

        self.update_snapshot_status(&snapshot, source.as_ref(), &log).await
    }

    /// Adds the snapshot finalizer, recording whether the source is being
    /// snapshotted while running. Returns whether anything was written.
    async fn init_vm_snapshot(
        &self,
        snapshot: &VirtualMachineSnapshot,
        source: &SnapshotSource,
        log: &Logger,
    ) -> Result<bool, Error> {
        if has_finalizer(&snapshot.metadata, VM_SNAPSHOT_FINALIZER) {
            return Ok(false);
        }

        let mut updated = snapshot.clone();
        add_finalizer(&mut updated.metadata, VM_SNAPSHOT_FINALIZER);
        if source.online(&self.ctx)? {
            debug!(log, "source is online, marking snapshot indications");
            let status = status_mut(&mut updated);
            status.indications.push(Indication::Online);
            status.indications.push(Indication::NoGuestAgent);
        }

        self.ctx.client.update_vm_snapshot(&updated).await?;
        Ok(true)
    }

    async fn cleanup_vm_snapshot(
        &self,
        snapshot: &VirtualMachineSnapshot,
        log: &Logger,
    ) -> Result<(), Error> {
        // A snapshot deleted mid-flight is first moved into the error state
        // so that the source gets unlocked before anything is torn down.
        if snapshot.progressing() {
            self.update_snapshot_status(snapshot, None, log).await?;
            return Ok(());
        }

        if let Some(content) = self.get_content(snapshot) {
            let namespace = content.metadata.namespace.as_deref().unwrap_or_default();
            let name = content.metadata.name.as_deref().unwrap_or_default();

            if has_finalizer(&content.metadata, VM_SNAPSHOT_CONTENT_FINALIZER) {
                let mut updated = content.clone();
                remove_finalizer(&mut updated.metadata, VM_SNAPSHOT_CONTENT_FINALIZER);
                self.ctx.client.update_vm_snapshot_content(&updated).await?;
            }

            if snapshot.spec.deletion_policy == Some(DeletionPolicy::Retain) {
                info!(log, "retaining vmsnapshotcontent"; "content" => name);
            } else {
                info!(log, "deleting vmsnapshotcontent"; "content" => name);
                match self.ctx.client.delete_vm_snapshot_content(namespace, name).await {
                    Err(e) if !e.is_not_found() => return Err(e.into()),
                    _ => {}
                }
            }
        }

        if has_finalizer(&snapshot.metadata, VM_SNAPSHOT_FINALIZER) {
            let mut updated = snapshot.clone();
            remove_finalizer(&mut updated.metadata, VM_SNAPSHOT_FINALIZER);
            self.ctx.client.update_vm_snapshot(&updated).await?;
        }

        Ok(())
    }

    /// Creates the content object, capturing the source spec and one volume
    /// backup per snapshottable PVC.
    async fn create_content(
        &self,
        snapshot: &VirtualMachineSnapshot,
        source: &SnapshotSource,
        log: &Logger,
    ) -> Result<(), Error> {
        let namespace = snapshot.metadata.namespace.as_deref().unwrap_or_default();

        let mut volume_backups = Vec::new();
        for (volume_name, pvc_name) in source.persistent_volume_claims() {
            let Some(pvc) = self.get_snapshot_pvc(namespace, &pvc_name, log)? else {
                info!(log, "volume will not be snapshotted";
                    "volume" => &volume_name, "pvc" => &pvc_name);
                continue;
            };

            volume_backups.push(VolumeBackup {
                volume_snapshot_name: Some(volume_snapshot_name(snapshot, &volume_name)),
                volume_name,
                persistent_volume_claim: PersistentVolumeClaimManifest {
                    metadata: pvc.metadata,
                    spec: pvc.spec.unwrap_or_default(),
                },
            });
        }

        let name = content_name(snapshot);
        let content = VirtualMachineSnapshotContent {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                finalizers: Some(vec![VM_SNAPSHOT_CONTENT_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: VirtualMachineSnapshotContentSpec {
                virtual_machine_snapshot_name: snapshot.metadata.name.clone(),
                source: source.spec(),
                volume_backups,
            },
            status: None,
        };

        match self.ctx.client.create_vm_snapshot_content(&content).await {
            Err(e) if !e.is_already_exists() => return Err(e.into()),
            _ => {}
        }

        info!(log, "created vmsnapshotcontent"; "content" => &name);
        self.ctx.recorder.event(
            object_reference(snapshot),
            EventType::Normal,
            VM_SNAPSHOT_CONTENT_CREATE_EVENT,
            format!("Successfully created VirtualMachineSnapshotContent {name}"),
        );
        Ok(())
    }

    /// Recomputes the snapshot's status and writes it if it changed.
    pub(super) async fn update_snapshot_status(
        &self,
        snapshot: &VirtualMachineSnapshot,
        source: Option<&SnapshotSource>,
        log: &Logger,
    ) -> Result<Duration, Error> {
        let now = self.ctx.clock.now();
        let mut updated = snapshot.clone();
        status_mut(&mut updated);

        if let Some(uid) = source.and_then(|s| s.uid()) {
            status_mut(&mut updated).source_uid = Some(uid.to_string());
        }

        if updated.metadata.deletion_timestamp.is_some() {
            if updated.progressing() {
                set_error(&mut updated, "Snapshot cancelled", &now);
            }
        } else if let Some(content) = self.get_content(snapshot) {
            if let Some(content_status) = &content.status {
                let status = status_mut(&mut updated);
                status.virtual_machine_snapshot_content_name = content.metadata.name.clone();
                status.creation_time = content_status.creation_time.clone();
                status.ready_to_use = content_status.ready_to_use;
                status.error = content_status.error.clone();

                // Thawing is idempotent and repeated on every ready pass.
                if updated.ready() {
                    if let Err(e) = self.unfreeze_guest_fs_if_needed(&updated, log).await {
                        let reason = "Failed unfreezing guest FS";
                        status_mut(&mut updated).ready_to_use = Some(false);
                        if let Err(update_err) =
                            self.update_vm_snapshot_error(updated, reason).await
                        {
                            error!(log, "failed to record error";
                                "reason" => reason, "error" => %update_err);
                        }
                        return Err(e);
                    }
                }
            }
        }

        let mut requeue_after = Duration::ZERO;
        if updated.progressing() && updated.metadata.deletion_timestamp.is_none() {
            if let Some(deadline) = deadline(&updated)? {
                if now.0 >= deadline.0 {
                    info!(log, "snapshot failure deadline exceeded");
                    let status = status_mut(&mut updated);
                    status.error = Some(SnapshotError {
                        time: Some(deadline.clone()),
                        message: Some(DEADLINE_EXCEEDED.to_string()),
                    });
                    update_condition(
                        &mut status.conditions,
                        failure(ConditionStatus::True, DEADLINE_EXCEEDED, &now),
                        false,
                    );
                } else {
                    requeue_after = (deadline.0 - now.0).to_std().unwrap_or_default();
                }
            }
        }

        let (progressing_cond, ready_cond) = if updated.progressing() {
            let resolved;
            let source = match source {
                Some(source) => Some(source),
                None => {
                    resolved = SnapshotSource::resolve(&self.ctx, snapshot)?;
                    resolved.as_ref()
                }
            };
            let progressing_cond = match source {
                Some(s) if s.locked() => progressing(
                    ConditionStatus::True,
                    "Source locked and operation in progress",
                    &now,
                ),
                Some(_) => progressing(ConditionStatus::False, "Source not locked", &now),
                None => progressing(ConditionStatus::False, "Source does not exist", &now),
            };
            (progressing_cond, ready(ConditionStatus::False, "Not ready", &now))
        } else if updated.error().is_some() {
            (
                progressing(ConditionStatus::False, "In error state", &now),
                ready(ConditionStatus::False, "Error", &now),
            )
        } else if updated.ready() {
            (
                progressing(ConditionStatus::False, "Operation complete", &now),
                ready(ConditionStatus::True, "Operation complete", &now),
            )
        } else {
            (
                progressing(ConditionStatus::Unknown, "Unknown state", &now),
                ready(ConditionStatus::Unknown, "Unknown state", &now),
            )
        };
        let status = status_mut(&mut updated);
        update_condition(&mut status.conditions, progressing_cond, false);
        update_condition(&mut status.conditions, ready_cond, false);

        if updated != *snapshot {
            self.ctx.client.update_vm_snapshot(&updated).await?;
        }

        Ok(requeue_after)
    }

    /// Writes `snapshot` back in the error state with `reason`.
    pub(super) async fn update_vm_snapshot_error(
        &self,
        mut snapshot: VirtualMachineSnapshot,
        reason: &str,
    ) -> Result<(), Error> {
        let now = self.ctx.clock.now();
        set_error(&mut snapshot, reason, &now);
        self.ctx.client.update_vm_snapshot(&snapshot).await?;
        Ok(())
    }

    /// Thaws the guest filesystems if they were frozen for this snapshot.
    async fn unfreeze_guest_fs_if_needed(
        &self,
        snapshot: &VirtualMachineSnapshot,
        log: &Logger,
    ) -> Result<(), Error> {
        if !snapshot.has_indication(Indication::GuestAgent) {
            return Ok(());
        }

        let namespace = snapshot.metadata.namespace.as_deref().unwrap_or_default();
        let vm = &snapshot.spec.source.name;
        info!(log, "unfreezing guest filesystems"; "vm" => vm);
        self.ctx.client.unfreeze_vmi(namespace, vm).await?;
        Ok(())
    }
}
