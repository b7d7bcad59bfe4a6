// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory cluster for exercising the controllers.
//!
//! Writes go through [`FakeApi`], which enforces resourceVersion
//! compare-and-swap the way the API server does and then reflects the
//! result into the informers, so a reconcile pass sees its own writes on
//! the next pass just as it would against a real cluster.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolumeClaim};
use k8s_openapi::Metadata;
use slog::Logger;
use snapshot_api_types::cdi::DataVolume;
use snapshot_api_types::csi::{VolumeSnapshot, VolumeSnapshotClass};
use snapshot_api_types::snapshot::{
    VirtualMachineRestore, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent,
};
use snapshot_api_types::virt::{VirtualMachine, VirtualMachineInstance};
use snapshot_api_types::{ObjectMeta, Time};
use tokio_util::sync::CancellationToken;

use crate::client::{Client, ClientError};
use crate::clock::{Clock, FixedClock};
use crate::dynamic_informer::{
    DynamicInformers, Lookup, WatchStarter, VOLUME_SNAPSHOT_CLASS_CRD,
    VOLUME_SNAPSHOT_CRD,
};
use crate::events::{EventRecorder, EventType};
use crate::informer::{object_key, Informer, Informers};
use crate::Context;

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

/// A watch that completes its initial list immediately and then never
/// delivers anything; tests feed the informer by hand.
pub struct ManualWatch<K> {
    starts: AtomicUsize,
    tokens: Mutex<Vec<CancellationToken>>,
    initial: Mutex<Vec<K>>,
}

impl<K> Default for ManualWatch<K> {
    fn default() -> Self {
        ManualWatch {
            starts: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
            initial: Mutex::new(Vec::new()),
        }
    }
}

impl<K: Clone> ManualWatch<K> {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn last_token(&self) -> Option<CancellationToken> {
        self.tokens.lock().unwrap().last().cloned()
    }

    /// Objects handed to the informer by the next start.
    pub fn set_initial(&self, objs: Vec<K>) {
        *self.initial.lock().unwrap() = objs;
    }
}

impl<K> WatchStarter<K> for ManualWatch<K>
where
    K: Metadata<Ty = ObjectMeta> + Clone + Send + Sync + 'static,
{
    fn start(&self, informer: Arc<Informer<K>>, cancel: CancellationToken) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(cancel);
        informer.replace(self.initial.lock().unwrap().clone());
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub object: ObjectReference,
    pub event_type: EventType,
    pub reason: &'static str,
    pub message: String,
}

#[derive(Default)]
pub struct FakeRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl FakeRecorder {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<&'static str> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

impl EventRecorder for FakeRecorder {
    fn event(
        &self,
        object: ObjectReference,
        event_type: EventType,
        reason: &'static str,
        message: String,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            object,
            event_type,
            reason,
            message,
        });
    }
}

/// The write side of the fake cluster.
pub struct FakeApi {
    informers: Arc<Informers>,
    dynamic: Arc<DynamicInformers>,
    clock: Arc<FixedClock>,
    version: AtomicU64,
    writes: Mutex<Vec<String>>,
    pub fail_freeze: AtomicBool,
    pub fail_unfreeze: AtomicBool,
}

impl FakeApi {
    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn record(&self, verb: &str, key: &str) {
        self.writes.lock().unwrap().push(format!("{verb} {key}"));
    }

    /// Stamps server-side fields on an object that is about to exist.
    fn admit<K: Metadata<Ty = ObjectMeta>>(&self, obj: &mut K) {
        let version = self.next_version();
        let now = self.clock_now();
        let meta = obj.metadata_mut();
        if meta.uid.is_none() {
            meta.uid = Some(format!(
                "{}-uid",
                meta.name.as_deref().unwrap_or_default()
            ));
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(now);
        }
        meta.resource_version = Some(version);
    }

    fn clock_now(&self) -> Time {
        self.clock.now()
    }

    fn create<K>(
        &self,
        verb: &str,
        informer: &Informer<K>,
        obj: &K,
    ) -> Result<K, ClientError>
    where
        K: Metadata<Ty = ObjectMeta> + Clone + Send + Sync + 'static,
    {
        let key = object_key(obj);
        if informer.contains(&key) {
            return Err(ClientError::AlreadyExists(format!(
                "{} {key} already exists",
                informer.kind()
            )));
        }
        let mut obj = obj.clone();
        obj.metadata_mut().uid = None;
        obj.metadata_mut().creation_timestamp = None;
        self.admit(&mut obj);
        informer.apply(obj.clone());
        self.record(verb, &key);
        Ok(obj)
    }

    /// Compare-and-swap update. `merge` builds the stored object from the
    /// current one and the submitted one.
    fn update<K>(
        &self,
        verb: &str,
        informer: &Informer<K>,
        obj: &K,
        merge: impl FnOnce(&K, &K) -> K,
    ) -> Result<K, ClientError>
    where
        K: Metadata<Ty = ObjectMeta> + Clone + Send + Sync + 'static,
    {
        let key = object_key(obj);
        let Some(current) = informer.get(&key) else {
            return Err(ClientError::NotFound(format!(
                "{} {key} not found",
                informer.kind()
            )));
        };
        let submitted = obj.metadata().resource_version.as_deref();
        if submitted.is_some_and(|rv| !rv.is_empty())
            && submitted != current.metadata().resource_version.as_deref()
        {
            return Err(ClientError::Conflict(format!(
                "{} {key}: the object has been modified",
                informer.kind()
            )));
        }

        let mut next = merge(&current, obj);
        {
            let meta = next.metadata_mut();
            let old = current.metadata();
            meta.uid = old.uid.clone();
            meta.creation_timestamp = old.creation_timestamp.clone();
            meta.deletion_timestamp = old.deletion_timestamp.clone();
            meta.resource_version = Some(self.next_version());
        }
        self.record(verb, &key);

        let meta = next.metadata();
        if meta.deletion_timestamp.is_some()
            && meta.finalizers.as_ref().map_or(true, Vec::is_empty)
        {
            informer.delete(&next);
        } else {
            informer.apply(next.clone());
        }
        Ok(next)
    }

    /// Deletes immediately, or marks for deletion while finalizers remain.
    fn delete<K>(
        &self,
        verb: &str,
        informer: &Informer<K>,
        key: &str,
    ) -> Result<(), ClientError>
    where
        K: Metadata<Ty = ObjectMeta> + Clone + Send + Sync + 'static,
    {
        let Some(mut current) = informer.get(key) else {
            return Err(ClientError::NotFound(format!(
                "{} {key} not found",
                informer.kind()
            )));
        };
        self.record(verb, key);
        if current.metadata().finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            let now = self.clock_now();
            let meta = current.metadata_mut();
            meta.deletion_timestamp.get_or_insert(now);
            meta.resource_version = Some(self.next_version());
            informer.apply(current);
        } else {
            informer.delete(&current);
        }
        Ok(())
    }
}

fn ns_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

#[async_trait]
impl Client for FakeApi {
    async fn update_vm(
        &self,
        vm: &VirtualMachine,
    ) -> Result<VirtualMachine, ClientError> {
        self.update("update_vm", &self.informers.vm, vm, |current, new| {
            VirtualMachine { status: current.status.clone(), ..new.clone() }
        })
    }

    async fn update_vm_status(
        &self,
        vm: &VirtualMachine,
    ) -> Result<VirtualMachine, ClientError> {
        self.update("update_vm_status", &self.informers.vm, vm, |current, new| {
            VirtualMachine { status: new.status.clone(), ..current.clone() }
        })
    }

    async fn create_vm(
        &self,
        vm: &VirtualMachine,
    ) -> Result<VirtualMachine, ClientError> {
        self.create("create_vm", &self.informers.vm, vm)
    }

    async fn update_vm_snapshot(
        &self,
        snapshot: &VirtualMachineSnapshot,
    ) -> Result<VirtualMachineSnapshot, ClientError> {
        self.update(
            "update_vm_snapshot",
            &self.informers.vm_snapshot,
            snapshot,
            |_, new| new.clone(),
        )
    }

    async fn create_vm_snapshot_content(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<VirtualMachineSnapshotContent, ClientError> {
        self.create(
            "create_vm_snapshot_content",
            &self.informers.vm_snapshot_content,
            content,
        )
    }

    async fn update_vm_snapshot_content(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<VirtualMachineSnapshotContent, ClientError> {
        self.update(
            "update_vm_snapshot_content",
            &self.informers.vm_snapshot_content,
            content,
            |_, new| new.clone(),
        )
    }

    async fn delete_vm_snapshot_content(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        self.delete(
            "delete_vm_snapshot_content",
            &self.informers.vm_snapshot_content,
            &ns_key(namespace, name),
        )
    }

    async fn update_vm_restore(
        &self,
        restore: &VirtualMachineRestore,
    ) -> Result<VirtualMachineRestore, ClientError> {
        self.update(
            "update_vm_restore",
            &self.informers.vm_restore,
            restore,
            |_, new| new.clone(),
        )
    }

    async fn create_pvc(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, ClientError> {
        self.create("create_pvc", &self.informers.pvc, pvc)
    }

    async fn update_pvc(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, ClientError> {
        self.update("update_pvc", &self.informers.pvc, pvc, |current, new| {
            PersistentVolumeClaim { status: current.status.clone(), ..new.clone() }
        })
    }

    async fn create_volume_snapshot(
        &self,
        snapshot: &VolumeSnapshot,
    ) -> Result<VolumeSnapshot, ClientError> {
        match self.dynamic.volume_snapshot.try_get() {
            Lookup::Available(informer) => {
                self.create("create_volume_snapshot", &informer, snapshot)
            }
            Lookup::Unavailable => Err(ClientError::NotFound(
                "the server could not find the requested resource".into(),
            )),
        }
    }

    async fn delete_data_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        self.delete(
            "delete_data_volume",
            &self.informers.data_volume,
            &ns_key(namespace, name),
        )
    }

    async fn freeze_vmi(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        if self.fail_freeze.load(Ordering::SeqCst) {
            return Err(ClientError::Api("guest agent timed out".into()));
        }
        self.record("freeze_vmi", &ns_key(namespace, name));
        Ok(())
    }

    async fn unfreeze_vmi(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        if self.fail_unfreeze.load(Ordering::SeqCst) {
            return Err(ClientError::Api("guest agent timed out".into()));
        }
        self.record("unfreeze_vmi", &ns_key(namespace, name));
        Ok(())
    }
}

pub struct FakeCluster {
    pub api: Arc<FakeApi>,
    pub informers: Arc<Informers>,
    pub dynamic: Arc<DynamicInformers>,
    pub volume_snapshot_watch: Arc<ManualWatch<VolumeSnapshot>>,
    pub volume_snapshot_class_watch: Arc<ManualWatch<VolumeSnapshotClass>>,
    pub clock: Arc<FixedClock>,
    pub recorder: Arc<FakeRecorder>,
    pub log: Logger,
}

impl FakeCluster {
    pub fn new() -> Self {
        let log = test_logger();
        let informers = Arc::new(Informers::new());
        let volume_snapshot_watch =
            Arc::new(ManualWatch::<VolumeSnapshot>::default());
        let volume_snapshot_class_watch =
            Arc::new(ManualWatch::<VolumeSnapshotClass>::default());
        let dynamic = Arc::new(DynamicInformers::new(
            Arc::clone(&volume_snapshot_watch)
                as Arc<dyn WatchStarter<VolumeSnapshot>>,
            Arc::clone(&volume_snapshot_class_watch)
                as Arc<dyn WatchStarter<VolumeSnapshotClass>>,
            &log,
        ));
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let api = Arc::new(FakeApi {
            informers: Arc::clone(&informers),
            dynamic: Arc::clone(&dynamic),
            clock: Arc::clone(&clock),
            version: AtomicU64::new(100),
            writes: Mutex::new(Vec::new()),
            fail_freeze: AtomicBool::new(false),
            fail_unfreeze: AtomicBool::new(false),
        });
        FakeCluster {
            api,
            informers,
            dynamic,
            volume_snapshot_watch,
            volume_snapshot_class_watch,
            clock,
            recorder: Arc::new(FakeRecorder::default()),
            log,
        }
    }

    pub fn context(&self) -> Context {
        Context {
            client: Arc::clone(&self.api) as Arc<dyn Client>,
            informers: Arc::clone(&self.informers),
            recorder: Arc::clone(&self.recorder) as Arc<dyn EventRecorder>,
            clock: Arc::clone(&self.clock) as Arc<dyn Clock>,
        }
    }

    /// Every write issued so far, as `"<verb> <key>"`.
    pub fn writes(&self) -> Vec<String> {
        self.api.writes.lock().unwrap().clone()
    }

    pub fn clear_writes(&self) {
        self.api.writes.lock().unwrap().clear();
    }

    /// Starts the VolumeSnapshot and VolumeSnapshotClass informers, as if
    /// the CSI snapshotter's CRDs had just been installed.
    pub async fn install_snapshot_crds(&self) {
        let cancel = CancellationToken::new();
        self.dynamic.ensure(VOLUME_SNAPSHOT_CRD, &cancel).await.unwrap();
        self.dynamic.ensure(VOLUME_SNAPSHOT_CLASS_CRD, &cancel).await.unwrap();
    }

    fn seed<K>(&self, informer: &Informer<K>, mut obj: K)
    where
        K: Metadata<Ty = ObjectMeta> + Clone + Send + Sync + 'static,
    {
        if obj.metadata().resource_version.is_none() {
            self.api.admit(&mut obj);
        }
        informer.apply(obj);
    }

    pub fn add_vm(&self, vm: VirtualMachine) {
        self.seed(&self.informers.vm, vm);
    }

    pub fn add_vmi(&self, vmi: VirtualMachineInstance) {
        self.seed(&self.informers.vmi, vmi);
    }

    pub fn add_pod(&self, pod: k8s_openapi::api::core::v1::Pod) {
        self.seed(&self.informers.pod, pod);
    }

    pub fn add_pvc(&self, pvc: PersistentVolumeClaim) {
        self.seed(&self.informers.pvc, pvc);
    }

    pub fn add_storage_class(&self, sc: k8s_openapi::api::storage::v1::StorageClass) {
        self.seed(&self.informers.storage_class, sc);
    }

    pub fn add_data_volume(&self, dv: DataVolume) {
        self.seed(&self.informers.data_volume, dv);
    }

    pub fn add_snapshot(&self, snapshot: VirtualMachineSnapshot) {
        self.seed(&self.informers.vm_snapshot, snapshot);
    }

    pub fn add_content(&self, content: VirtualMachineSnapshotContent) {
        self.seed(&self.informers.vm_snapshot_content, content);
    }

    pub fn add_restore(&self, restore: VirtualMachineRestore) {
        self.seed(&self.informers.vm_restore, restore);
    }

    pub fn add_volume_snapshot_class(&self, vsc: VolumeSnapshotClass) {
        let Lookup::Available(informer) =
            self.dynamic.volume_snapshot_class.try_get()
        else {
            panic!("VolumeSnapshotClass informer not running");
        };
        self.seed(&informer, vsc);
    }

    pub fn add_volume_snapshot(&self, vs: VolumeSnapshot) {
        let Lookup::Available(informer) = self.dynamic.volume_snapshot.try_get()
        else {
            panic!("VolumeSnapshot informer not running");
        };
        self.seed(&informer, vs);
    }

    pub fn remove_volume_snapshot(&self, namespace: &str, name: &str) {
        if let Lookup::Available(informer) = self.dynamic.volume_snapshot.try_get() {
            if let Some(vs) = informer.get_namespaced(namespace, name) {
                informer.delete(&vs);
            }
        }
    }

    /// Deletes a snapshot the way a user would.
    pub fn delete_snapshot(&self, namespace: &str, name: &str) {
        self.api
            .delete("delete_vm_snapshot", &self.informers.vm_snapshot, &ns_key(namespace, name))
            .unwrap();
    }

    pub fn remove_vmi(&self, namespace: &str, name: &str) {
        if let Some(vmi) = self.informers.vmi.get_namespaced(namespace, name) {
            self.informers.vmi.delete(&vmi);
        }
    }

    /// Marks a VolumeSnapshot as cut and ready, as the CSI snapshotter
    /// would.
    pub fn ready_volume_snapshot(&self, namespace: &str, name: &str, restore_size: &str) {
        let mut vs = self.volume_snapshot(namespace, name);
        let now = self.clock_now();
        vs.status = Some(snapshot_api_types::csi::VolumeSnapshotStatus {
            bound_volume_snapshot_content_name: Some(format!("snapcontent-{name}")),
            creation_time: Some(now),
            ready_to_use: Some(true),
            restore_size: Some(k8s_openapi::apimachinery::pkg::api::resource::Quantity(
                restore_size.to_string(),
            )),
            error: None,
        });
        vs.metadata.resource_version = None;
        self.add_volume_snapshot(vs);
    }

    /// Moves a PVC to the `Bound` phase.
    pub fn bind_pvc(&self, namespace: &str, name: &str) {
        let mut pvc = self.pvc(namespace, name);
        pvc.status.get_or_insert_with(Default::default).phase = Some("Bound".into());
        pvc.metadata.resource_version = None;
        self.add_pvc(pvc);
    }

    pub fn clock_now(&self) -> Time {
        self.api.clock_now()
    }

    pub fn vm(&self, namespace: &str, name: &str) -> VirtualMachine {
        self.informers.vm.get_namespaced(namespace, name).unwrap()
    }

    pub fn pvc(&self, namespace: &str, name: &str) -> PersistentVolumeClaim {
        self.informers.pvc.get_namespaced(namespace, name).unwrap()
    }

    pub fn snapshot(&self, namespace: &str, name: &str) -> VirtualMachineSnapshot {
        self.informers.vm_snapshot.get_namespaced(namespace, name).unwrap()
    }

    pub fn content(
        &self,
        namespace: &str,
        name: &str,
    ) -> VirtualMachineSnapshotContent {
        self.informers
            .vm_snapshot_content
            .get_namespaced(namespace, name)
            .unwrap()
    }

    pub fn restore(&self, namespace: &str, name: &str) -> VirtualMachineRestore {
        self.informers.vm_restore.get_namespaced(namespace, name).unwrap()
    }

    pub fn volume_snapshot(&self, namespace: &str, name: &str) -> VolumeSnapshot {
        let Lookup::Available(informer) = self.dynamic.volume_snapshot.try_get()
        else {
            panic!("VolumeSnapshot informer not running");
        };
        informer.get_namespaced(namespace, name).unwrap()
    }
}

/// Canned objects. Every object gets a `<name>-uid` UID when added to the
/// cluster.
pub mod fixtures {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaim, PersistentVolumeClaimSpec,
        PersistentVolumeClaimStatus, Pod, PodSpec, PodStatus,
        TypedLocalObjectReference, VolumeResourceRequirements,
    };
    use k8s_openapi::api::storage::v1::StorageClass;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use snapshot_api_types::cdi::{DataVolume, DataVolumeSpec};
    use snapshot_api_types::csi::{VolumeSnapshotClass, DEFAULT_CLASS_ANNOTATION};
    use snapshot_api_types::snapshot::{
        VirtualMachineRestore, VirtualMachineRestoreSpec,
        VirtualMachineSnapshot, VirtualMachineSnapshotSpec,
    };
    use snapshot_api_types::virt::{
        DataVolumeSource, DataVolumeTemplateSpec, VirtualMachine,
        VirtualMachineInstance, VirtualMachineInstanceCondition,
        VirtualMachineInstanceSpec, VirtualMachineInstanceTemplateSpec,
        VirtualMachineSpec, Volume, AGENT_CONNECTED_CONDITION,
    };
    use snapshot_api_types::ObjectMeta;

    pub const STORAGE_CLASS: &str = "rook-ceph-block";
    pub const PROVISIONER: &str = "rook-ceph.rbd.csi.ceph.com";

    pub fn meta(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    /// A stopped VM with no volumes.
    pub fn vm(namespace: &str, name: &str) -> VirtualMachine {
        VirtualMachine {
            metadata: ObjectMeta {
                labels: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
                ..meta(namespace, name)
            },
            spec: VirtualMachineSpec {
                running: Some(false),
                template: Some(VirtualMachineInstanceTemplateSpec::default()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// A stopped VM whose `volume` is a DataVolume created from a template
    /// named `dv`.
    pub fn vm_with_data_volume(
        namespace: &str,
        name: &str,
        volume: &str,
        dv: &str,
    ) -> VirtualMachine {
        let mut vm = vm(namespace, name);
        vm.spec.template = Some(VirtualMachineInstanceTemplateSpec {
            metadata: None,
            spec: VirtualMachineInstanceSpec {
                volumes: vec![Volume {
                    name: volume.to_string(),
                    data_volume: Some(DataVolumeSource {
                        name: dv.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                other: BTreeMap::from([(
                    "domain".to_string(),
                    serde_json::json!({
                        "devices": {},
                        "firmware": { "uuid": "5d307ca9-b3ef-428c-8861-06e72d69f223" }
                    }),
                )]),
            },
        });
        vm.spec.data_volume_templates = vec![DataVolumeTemplateSpec {
            metadata: ObjectMeta { name: Some(dv.to_string()), ..Default::default() },
            spec: DataVolumeSpec {
                pvc: Some(PersistentVolumeClaimSpec {
                    storage_class_name: Some(STORAGE_CLASS.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }];
        vm
    }

    pub fn vmi(namespace: &str, name: &str, agent_connected: bool) -> VirtualMachineInstance {
        let mut vmi = VirtualMachineInstance {
            metadata: meta(namespace, name),
            ..Default::default()
        };
        if agent_connected {
            vmi.status.conditions.push(VirtualMachineInstanceCondition {
                type_: AGENT_CONNECTED_CONDITION.to_string(),
                status: "True".to_string(),
                ..Default::default()
            });
        }
        vmi
    }

    pub fn snapshot(namespace: &str, name: &str, vm: &str) -> VirtualMachineSnapshot {
        VirtualMachineSnapshot {
            metadata: meta(namespace, name),
            spec: VirtualMachineSnapshotSpec {
                source: TypedLocalObjectReference {
                    api_group: Some("kubevirt.io".to_string()),
                    kind: "VirtualMachine".to_string(),
                    name: vm.to_string(),
                },
                ..Default::default()
            },
            status: None,
        }
    }

    pub fn restore(
        namespace: &str,
        name: &str,
        vm: &str,
        snapshot: &str,
    ) -> VirtualMachineRestore {
        VirtualMachineRestore {
            metadata: meta(namespace, name),
            spec: VirtualMachineRestoreSpec {
                target: TypedLocalObjectReference {
                    api_group: Some("kubevirt.io".to_string()),
                    kind: "VirtualMachine".to_string(),
                    name: vm.to_string(),
                },
                virtual_machine_snapshot_name: snapshot.to_string(),
                ..Default::default()
            },
            status: None,
        }
    }

    /// A PVC of `size`, bound to a volume unless `volume_name` is empty.
    pub fn pvc(
        namespace: &str,
        name: &str,
        storage_class: Option<&str>,
        volume_name: &str,
    ) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: meta(namespace, name),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: storage_class.map(str::to_string),
                volume_name: (!volume_name.is_empty()).then(|| volume_name.to_string()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity("1Gi".to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(
                    if volume_name.is_empty() { "Pending" } else { "Bound" }.to_string(),
                ),
                ..Default::default()
            }),
        }
    }

    pub fn storage_class(name: &str, provisioner: &str) -> StorageClass {
        StorageClass {
            metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
            provisioner: provisioner.to_string(),
            volume_binding_mode: Some("Immediate".to_string()),
            ..Default::default()
        }
    }

    pub fn volume_snapshot_class(name: &str, driver: &str, default: bool) -> VolumeSnapshotClass {
        let annotations = default.then(|| {
            BTreeMap::from([(DEFAULT_CLASS_ANNOTATION.to_string(), "true".to_string())])
        });
        VolumeSnapshotClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations,
                ..Default::default()
            },
            driver: driver.to_string(),
            deletion_policy: "Delete".to_string(),
            ..Default::default()
        }
    }

    pub fn pod_using_claim(namespace: &str, name: &str, claim: &str, phase: &str) -> Pod {
        Pod {
            metadata: meta(namespace, name),
            spec: Some(PodSpec {
                volumes: Some(vec![k8s_openapi::api::core::v1::Volume {
                    name: "disk".to_string(),
                    persistent_volume_claim: Some(
                        k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                            claim_name: claim.to_string(),
                            read_only: None,
                        },
                    ),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: Some(PodStatus { phase: Some(phase.to_string()), ..Default::default() }),
        }
    }

    pub fn data_volume(namespace: &str, name: &str, owner_vm: Option<&str>) -> DataVolume {
        let owner_references = owner_vm.map(|vm| {
            vec![OwnerReference {
                api_version: "kubevirt.io/v1".to_string(),
                kind: "VirtualMachine".to_string(),
                name: vm.to_string(),
                uid: format!("{vm}-uid"),
                controller: Some(true),
                block_owner_deletion: Some(true),
            }]
        });
        DataVolume {
            metadata: ObjectMeta { owner_references, ..meta(namespace, name) },
            spec: DataVolumeSpec {
                pvc: Some(PersistentVolumeClaimSpec {
                    storage_class_name: Some(STORAGE_CLASS.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            status: None,
        }
    }
}
