// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local read caches of cluster objects.
//!
//! An [`Informer`] holds the last observed version of every object of one
//! kind, keyed by `"<namespace>/<name>"` (or just `"<name>"` for cluster
//! scoped kinds), and tells registered handlers about every change. Something
//! outside this crate keeps it current by feeding it the results of a watch;
//! the controllers only ever read from it.
//!
//! Reads hand out owned copies, so callers are free to mutate what they get
//! back without disturbing the cache.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::Metadata;
use snapshot_api_types::cdi::DataVolume;
use snapshot_api_types::snapshot::{
    VirtualMachineRestore, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent,
};
use snapshot_api_types::virt::{VirtualMachine, VirtualMachineInstance};
use snapshot_api_types::ObjectMeta;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Index of VirtualMachineSnapshots by the key of their source VM.
pub const VM_SNAPSHOT_BY_VM: &str = "vm";

/// Index of VirtualMachineSnapshotContents by the keys of the
/// VolumeSnapshots they reference.
pub const CONTENT_BY_VOLUME_SNAPSHOT: &str = "volumeSnapshot";

/// Index of VirtualMachineRestores by the key of their target VM.
pub const RESTORE_BY_VM: &str = "vm";

/// Builds a cache key.
pub fn key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}

/// The cache key of `obj`.
pub fn object_key<K: Metadata<Ty = ObjectMeta>>(obj: &K) -> String {
    let meta = obj.metadata();
    key(meta.namespace.as_deref(), meta.name.as_deref().unwrap_or_default())
}

/// Splits a cache key into its namespace (if any) and name.
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, key),
    }
}

/// A change observed by an informer.
#[derive(Debug)]
pub enum InformerEvent<'a, K> {
    Added(&'a K),
    Updated { old: &'a K, new: &'a K },
    Deleted(&'a K),
}

impl<K> Clone for InformerEvent<'_, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for InformerEvent<'_, K> {}

impl<'a, K> InformerEvent<'a, K> {
    /// The most recent version of the object the event is about.
    pub fn object(&self) -> &'a K {
        match self {
            InformerEvent::Added(obj) | InformerEvent::Deleted(obj) => obj,
            InformerEvent::Updated { new, .. } => new,
        }
    }
}

pub type Handler<K> = Arc<dyn Fn(InformerEvent<'_, K>) + Send + Sync>;
pub type IndexFn<K> = Box<dyn Fn(&K) -> Vec<String> + Send + Sync>;

enum Change<K> {
    Added(K),
    Updated(K, K),
    Deleted(K),
}

pub struct Informer<K> {
    kind: &'static str,
    objects: RwLock<BTreeMap<String, K>>,
    indexers: BTreeMap<&'static str, IndexFn<K>>,
    handlers: RwLock<Vec<Handler<K>>>,
    synced: watch::Sender<bool>,
}

impl<K> Informer<K>
where
    K: Metadata<Ty = ObjectMeta> + Clone + Send + Sync + 'static,
{
    pub fn new(kind: &'static str) -> Self {
        Informer {
            kind,
            objects: RwLock::new(BTreeMap::new()),
            indexers: BTreeMap::new(),
            handlers: RwLock::new(Vec::new()),
            synced: watch::channel(false).0,
        }
    }

    /// Registers a named index. Must be called before the informer is
    /// shared.
    pub fn with_indexer(
        mut self,
        name: &'static str,
        f: impl Fn(&K) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.indexers.insert(name, Box::new(f));
        self
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn add_handler(
        &self,
        handler: impl Fn(InformerEvent<'_, K>) + Send + Sync + 'static,
    ) {
        self.add_shared_handler(Arc::new(handler));
    }

    pub fn add_shared_handler(&self, handler: Handler<K>) {
        self.handlers.write().unwrap().push(handler);
    }

    pub fn get(&self, key: &str) -> Option<K> {
        self.objects.read().unwrap().get(key).cloned()
    }

    pub fn get_namespaced(&self, namespace: &str, name: &str) -> Option<K> {
        self.get(&key(Some(namespace), name))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().unwrap().contains_key(key)
    }

    pub fn list(&self) -> Vec<K> {
        self.objects.read().unwrap().values().cloned().collect()
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.objects.read().unwrap().keys().cloned().collect()
    }

    /// Keys of every object whose `index` values include `value`. An
    /// unknown index matches nothing.
    pub fn index_keys(&self, index: &str, value: &str) -> Vec<String> {
        let Some(indexer) = self.indexers.get(index) else {
            return Vec::new();
        };
        self.objects
            .read()
            .unwrap()
            .iter()
            .filter(|(_, obj)| indexer(obj).iter().any(|v| v == value))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Records an added or modified object.
    pub fn apply(&self, obj: K) {
        let key = object_key(&obj);
        let old = self.objects.write().unwrap().insert(key, obj.clone());
        self.dispatch(vec![match old {
            Some(old) => Change::Updated(old, obj),
            None => Change::Added(obj),
        }]);
    }

    /// Records a deleted object.
    pub fn delete(&self, obj: &K) {
        let removed = self.objects.write().unwrap().remove(&object_key(obj));
        self.dispatch(vec![Change::Deleted(
            removed.unwrap_or_else(|| obj.clone()),
        )]);
    }

    /// Replaces the entire contents of the cache, as after a full list, and
    /// marks the informer synced.
    pub fn replace(&self, objs: Vec<K>) {
        let mut next: BTreeMap<String, K> =
            objs.into_iter().map(|obj| (object_key(&obj), obj)).collect();

        let changes = {
            let mut objects = self.objects.write().unwrap();
            let mut changes = Vec::new();
            for (key, old) in objects.iter() {
                if !next.contains_key(key) {
                    changes.push(Change::Deleted(old.clone()));
                }
            }
            for (key, obj) in next.iter() {
                changes.push(match objects.get(key) {
                    Some(old) => Change::Updated(old.clone(), obj.clone()),
                    None => Change::Added(obj.clone()),
                });
            }
            std::mem::swap(&mut *objects, &mut next);
            changes
        };

        self.dispatch(changes);
        self.mark_synced();
    }

    /// Re-delivers every cached object to the handlers as an update.
    pub fn resync(&self) {
        let changes = self
            .list()
            .into_iter()
            .map(|obj| Change::Updated(obj.clone(), obj))
            .collect();
        self.dispatch(changes);
    }

    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Waits until the informer has completed its initial list. Returns false
    /// if `cancel` fires first.
    pub async fn wait_for_sync(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.synced.subscribe();
        tokio::select! {
            res = rx.wait_for(|synced| *synced) => res.is_ok(),
            _ = cancel.cancelled() => false,
        }
    }

    // Handlers run without any lock on the cache held, so they are free to
    // read from it.
    fn dispatch(&self, changes: Vec<Change<K>>) {
        let handlers = self.handlers.read().unwrap().clone();
        if handlers.is_empty() {
            return;
        }
        for change in &changes {
            let event = match change {
                Change::Added(obj) => InformerEvent::Added(obj),
                Change::Updated(old, new) => InformerEvent::Updated { old, new },
                Change::Deleted(obj) => InformerEvent::Deleted(obj),
            };
            for handler in &handlers {
                handler(event);
            }
        }
    }
}

/// The informers both controllers read from.
pub struct Informers {
    pub vm: Arc<Informer<VirtualMachine>>,
    pub vmi: Arc<Informer<VirtualMachineInstance>>,
    pub pod: Arc<Informer<Pod>>,
    pub pvc: Arc<Informer<PersistentVolumeClaim>>,
    pub storage_class: Arc<Informer<StorageClass>>,
    pub data_volume: Arc<Informer<DataVolume>>,
    pub crd: Arc<Informer<CustomResourceDefinition>>,
    pub vm_snapshot: Arc<Informer<VirtualMachineSnapshot>>,
    pub vm_snapshot_content: Arc<Informer<VirtualMachineSnapshotContent>>,
    pub vm_restore: Arc<Informer<VirtualMachineRestore>>,
}

impl Informers {
    pub fn new() -> Self {
        Informers {
            vm: Arc::new(Informer::new("VirtualMachine")),
            vmi: Arc::new(Informer::new("VirtualMachineInstance")),
            pod: Arc::new(Informer::new("Pod")),
            pvc: Arc::new(Informer::new("PersistentVolumeClaim")),
            storage_class: Arc::new(Informer::new("StorageClass")),
            data_volume: Arc::new(Informer::new("DataVolume")),
            crd: Arc::new(Informer::new("CustomResourceDefinition")),
            vm_snapshot: Arc::new(
                Informer::new("VirtualMachineSnapshot")
                    .with_indexer(VM_SNAPSHOT_BY_VM, snapshot_source_vm_keys),
            ),
            vm_snapshot_content: Arc::new(
                Informer::new("VirtualMachineSnapshotContent").with_indexer(
                    CONTENT_BY_VOLUME_SNAPSHOT,
                    content_volume_snapshot_keys,
                ),
            ),
            vm_restore: Arc::new(
                Informer::new("VirtualMachineRestore")
                    .with_indexer(RESTORE_BY_VM, restore_target_vm_keys),
            ),
        }
    }

    /// Waits for the initial list of every informer. Returns false if
    /// `cancel` fires first.
    pub async fn wait_for_sync(&self, cancel: &CancellationToken) -> bool {
        self.vm.wait_for_sync(cancel).await
            && self.vmi.wait_for_sync(cancel).await
            && self.pod.wait_for_sync(cancel).await
            && self.pvc.wait_for_sync(cancel).await
            && self.storage_class.wait_for_sync(cancel).await
            && self.data_volume.wait_for_sync(cancel).await
            && self.crd.wait_for_sync(cancel).await
            && self.vm_snapshot.wait_for_sync(cancel).await
            && self.vm_snapshot_content.wait_for_sync(cancel).await
            && self.vm_restore.wait_for_sync(cancel).await
    }

    pub fn resync_all(&self) {
        self.vm.resync();
        self.vmi.resync();
        self.pod.resync();
        self.pvc.resync();
        self.storage_class.resync();
        self.data_volume.resync();
        self.crd.resync();
        self.vm_snapshot.resync();
        self.vm_snapshot_content.resync();
        self.vm_restore.resync();
    }
}

impl Default for Informers {
    fn default() -> Self {
        Informers::new()
    }
}

fn snapshot_source_vm_keys(snapshot: &VirtualMachineSnapshot) -> Vec<String> {
    let source = &snapshot.spec.source;
    if source.kind != "VirtualMachine" {
        return Vec::new();
    }
    vec![key(snapshot.metadata.namespace.as_deref(), &source.name)]
}

fn content_volume_snapshot_keys(
    content: &VirtualMachineSnapshotContent,
) -> Vec<String> {
    content
        .spec
        .volume_backups
        .iter()
        .filter_map(|vb| vb.volume_snapshot_name.as_deref())
        .map(|name| key(content.metadata.namespace.as_deref(), name))
        .collect()
}

fn restore_target_vm_keys(restore: &VirtualMachineRestore) -> Vec<String> {
    let target = &restore.spec.target;
    if target.kind != "VirtualMachine" {
        return Vec::new();
    }
    vec![key(restore.metadata.namespace.as_deref(), &target.name)]
}
