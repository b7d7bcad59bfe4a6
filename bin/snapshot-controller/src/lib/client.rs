// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`Client`] backed by the Kubernetes API server.
//!
//! KubeVirt, CDI and CSI kinds are sent as [`DynamicObject`]s so that the
//! request body always carries `apiVersion` and `kind`, which the typed
//! definitions in `snapshot_api_types` do not serialize themselves.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, PostParams, TypeMeta,
};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use snapshot_api_types::cdi::DataVolume;
use snapshot_api_types::csi::VolumeSnapshot;
use snapshot_api_types::snapshot::{
    VirtualMachineRestore, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent,
};
use snapshot_api_types::virt::VirtualMachine;
use virt_snapshot::client::{Client, ClientError};

const SUBRESOURCE_API: &str = "/apis/subresources.kubevirt.io/v1";

pub struct KubeClient {
    client: kube::Client,
}

impl KubeClient {
    pub fn new(client: kube::Client) -> Self {
        KubeClient { client }
    }

    fn dynamic_api<K>(&self, namespace: &str) -> Api<DynamicObject>
    where
        K: Resource<DynamicType = ()>,
    {
        Api::namespaced_with(
            self.client.clone(),
            namespace,
            &ApiResource::erase::<K>(&()),
        )
    }

    async fn create<K>(&self, obj: &K) -> Result<K, ClientError>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let body = to_dynamic(obj)?;
        let api = self.dynamic_api::<K>(namespace_of(obj));
        let created = api
            .create(&PostParams::default(), &body)
            .await
            .map_err(map_error)?;
        from_dynamic(created)
    }

    async fn replace<K>(&self, obj: &K) -> Result<K, ClientError>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let body = to_dynamic(obj)?;
        let api = self.dynamic_api::<K>(namespace_of(obj));
        let replaced = api
            .replace(name_of(obj), &PostParams::default(), &body)
            .await
            .map_err(map_error)?;
        from_dynamic(replaced)
    }

    async fn replace_status<K>(&self, obj: &K) -> Result<K, ClientError>
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let api = self.dynamic_api::<K>(namespace_of(obj));
        let replaced = api
            .replace_status(name_of(obj), &PostParams::default(), status_body(obj)?)
            .await
            .map_err(map_error)?;
        from_dynamic(replaced)
    }

    async fn delete<K>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError>
    where
        K: Resource<DynamicType = ()>,
    {
        self.dynamic_api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(map_error)?;
        Ok(())
    }

    /// PUTs to a VirtualMachineInstance subresource.
    async fn vmi_subresource(
        &self,
        namespace: &str,
        name: &str,
        subresource: &str,
        body: Vec<u8>,
    ) -> Result<(), ClientError> {
        let uri = format!(
            "{SUBRESOURCE_API}/namespaces/{namespace}/virtualmachineinstances/{name}/{subresource}"
        );
        let request = http::Request::put(uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body)
            .map_err(|e| ClientError::Api(e.to_string()))?;
        self.client.request_text(request).await.map_err(map_error)?;
        Ok(())
    }
}

fn namespace_of<K: Resource>(obj: &K) -> &str {
    obj.meta().namespace.as_deref().unwrap_or_default()
}

fn name_of<K: Resource>(obj: &K) -> &str {
    obj.meta().name.as_deref().unwrap_or_default()
}

/// Wraps `obj` with its type information for the wire.
fn to_dynamic<K>(obj: &K) -> Result<DynamicObject, ClientError>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let mut data = serde_json::to_value(obj)
        .map_err(|e| ClientError::Api(e.to_string()))?;
    if let Some(fields) = data.as_object_mut() {
        fields.remove("metadata");
        fields.remove("apiVersion");
        fields.remove("kind");
    }
    Ok(DynamicObject {
        types: Some(TypeMeta {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
        }),
        metadata: obj.meta().clone(),
        data,
    })
}

/// The body of a status replace: the whole object, typed for the wire.
fn status_body<K>(obj: &K) -> Result<Vec<u8>, ClientError>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    serde_json::to_vec(&to_dynamic(obj)?)
        .map_err(|e| ClientError::Api(e.to_string()))
}

fn from_dynamic<K: DeserializeOwned>(
    obj: DynamicObject,
) -> Result<K, ClientError> {
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|e| ClientError::Api(e.to_string()))
}

/// Sorts API server failures into the cases the controllers act on.
pub fn map_error(err: kube::Error) -> ClientError {
    match err {
        kube::Error::Api(resp) => match (resp.code, resp.reason.as_str()) {
            (404, _) => ClientError::NotFound(resp.message),
            (409, "AlreadyExists") => ClientError::AlreadyExists(resp.message),
            (409, _) => ClientError::Conflict(resp.message),
            _ => ClientError::Api(resp.message),
        },
        other => ClientError::Api(other.to_string()),
    }
}

#[async_trait]
impl Client for KubeClient {
    async fn update_vm(
        &self,
        vm: &VirtualMachine,
    ) -> Result<VirtualMachine, ClientError> {
        self.replace(vm).await
    }

    async fn update_vm_status(
        &self,
        vm: &VirtualMachine,
    ) -> Result<VirtualMachine, ClientError> {
        self.replace_status(vm).await
    }

    async fn create_vm(
        &self,
        vm: &VirtualMachine,
    ) -> Result<VirtualMachine, ClientError> {
        self.create(vm).await
    }

    async fn update_vm_snapshot(
        &self,
        snapshot: &VirtualMachineSnapshot,
    ) -> Result<VirtualMachineSnapshot, ClientError> {
        self.replace(snapshot).await
    }

    async fn create_vm_snapshot_content(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<VirtualMachineSnapshotContent, ClientError> {
        self.create(content).await
    }

    async fn update_vm_snapshot_content(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<VirtualMachineSnapshotContent, ClientError> {
        self.replace(content).await
    }

    async fn delete_vm_snapshot_content(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        self.delete::<VirtualMachineSnapshotContent>(namespace, name).await
    }

    async fn update_vm_restore(
        &self,
        restore: &VirtualMachineRestore,
    ) -> Result<VirtualMachineRestore, ClientError> {
        self.replace(restore).await
    }

    async fn create_pvc(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, ClientError> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), namespace_of(pvc));
        api.create(&PostParams::default(), pvc).await.map_err(map_error)
    }

    async fn update_pvc(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, ClientError> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), namespace_of(pvc));
        api.replace(name_of(pvc), &PostParams::default(), pvc)
            .await
            .map_err(map_error)
    }

    async fn create_volume_snapshot(
        &self,
        snapshot: &VolumeSnapshot,
    ) -> Result<VolumeSnapshot, ClientError> {
        self.create(snapshot).await
    }

    async fn delete_data_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        self.delete::<DataVolume>(namespace, name).await
    }

    async fn freeze_vmi(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        let body = serde_json::to_vec(&serde_json::json!({
            "unfreezeTimeout": "0s"
        }))
        .map_err(|e| ClientError::Api(e.to_string()))?;
        self.vmi_subresource(namespace, name, "freeze", body).await
    }

    async fn unfreeze_vmi(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        self.vmi_subresource(namespace, name, "unfreeze", Vec::new()).await
    }
}
