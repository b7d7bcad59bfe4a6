// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for the Kubernetes resources consumed and produced by the VM
//! snapshot and restore controllers.
//!
//! Only the fields the controllers reason about are modelled explicitly.
//! Everything else an object carries is kept in `other` maps so that an
//! object read from the API server can be written back without losing data
//! this crate does not know about.
//!
//! Core Kubernetes kinds (PersistentVolumeClaim, Pod, StorageClass and so on)
//! are taken from `k8s-openapi` and re-exported through [`k8s`].

pub mod cdi;
pub mod csi;
pub mod snapshot;
pub mod units;
pub mod virt;

pub use k8s_openapi as k8s;
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

/// Implements `k8s_openapi::Resource` and `k8s_openapi::Metadata` for a
/// resource type whose metadata lives in a `metadata` field.
macro_rules! impl_resource {
    (
        $ty:ty,
        group: $group:literal,
        version: $version:literal,
        kind: $kind:literal,
        plural: $plural:literal,
        scope: $scope:ty $(,)?
    ) => {
        impl k8s_openapi::Resource for $ty {
            const API_VERSION: &'static str = concat!($group, "/", $version);
            const GROUP: &'static str = $group;
            const KIND: &'static str = $kind;
            const VERSION: &'static str = $version;
            const URL_PATH_SEGMENT: &'static str = $plural;
            type Scope = $scope;
        }

        impl k8s_openapi::Metadata for $ty {
            type Ty = $crate::ObjectMeta;

            fn metadata(&self) -> &Self::Ty {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut Self::Ty {
                &mut self.metadata
            }
        }
    };
}
pub(crate) use impl_resource;

/// Returns true if `meta` lists `finalizer`.
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|name| name == finalizer))
}

/// Adds `finalizer` to `meta` if it is not already present.
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) {
    if has_finalizer(meta, finalizer) {
        return;
    }
    meta.finalizers.get_or_insert_with(Vec::new).push(finalizer.to_string());
}

/// Removes every occurrence of `finalizer` from `meta`.
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) {
    if let Some(finalizers) = meta.finalizers.as_mut() {
        finalizers.retain(|name| name != finalizer);
        if finalizers.is_empty() {
            meta.finalizers = None;
        }
    }
}
