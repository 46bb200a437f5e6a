//! The narrow slice of the cluster API the operator talks through.
//!
//! Everything the reconciler and status reporter read or write goes through
//! [`ObjectStore`], and every event goes through [`EventSink`]. The kube-backed
//! implementations live here; tests use in-memory ones.

use crate::clusteroperator::ClusterOperator;
use crate::crd::VerticalPodAutoscalerController;
use crate::errors::*;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, ObjectReference, Service};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// A typed resource the operator reads or writes.
pub trait Object:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// An `Api` handle scoped the way this kind is scoped on the server.
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced_object {
    ($($kind:ty),*) => {
        $(impl Object for $kind {
            fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                match namespace {
                    Some(ns) => Api::namespaced(client, ns),
                    None => Api::default_namespaced(client),
                }
            }
        })*
    };
}

macro_rules! cluster_object {
    ($($kind:ty),*) => {
        $(impl Object for $kind {
            fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                Api::all(client)
            }
        })*
    };
}

namespaced_object!(Deployment, Service, ConfigMap, VerticalPodAutoscalerController);
cluster_object!(Namespace, ClusterOperator);

/// Get, create and update against typed resources. Errors are returned as the
/// API server reported them; nothing is retried.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<K>;

    async fn create<K: Object>(&self, obj: &K) -> Result<K>;

    /// Replaces the object. The object's resource version, if set, must match.
    async fn replace<K: Object>(&self, obj: &K) -> Result<K>;

    /// Writes the status subresource only. The object's resource version, if
    /// set, must match.
    async fn replace_status<K: Object>(&self, obj: &K) -> Result<K>;

    /// Whether the API is reachable yet.
    async fn ready(&self) -> bool;
}

/// Sink for human-readable events attached to an object.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    ) -> Result<()>;
}

/// [`ObjectStore`] backed by the cluster.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        KubeStore { client }
    }
}

fn object_name<K: Object>(obj: &K) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| ErrorKind::MissingName(K::kind(&()).to_string()).into())
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        Ok(K::api(self.client.clone(), namespace).get(name).await?)
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let api = K::api(self.client.clone(), obj.namespace().as_deref());
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn replace<K: Object>(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let api = K::api(self.client.clone(), obj.namespace().as_deref());
        Ok(api.replace(&name, &PostParams::default(), obj).await?)
    }

    async fn replace_status<K: Object>(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let api = K::api(self.client.clone(), obj.namespace().as_deref());
        let value = serde_json::to_value(obj)?;
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": value.get("status"),
        });
        Ok(api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn ready(&self) -> bool {
        self.client.apiserver_version().await.is_ok()
    }
}

/// [`EventSink`] publishing through kube-runtime's event recorder.
#[derive(Clone)]
pub struct KubeEvents {
    recorder: Recorder,
}

impl KubeEvents {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        KubeEvents {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEvents {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    ) -> Result<()> {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        Ok(self.recorder.publish(&event, reference).await?)
    }
}
