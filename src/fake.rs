//! In-memory stand-ins for the cluster used by unit tests.

use crate::errors::*;
use crate::store::{EventSink, Object, ObjectStore};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::core::ErrorResponse;
use kube_runtime::events::EventType;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Get,
    Create,
    Replace,
    ReplaceStatus,
}

type Key = (String, Option<String>, String);

fn key_for<K: Object>(namespace: Option<&str>, name: &str) -> Key {
    (
        format!("{}/{}", K::api_version(&()), K::kind(&())),
        namespace.map(str::to_string),
        name.to_string(),
    )
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    ErrorKind::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
    .into()
}

fn resource_version(value: &Value) -> Option<&str> {
    value.pointer("/metadata/resourceVersion").and_then(Value::as_str)
}

/// An object store with the API server behaviours the operator depends on:
/// 404 on missing objects, 409 on duplicate creates and stale resource
/// versions, status only writable through the status subresource, and
/// generation bumps on spec changes.
pub struct FakeStore {
    objects: Mutex<BTreeMap<Key, Value>>,
    failures: Mutex<Vec<(Verb, String)>>,
    next_version: AtomicU64,
    writes: AtomicUsize,
    ready: AtomicBool,
}

impl FakeStore {
    pub fn new() -> Self {
        FakeStore {
            objects: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(Vec::new()),
            next_version: AtomicU64::new(1),
            writes: AtomicUsize::new(0),
            ready: AtomicBool::new(true),
        }
    }

    /// Seeds an object as-is, status included.
    pub fn with<K: Object>(self, obj: K) -> Self {
        self.insert(obj);
        self
    }

    pub fn insert<K: Object>(&self, obj: K) {
        let key = key_for::<K>(obj.meta().namespace.as_deref(), obj.meta().name.as_deref().unwrap_or(""));
        let mut value = serde_json::to_value(&obj).expect("serializable object");
        if resource_version(&value).is_none() {
            let rv = self.bump().to_string();
            value["metadata"]["resourceVersion"] = Value::String(rv);
        }
        self.objects.lock().unwrap().insert(key, value);
    }

    pub fn fetch<K: Object>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&key_for::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).expect("stored object deserializes"))
    }

    /// Makes every subsequent call of `verb` on `kind` fail with a 500.
    pub fn fail(&self, verb: Verb, kind: &str) {
        self.failures.lock().unwrap().push((verb, kind.to_string()));
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    fn check_failure<K: Object>(&self, verb: Verb) -> Result<()> {
        let kind = K::kind(&()).to_string();
        let failures = self.failures.lock().unwrap();
        if failures.iter().any(|(v, k)| *v == verb && *k == kind) {
            return Err(api_error(
                500,
                "InternalError",
                format!("injected {:?} failure for {}", verb, kind),
            ));
        }
        Ok(())
    }

    fn key_of<K: Object>(obj: &K) -> Result<Key> {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| Error::from(ErrorKind::MissingName(K::kind(&()).to_string())))?;
        Ok(key_for::<K>(obj.meta().namespace.as_deref(), &name))
    }

    fn not_found<K: Object>(name: &str) -> Error {
        api_error(
            404,
            "NotFound",
            format!("{} \"{}\" not found", K::kind(&()), name),
        )
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        self.check_failure::<K>(Verb::Get)?;
        let objects = self.objects.lock().unwrap();
        match objects.get(&key_for::<K>(namespace, name)) {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Err(Self::not_found::<K>(name)),
        }
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        self.check_failure::<K>(Verb::Create)?;
        let key = Self::key_of(obj)?;
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} \"{}\" already exists", K::kind(&()), key.2),
            ));
        }

        let mut value = serde_json::to_value(obj)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("status");
        }
        let n = self.bump();
        let meta = &mut value["metadata"];
        meta["resourceVersion"] = Value::String(n.to_string());
        meta["generation"] = Value::from(1);
        if meta.get("uid").is_none() {
            meta["uid"] = Value::String(format!("uid-{}", n));
        }

        objects.insert(key, value.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::from_value(value)?)
    }

    async fn replace<K: Object>(&self, obj: &K) -> Result<K> {
        self.check_failure::<K>(Verb::Replace)?;
        let key = Self::key_of(obj)?;
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found::<K>(&key.2))?;

        let mut value = serde_json::to_value(obj)?;
        if let Some(rv) = resource_version(&value) {
            if Some(rv) != resource_version(&stored) {
                return Err(api_error(
                    409,
                    "Conflict",
                    format!("the object {} has been modified", key.2),
                ));
            }
        }

        // Status is owned by the status subresource.
        match stored.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Some(map) = value.as_object_mut() {
                    map.remove("status");
                }
            }
        }

        let generation = stored
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let spec_changed = stored.get("spec") != value.get("spec");
        let meta = &mut value["metadata"];
        meta["generation"] = Value::from(if spec_changed { generation + 1 } else { generation });
        meta["resourceVersion"] = Value::String(self.bump().to_string());
        if let Some(uid) = stored.pointer("/metadata/uid") {
            meta["uid"] = uid.clone();
        }

        objects.insert(key, value.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::from_value(value)?)
    }

    async fn replace_status<K: Object>(&self, obj: &K) -> Result<K> {
        self.check_failure::<K>(Verb::ReplaceStatus)?;
        let key = Self::key_of(obj)?;
        let mut objects = self.objects.lock().unwrap();
        let mut stored = objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found::<K>(&key.2))?;

        let value = serde_json::to_value(obj)?;
        if let Some(rv) = resource_version(&value) {
            if Some(rv) != resource_version(&stored) {
                return Err(api_error(
                    409,
                    "Conflict",
                    format!("the object {} has been modified", key.2),
                ));
            }
        }

        match value.get("status") {
            Some(status) => stored["status"] = status.clone(),
            None => {
                if let Some(map) = stored.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        stored["metadata"]["resourceVersion"] = Value::String(self.bump().to_string());

        objects.insert(key, stored.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::from_value(stored)?)
    }

    async fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub warning: bool,
    pub reason: String,
    pub note: String,
    pub name: Option<String>,
    pub namespace: Option<String>,
}

/// Collects published events in order.
#[derive(Default)]
pub struct FakeEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl FakeEvents {
    pub fn new() -> Self {
        FakeEvents::default()
    }

    pub fn recorded(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.recorded().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventSink for FakeEvents {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    ) -> Result<()> {
        self.events.lock().unwrap().push(RecordedEvent {
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
            name: reference.name.clone(),
            namespace: reference.namespace.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{is_already_exists, is_conflict, is_not_found};
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn behaves_like_the_api_server() {
        let store = FakeStore::new();

        let err = store.get::<ConfigMap>(Some("ns"), "cm").await.unwrap_err();
        assert!(is_not_found(&err));

        let created = store.create(&config_map("cm")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        let err = store.create(&config_map("cm")).await.unwrap_err();
        assert!(is_already_exists(&err));

        let mut stale = created.clone();
        store.replace(&created).await.unwrap();
        stale.data = Some(BTreeMap::from([("k".to_string(), "v".to_string())]));
        let err = store.replace(&stale).await.unwrap_err();
        assert!(is_conflict(&err));
        assert_eq!(store.writes(), 2);
    }
}
