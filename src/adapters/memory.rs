//! In-memory Kubernetes adapters
//!
//! Workload accessor and object store backed by process memory. Used by the
//! rehearsal mode of the binary and throughout the test suite; both support
//! fault injection so failure paths can be driven deterministically.

use crate::domain::ports::{ObjectStore, WorkloadAccessor, WorkloadKind, WorkloadRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// Object Store
// =============================================================================

/// Failure to inject on the next write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    Conflict,
    Gone,
    Unavailable,
}

/// A recorded successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOperation {
    pub verb: &'static str,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    /// resourceVersion carried by the submitted object
    pub resource_version: Option<String>,
}

type ObjectKey = (String, String, String);

/// Object store with optimistic concurrency on resourceVersion
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<ObjectKey, DynamicObject>>,
    operations: Mutex<Vec<StoreOperation>>,
    faults: Mutex<Option<(StoreFault, u32)>>,
    next_version: AtomicU64,
}

impl InMemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: RwLock::new(BTreeMap::new()),
            operations: Mutex::new(Vec::new()),
            faults: Mutex::new(None),
            next_version: AtomicU64::new(100),
        })
    }

    fn key(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> ObjectKey {
        (
            format!("{}/{}", gvk.api_version(), gvk.kind),
            namespace.unwrap_or_default().to_string(),
            name.to_string(),
        )
    }

    /// Insert an object directly with the given resourceVersion
    pub fn seed(&self, gvk: &GroupVersionKind, mut value: Value, resource_version: &str) {
        if let Some(body) = value.as_object_mut() {
            body.insert("apiVersion".into(), Value::String(gvk.api_version()));
            body.insert("kind".into(), Value::String(gvk.kind.clone()));
        }
        let mut object: DynamicObject = match serde_json::from_value(value) {
            Ok(o) => o,
            Err(_) => return,
        };
        object.metadata.resource_version = Some(resource_version.to_string());
        let key = Self::key(
            gvk,
            object.metadata.namespace.as_deref(),
            object.metadata.name.as_deref().unwrap_or_default(),
        );
        self.objects.write().insert(key, object);
    }

    /// Fail the next `count` writes with `fault`
    pub fn inject(&self, fault: StoreFault, count: u32) {
        *self.faults.lock() = Some((fault, count));
    }

    pub fn faults_remaining(&self) -> u32 {
        self.faults.lock().map(|(_, n)| n).unwrap_or(0)
    }

    pub fn operations(&self) -> Vec<StoreOperation> {
        self.operations.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn take_fault(&self, gvk: &GroupVersionKind, name: &str) -> Result<()> {
        let mut faults = self.faults.lock();
        let fault = match faults.as_mut() {
            Some((fault, n)) if *n > 0 => {
                *n -= 1;
                *fault
            }
            _ => return Ok(()),
        };
        Err(match fault {
            StoreFault::Conflict => Error::Conflict {
                kind: gvk.kind.clone(),
                name: name.to_string(),
                reason: "injected conflict".into(),
            },
            StoreFault::Gone => Error::NotFoundAfterCheck {
                kind: gvk.kind.clone(),
                name: name.to_string(),
            },
            StoreFault::Unavailable => Error::endpoint("apiserver", "injected outage"),
        })
    }

    fn record(&self, verb: &'static str, gvk: &GroupVersionKind, object: &DynamicObject) {
        self.operations.lock().push(StoreOperation {
            verb,
            kind: gvk.kind.clone(),
            namespace: object.metadata.namespace.clone(),
            name: object.metadata.name.clone().unwrap_or_default(),
            resource_version: object.metadata.resource_version.clone(),
        });
    }

    fn bump(&self) -> String {
        self.next_version.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self
            .objects
            .read()
            .get(&Self::key(gvk, namespace, name))
            .cloned())
    }

    async fn create(&self, gvk: &GroupVersionKind, object: &DynamicObject) -> Result<DynamicObject> {
        let name = object.metadata.name.clone().unwrap_or_default();
        self.take_fault(gvk, &name)?;

        let key = Self::key(gvk, object.metadata.namespace.as_deref(), &name);
        let mut objects = self.objects.write();
        if objects.contains_key(&key) {
            return Err(Error::Conflict {
                kind: gvk.kind.clone(),
                name,
                reason: "already exists".into(),
            });
        }

        self.record("create", gvk, object);
        let mut stored = object.clone();
        stored.metadata.resource_version = Some(self.bump());
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace(&self, gvk: &GroupVersionKind, object: &DynamicObject) -> Result<DynamicObject> {
        let name = object.metadata.name.clone().unwrap_or_default();
        self.take_fault(gvk, &name)?;

        let key = Self::key(gvk, object.metadata.namespace.as_deref(), &name);
        let mut objects = self.objects.write();
        let live = objects.get(&key).ok_or_else(|| Error::NotFoundAfterCheck {
            kind: gvk.kind.clone(),
            name: name.clone(),
        })?;

        if live.metadata.resource_version != object.metadata.resource_version {
            return Err(Error::Conflict {
                kind: gvk.kind.clone(),
                name,
                reason: format!(
                    "resourceVersion {:?} does not match live {:?}",
                    object.metadata.resource_version, live.metadata.resource_version
                ),
            });
        }

        self.record("replace", gvk, object);
        let mut stored = object.clone();
        stored.metadata.resource_version = Some(self.bump());
        objects.insert(key, stored.clone());
        Ok(stored)
    }
}

// =============================================================================
// Workload Accessor
// =============================================================================

type WorkloadKey = (WorkloadKind, String, String);

/// Deployments/StatefulSets, their claims and PV handles, held in memory
#[derive(Default)]
pub struct InMemoryWorkloads {
    replicas: Mutex<BTreeMap<WorkloadKey, i32>>,
    claims: Mutex<BTreeMap<WorkloadKey, Vec<String>>>,
    handles: Mutex<BTreeMap<String, String>>,
    failing_workloads: Mutex<BTreeSet<String>>,
    fail_handle_updates: Mutex<bool>,
}

impl InMemoryWorkloads {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a workload mounting the given claims
    pub fn add_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        replicas: i32,
        claims: &[&str],
    ) {
        let key = (kind, namespace.to_string(), name.to_string());
        self.replicas.lock().insert(key.clone(), replicas);
        self.claims
            .lock()
            .insert(key, claims.iter().map(|c| c.to_string()).collect());
    }

    pub fn add_volume(&self, pv_name: &str, handle: &str) {
        self.handles
            .lock()
            .insert(pv_name.to_string(), handle.to_string());
    }

    pub fn replicas(&self, kind: WorkloadKind, namespace: &str, name: &str) -> Option<i32> {
        self.replicas
            .lock()
            .get(&(kind, namespace.to_string(), name.to_string()))
            .copied()
    }

    pub fn volume_handle(&self, pv_name: &str) -> Option<String> {
        self.handles.lock().get(pv_name).cloned()
    }

    /// Make replica updates for this workload name fail
    pub fn fail_scaling(&self, name: &str) {
        self.failing_workloads.lock().insert(name.to_string());
    }

    pub fn fail_handle_updates(&self, fail: bool) {
        *self.fail_handle_updates.lock() = fail;
    }
}

#[async_trait]
impl WorkloadAccessor for InMemoryWorkloads {
    async fn find_consumers(
        &self,
        claim_namespace: &str,
        claim_name: &str,
    ) -> Result<Vec<WorkloadRef>> {
        let claims = self.claims.lock();
        let replicas = self.replicas.lock();

        Ok(claims
            .iter()
            .filter(|((_, ns, _), mounted)| {
                ns == claim_namespace && mounted.iter().any(|c| c == claim_name)
            })
            .map(|(key, _)| WorkloadRef {
                kind: key.0,
                namespace: key.1.clone(),
                name: key.2.clone(),
                replicas: replicas.get(key).copied().unwrap_or_default(),
            })
            .collect())
    }

    async fn set_replicas(
        &self,
        kind: WorkloadKind,
        name: &str,
        namespace: &str,
        replicas: i32,
    ) -> Result<()> {
        if self.failing_workloads.lock().contains(name) {
            return Err(Error::endpoint(
                format!("scale {}/{}", kind, name),
                "injected failure",
            ));
        }

        let key = (kind, namespace.to_string(), name.to_string());
        let mut all = self.replicas.lock();
        match all.get_mut(&key) {
            Some(current) => {
                *current = replicas;
                Ok(())
            }
            None => Err(Error::ResourceNotFound {
                kind: kind.to_string(),
                name: format!("{}/{}", namespace, name),
            }),
        }
    }

    async fn set_volume_handle(&self, pv_name: &str, handle: &str) -> Result<()> {
        if *self.fail_handle_updates.lock() {
            return Err(Error::endpoint(
                format!("update PersistentVolume {}", pv_name),
                "injected failure",
            ));
        }

        let mut handles = self.handles.lock();
        match handles.get_mut(pv_name) {
            Some(h) => {
                *h = handle.to_string();
                Ok(())
            }
            None => Err(Error::ResourceNotFound {
                kind: "PersistentVolume".into(),
                name: pv_name.into(),
            }),
        }
    }
}
