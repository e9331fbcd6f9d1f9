//! Resource Snapshot & Restore
//!
//! Captures arbitrary cluster objects into [`BackupManifest`]s and writes them
//! back later. A manifest embeds apiVersion and kind next to the full body,
//! so restoring needs no schema lookup.
//!
//! Restores reapply the backed-up body on top of the server's *current*
//! resourceVersion: concurrent modifications are overwritten, not merged.

use crate::crd::BackupManifest;
use crate::domain::ports::ObjectStoreRef;
use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolume, PersistentVolumeClaim, Secret,
};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Bounded exponential backoff for restore writes
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Jitter as a fraction of the interval (0.1 = ±10%)
    pub randomization_factor: f64,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            randomization_factor: 0.1,
            max_interval: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

/// Configuration for the backup component
#[derive(Debug, Clone, Default)]
pub struct BackupConfig {
    pub retry: RetryPolicy,
    /// Extra resource types registered on top of the built-in ones
    pub registered_types: BTreeMap<String, GroupVersionKind>,
}

// =============================================================================
// Type Resolution
// =============================================================================

/// One strategy for working out an object's apiVersion/kind.
///
/// Strategies are tried in order; the first hit wins.
#[derive(Debug, Clone)]
pub enum TypeResolver {
    /// apiVersion/kind already present on the serialized object
    Embedded,
    /// Types known to this operator, keyed by resource type
    Registered(BTreeMap<String, GroupVersionKind>),
    /// Static table of well-known types
    Fallback(&'static [(&'static str, &'static str, &'static str, &'static str)]),
}

/// resource type, group, version, kind
const WELL_KNOWN_TYPES: &[(&str, &str, &str, &str)] = &[
    ("infrastructures", "config.openshift.io", "v1", "Infrastructure"),
    ("clustercsidrivers", "operator.openshift.io", "v1", "ClusterCSIDriver"),
    ("csidrivers", "storage.k8s.io", "v1", "CSIDriver"),
    ("namespaces", "", "v1", "Namespace"),
    ("services", "", "v1", "Service"),
];

impl TypeResolver {
    pub fn name(&self) -> &'static str {
        match self {
            TypeResolver::Embedded => "embedded",
            TypeResolver::Registered(_) => "registered",
            TypeResolver::Fallback(_) => "fallback",
        }
    }

    pub fn resolve(&self, object: &Value, resource_type: &str) -> Option<GroupVersionKind> {
        match self {
            TypeResolver::Embedded => embedded_gvk(object),
            TypeResolver::Registered(types) => types.get(resource_type).cloned(),
            TypeResolver::Fallback(table) => table
                .iter()
                .find(|(rt, ..)| *rt == resource_type)
                .map(|(_, g, v, k)| GroupVersionKind::gvk(g, v, k)),
        }
    }
}

/// Registered types derived from the k8s-openapi type metadata
fn registered<K: k8s_openapi::Resource>(resource_type: &str) -> (String, GroupVersionKind) {
    (
        resource_type.to_string(),
        GroupVersionKind::gvk(K::GROUP, K::VERSION, K::KIND),
    )
}

fn builtin_registered_types() -> BTreeMap<String, GroupVersionKind> {
    BTreeMap::from([
        registered::<Deployment>("deployments"),
        registered::<StatefulSet>("statefulsets"),
        registered::<PersistentVolume>("persistentvolumes"),
        registered::<PersistentVolumeClaim>("persistentvolumeclaims"),
        registered::<ConfigMap>("configmaps"),
        registered::<Secret>("secrets"),
        registered::<StorageClass>("storageclasses"),
    ])
}

/// Split an apiVersion into (group, version)
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

fn embedded_gvk(object: &Value) -> Option<GroupVersionKind> {
    let api_version = object.get("apiVersion")?.as_str().filter(|s| !s.is_empty())?;
    let kind = object.get("kind")?.as_str().filter(|s| !s.is_empty())?;
    let (group, version) = split_api_version(api_version);
    Some(GroupVersionKind::gvk(group, version, kind))
}

// =============================================================================
// Resource Backup
// =============================================================================

/// Snapshot and restore of cluster objects
pub struct ResourceBackup {
    store: ObjectStoreRef,
    resolvers: Vec<TypeResolver>,
    retry: RetryPolicy,
}

impl ResourceBackup {
    /// Create a backup component with the default resolver chain
    pub fn new(store: ObjectStoreRef, config: BackupConfig) -> Self {
        let mut types = builtin_registered_types();
        types.extend(config.registered_types);

        Self {
            store,
            resolvers: vec![
                TypeResolver::Embedded,
                TypeResolver::Registered(types),
                TypeResolver::Fallback(WELL_KNOWN_TYPES),
            ],
            retry: config.retry,
        }
    }

    /// Resolve the full type identity of an object
    pub fn resolve_type(&self, object: &Value, resource_type: &str) -> Result<GroupVersionKind> {
        for resolver in &self.resolvers {
            if let Some(gvk) = resolver.resolve(object, resource_type) {
                debug!(
                    resource_type,
                    resolver = resolver.name(),
                    kind = %gvk.kind,
                    "Resolved type identity"
                );
                return Ok(gvk);
            }
        }
        Err(Error::TypeResolution {
            resource_type: resource_type.to_string(),
        })
    }

    /// Capture an object into a manifest. The caller persists it.
    pub fn snapshot<K: Serialize>(&self, object: &K, resource_type: &str) -> Result<BackupManifest> {
        let mut value = serde_json::to_value(object)?;
        let gvk = self.resolve_type(&value, resource_type)?;

        let body = value
            .as_object_mut()
            .ok_or_else(|| Error::Decode(format!("{} is not an object", resource_type)))?;
        body.insert("apiVersion".into(), Value::String(gvk.api_version()));
        body.insert("kind".into(), Value::String(gvk.kind.clone()));

        let metadata = body.get("metadata");
        let name = metadata
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Decode(format!("{} without metadata.name", gvk.kind)))?
            .to_string();
        let namespace = metadata
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let yaml = serde_yaml::to_string(&value)?;

        Ok(BackupManifest {
            resource_type: resource_type.to_string(),
            name,
            namespace,
            backup_data: STANDARD.encode(yaml),
            backup_time: chrono::Utc::now(),
        })
    }

    /// Decode a manifest into its type identity and object
    pub fn decode(manifest: &BackupManifest) -> Result<(GroupVersionKind, DynamicObject)> {
        let raw = STANDARD
            .decode(&manifest.backup_data)
            .map_err(|e| Error::Decode(format!("{}: {}", manifest.name, e)))?;
        let value: Value = serde_yaml::from_slice(&raw)
            .map_err(|e| Error::Decode(format!("{}: {}", manifest.name, e)))?;

        let gvk = embedded_gvk(&value).ok_or_else(|| {
            Error::Decode(format!("{}: missing apiVersion/kind", manifest.name))
        })?;
        let object: DynamicObject = serde_json::from_value(value)
            .map_err(|e| Error::Decode(format!("{}: {}", manifest.name, e)))?;

        Ok((gvk, object))
    }

    /// Write a manifest back: create if absent, otherwise replace using the
    /// live resourceVersion
    pub async fn upsert(&self, manifest: &BackupManifest) -> Result<()> {
        let (gvk, mut object) = Self::decode(manifest)?;
        let namespace = object.metadata.namespace.clone().filter(|ns| !ns.is_empty());

        let live = self
            .store
            .get(&gvk, namespace.as_deref(), &manifest.name)
            .await?;

        match live {
            None => {
                let meta = &mut object.metadata;
                meta.resource_version = None;
                meta.uid = None;
                meta.creation_timestamp = None;
                meta.managed_fields = None;
                meta.generation = None;

                self.store.create(&gvk, &object).await?;
                info!(
                    kind = %gvk.kind,
                    name = %manifest.name,
                    namespace = %manifest.namespace,
                    "Restored object (created)"
                );
            }
            Some(live) => {
                object.metadata.resource_version = live.metadata.resource_version;
                self.store.replace(&gvk, &object).await?;
                info!(
                    kind = %gvk.kind,
                    name = %manifest.name,
                    namespace = %manifest.namespace,
                    "Restored object (updated)"
                );
            }
        }
        Ok(())
    }

    /// [`upsert`](Self::upsert) with bounded exponential backoff
    pub async fn upsert_with_retry(&self, manifest: &BackupManifest) -> Result<()> {
        let policy = &self.retry;
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(policy.initial_interval)
            .with_multiplier(policy.multiplier)
            .with_randomization_factor(policy.randomization_factor)
            .with_max_interval(policy.max_interval)
            .with_max_elapsed_time(None)
            .build();
        backoff.reset();

        let attempts = AtomicU32::new(0);
        let attempts_ref = &attempts;
        let max_attempts = policy.max_attempts.max(1);

        let result = backoff::future::retry_notify(
            backoff,
            move || async move {
                let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
                match self.upsert(manifest).await {
                    Ok(()) => Ok(()),
                    Err(e) if attempt >= max_attempts => Err(backoff::Error::permanent(e)),
                    Err(e) => Err(backoff::Error::transient(e)),
                }
            },
            |e: Error, delay: Duration| {
                warn!(
                    name = %manifest.name,
                    error = %e,
                    retry_in = ?delay,
                    "Restore attempt failed"
                );
            },
        )
        .await;

        result.map_err(|e| Error::RetriesExhausted {
            attempts: attempts.load(Ordering::SeqCst),
            last: Box::new(e),
        })
    }

    /// Restore manifests last-captured-first, continuing past failures
    pub async fn restore_all(&self, manifests: &[BackupManifest]) -> Result<()> {
        let mut causes = Vec::new();

        for manifest in manifests.iter().rev() {
            if let Err(e) = self.upsert_with_retry(manifest).await {
                warn!(
                    resource_type = %manifest.resource_type,
                    name = %manifest.name,
                    error = %e,
                    "Restore failed, continuing"
                );
                causes.push(format!(
                    "{}/{}/{}: {}",
                    manifest.resource_type, manifest.namespace, manifest.name, e
                ));
            }
        }

        if causes.is_empty() {
            Ok(())
        } else {
            Err(Error::RestoreFailed {
                failed: causes.len(),
                total: manifests.len(),
                causes,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryObjectStore, StoreFault};
    use crate::domain::ports::ObjectStore;
    use assert_matches::assert_matches;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use kube::api::ObjectMeta;
    use serde_json::json;
    use std::sync::Arc;

    fn deployment(name: &str, replicas: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                resource_version: Some("5".into()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn backup_with(store: Arc<InMemoryObjectStore>) -> ResourceBackup {
        ResourceBackup::new(store, BackupConfig::default())
    }

    #[test]
    fn test_resolver_chain_order() {
        let backup = backup_with(InMemoryObjectStore::new());

        // embedded identity wins over the registered table
        let obj = json!({"apiVersion": "example.io/v2", "kind": "Widget", "metadata": {"name": "w"}});
        let gvk = backup.resolve_type(&obj, "deployments").unwrap();
        assert_eq!(gvk.api_version(), "example.io/v2");

        // no embedded identity: fall back to the registered table
        let gvk = backup.resolve_type(&json!({"metadata": {}}), "deployments").unwrap();
        assert_eq!((gvk.group.as_str(), gvk.kind.as_str()), ("apps", "Deployment"));

        let gvk = backup.resolve_type(&json!({}), "infrastructures").unwrap();
        assert_eq!(gvk.api_version(), "config.openshift.io/v1");

        assert_matches!(
            backup.resolve_type(&json!({}), "gizmos"),
            Err(Error::TypeResolution { .. })
        );
    }

    #[test]
    fn test_snapshot_embeds_type_identity() {
        let backup = backup_with(InMemoryObjectStore::new());
        let manifest = backup.snapshot(&deployment("web", 3), "deployments").unwrap();

        assert_eq!(manifest.name, "web");
        assert_eq!(manifest.namespace, "default");

        let (gvk, object) = ResourceBackup::decode(&manifest).unwrap();
        assert_eq!(gvk.api_version(), "apps/v1");
        assert_eq!(gvk.kind, "Deployment");
        assert_eq!(object.data["spec"]["replicas"], 3);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let manifest = BackupManifest {
            resource_type: "deployments".into(),
            name: "web".into(),
            namespace: "default".into(),
            backup_data: "!!not base64!!".into(),
            backup_time: chrono::Utc::now(),
        };
        assert_matches!(ResourceBackup::decode(&manifest), Err(Error::Decode(_)));
    }

    #[tokio::test]
    async fn test_upsert_creates_missing_object_without_resource_version() {
        let store = InMemoryObjectStore::new();
        let backup = backup_with(store.clone());
        let manifest = backup.snapshot(&deployment("web", 3), "deployments").unwrap();

        backup.upsert(&manifest).await.unwrap();

        let ops = store.operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].verb, "create");
        assert_eq!(ops[0].resource_version, None);
    }

    #[tokio::test]
    async fn test_upsert_uses_live_resource_version() {
        let store = InMemoryObjectStore::new();
        let backup = backup_with(store.clone());
        let manifest = backup.snapshot(&deployment("web", 3), "deployments").unwrap();

        // live object has moved on since the backup
        let gvk = GroupVersionKind::gvk("apps", "v1", "Deployment");
        store.seed(&gvk, serde_json::to_value(deployment("web", 0)).unwrap(), "9");

        backup.upsert(&manifest).await.unwrap();

        let last = store.operations().pop().unwrap();
        assert_eq!(last.verb, "replace");
        assert_eq!(last.resource_version.as_deref(), Some("9"));

        let live = store.get(&gvk, Some("default"), "web").await.unwrap().unwrap();
        assert_eq!(live.data["spec"]["replicas"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_with_retry_recovers() {
        let store = InMemoryObjectStore::new();
        let backup = backup_with(store.clone());
        let manifest = backup.snapshot(&deployment("web", 3), "deployments").unwrap();

        store.inject(StoreFault::Conflict, 2);
        backup.upsert_with_retry(&manifest).await.unwrap();
        assert_eq!(store.operations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_with_retry_gives_up_after_three_attempts() {
        let store = InMemoryObjectStore::new();
        let backup = backup_with(store.clone());
        let manifest = backup.snapshot(&deployment("web", 3), "deployments").unwrap();

        store.inject(StoreFault::Conflict, 10);
        let err = backup.upsert_with_retry(&manifest).await.unwrap_err();

        assert_matches!(err, Error::RetriesExhausted { attempts: 3, ref last } if matches!(**last, Error::Conflict { .. }));
        assert_eq!(store.faults_remaining(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_all_reverse_order_and_collects_errors() {
        let store = InMemoryObjectStore::new();
        let backup = backup_with(store.clone());
        let manifests: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|n| backup.snapshot(&deployment(n, 1), "deployments").unwrap())
            .collect();

        backup.restore_all(&manifests).await.unwrap();
        let order: Vec<_> = store.operations().into_iter().map(|op| op.name).collect();
        assert_eq!(order, vec!["c", "b", "a"]);

        // one manifest is undecodable; the others still restore
        let mut broken = manifests.clone();
        broken[1].backup_data = "%%%".into();
        let err = backup.restore_all(&broken).await.unwrap_err();
        assert_matches!(err, Error::RestoreFailed { failed: 1, total: 3, .. });
        assert_eq!(store.operations().len(), 5);
    }
}
