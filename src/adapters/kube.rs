//! Kubernetes adapters
//!
//! Workload accessor and schema-agnostic object store backed by a live
//! cluster through `kube`.

use crate::domain::ports::{ObjectStore, WorkloadAccessor, WorkloadKind, WorkloadRef};
use crate::error::{Error, Result};
use crate::migration::poll::{poll_until, PollOptions, PollStatus};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolume, PodTemplateSpec};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const FIELD_MANAGER: &str = "vcenter-migration-operator";

/// Map an API error status onto the store's error vocabulary
fn map_api_error(kind: &str, name: &str, error: kube::Error) -> Error {
    match error {
        kube::Error::Api(response) if response.code == 404 => Error::NotFoundAfterCheck {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(response) if response.code == 409 => Error::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
            reason: response.message,
        },
        other => Error::Kube(other),
    }
}

// =============================================================================
// Object Store
// =============================================================================

/// Object store over `Api<DynamicObject>`
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(gvk);
        match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        match self.api(gvk, namespace).get_opt(name).await {
            Ok(object) => Ok(object),
            Err(e) => Err(map_api_error(&gvk.kind, name, e)),
        }
    }

    async fn create(&self, gvk: &GroupVersionKind, object: &DynamicObject) -> Result<DynamicObject> {
        let name = object.name_any();
        self.api(gvk, object.metadata.namespace.as_deref())
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| map_api_error(&gvk.kind, &name, e))
    }

    async fn replace(&self, gvk: &GroupVersionKind, object: &DynamicObject) -> Result<DynamicObject> {
        let name = object.name_any();
        self.api(gvk, object.metadata.namespace.as_deref())
            .replace(&name, &PostParams::default(), object)
            .await
            .map_err(|e| map_api_error(&gvk.kind, &name, e))
    }
}

// =============================================================================
// Workload Accessor
// =============================================================================

/// Whether a pod template mounts `claim` directly
fn template_uses_claim(template: &PodTemplateSpec, claim: &str) -> bool {
    template
        .spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .map(|volumes| {
            volumes.iter().any(|v| {
                v.persistent_volume_claim
                    .as_ref()
                    .is_some_and(|pvc| pvc.claim_name == claim)
            })
        })
        .unwrap_or(false)
}

/// Whether `claim` was stamped out of one of the StatefulSet's claim
/// templates (`<template>-<statefulset>-<ordinal>`)
fn statefulset_owns_claim(sts: &StatefulSet, claim: &str) -> bool {
    let name = sts.name_any();
    sts.spec
        .as_ref()
        .and_then(|spec| spec.volume_claim_templates.as_ref())
        .map(|templates| {
            templates.iter().any(|t| {
                let prefix = format!("{}-{}-", t.name_any(), name);
                claim
                    .strip_prefix(&prefix)
                    .is_some_and(|ordinal| ordinal.parse::<u32>().is_ok())
            })
        })
        .unwrap_or(false)
}

/// Workload accessor over Deployments, StatefulSets and PersistentVolumes
pub struct KubeWorkloadAccessor {
    client: Client,
    /// How long to wait for a replaced PersistentVolume to go away
    pv_replace_timeout: Duration,
    /// Fires on shutdown and stops in-flight waits
    cancel: CancellationToken,
}

impl KubeWorkloadAccessor {
    pub fn new(client: Client, cancel: CancellationToken) -> Self {
        Self {
            client,
            pv_replace_timeout: Duration::from_secs(60),
            cancel,
        }
    }

    async fn wait_for_pv_deletion(&self, api: &Api<PersistentVolume>, name: &str) -> Result<()> {
        wait_for_deletion(
            &format!("PersistentVolume {}", name),
            self.pv_replace_timeout,
            &self.cancel,
            || async move { Ok(api.get_opt(name).await?.is_some()) },
        )
        .await
    }
}

/// Poll `exists` every second until it reports the object gone
async fn wait_for_deletion<F, Fut>(
    object: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    mut exists: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let operation = format!("{} deletion", object);
    let options = PollOptions::new(Duration::from_secs(1)).with_timeout(timeout);
    poll_until(&operation, options, cancel, move || {
        let query = exists();
        async move {
            if query.await? {
                Ok(PollStatus::Pending(None))
            } else {
                Ok(PollStatus::Ready(()))
            }
        }
    })
    .await
}

#[async_trait]
impl WorkloadAccessor for KubeWorkloadAccessor {
    async fn find_consumers(&self, claim_namespace: &str, claim_name: &str) -> Result<Vec<WorkloadRef>> {
        let mut consumers = Vec::new();

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), claim_namespace);
        for deployment in deployments.list(&ListParams::default()).await? {
            let Some(spec) = deployment.spec.as_ref() else {
                continue;
            };
            if template_uses_claim(&spec.template, claim_name) {
                consumers.push(WorkloadRef {
                    kind: WorkloadKind::Deployment,
                    name: deployment.name_any(),
                    namespace: claim_namespace.to_string(),
                    replicas: spec.replicas.unwrap_or(1),
                });
            }
        }

        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), claim_namespace);
        for sts in statefulsets.list(&ListParams::default()).await? {
            let Some(spec) = sts.spec.as_ref() else {
                continue;
            };
            if template_uses_claim(&spec.template, claim_name) || statefulset_owns_claim(&sts, claim_name) {
                consumers.push(WorkloadRef {
                    kind: WorkloadKind::StatefulSet,
                    name: sts.name_any(),
                    namespace: claim_namespace.to_string(),
                    replicas: spec.replicas.unwrap_or(1),
                });
            }
        }

        debug!(
            claim = claim_name,
            namespace = claim_namespace,
            consumers = consumers.len(),
            "Found claim consumers"
        );
        Ok(consumers)
    }

    async fn set_replicas(&self, kind: WorkloadKind, name: &str, namespace: &str, replicas: i32) -> Result<()> {
        let patch = json!({ "spec": { "replicas": replicas } });
        let params = PatchParams::apply(FIELD_MANAGER);
        let result = match kind {
            WorkloadKind::Deployment => Api::<Deployment>::namespaced(self.client.clone(), namespace)
                .patch(name, &params, &Patch::Merge(&patch))
                .await
                .map(|_| ()),
            WorkloadKind::StatefulSet => Api::<StatefulSet>::namespaced(self.client.clone(), namespace)
                .patch(name, &params, &Patch::Merge(&patch))
                .await
                .map(|_| ()),
        };
        result.map_err(|e| map_api_error(&kind.to_string(), name, e))?;

        debug!(kind = %kind, name, namespace, replicas, "Patched replicas");
        Ok(())
    }

    /// The CSI source of a PersistentVolume is immutable, so the object is
    /// recreated under the same name with the new handle. The claim
    /// reference is kept so the claim rebinds to it.
    async fn set_volume_handle(&self, pv_name: &str, handle: &str) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let current = api
            .get(pv_name)
            .await
            .map_err(|e| map_api_error("PersistentVolume", pv_name, e))?;

        let mut spec = current.spec.clone().ok_or_else(|| Error::ResourceNotFound {
            kind: "PersistentVolume spec".into(),
            name: pv_name.to_string(),
        })?;
        let csi = spec.csi.as_mut().ok_or_else(|| Error::ResourceNotFound {
            kind: "PersistentVolume CSI source".into(),
            name: pv_name.to_string(),
        })?;
        if csi.volume_handle == handle {
            return Ok(());
        }
        csi.volume_handle = handle.to_string();

        // deleting the object must not release the backing disk
        let retain = json!({
            "metadata": { "finalizers": null },
            "spec": { "persistentVolumeReclaimPolicy": "Retain" },
        });
        api.patch(pv_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&retain))
            .await
            .map_err(|e| map_api_error("PersistentVolume", pv_name, e))?;
        match api.delete(pv_name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 404 => {}
            Err(e) => return Err(map_api_error("PersistentVolume", pv_name, e)),
        }
        self.wait_for_pv_deletion(&api, pv_name).await?;

        if let Some(claim) = spec.claim_ref.as_mut() {
            claim.resource_version = None;
        }
        let replacement = PersistentVolume {
            metadata: kube::api::ObjectMeta {
                name: Some(pv_name.to_string()),
                labels: current.metadata.labels.clone(),
                annotations: current.metadata.annotations.clone(),
                ..Default::default()
            },
            spec: Some(spec),
            status: None,
        };
        api.create(&PostParams::default(), &replacement)
            .await
            .map_err(|e| map_api_error("PersistentVolume", pv_name, e))?;

        info!(pv = pv_name, handle, "Recreated PersistentVolume with new volume handle");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::StatefulSetSpec;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, PodSpec, Volume,
    };
    use assert_matches::assert_matches;
    use kube::api::ObjectMeta;
    use kube::core::ErrorResponse;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn template(claims: &[&str]) -> PodTemplateSpec {
        PodTemplateSpec {
            spec: Some(PodSpec {
                volumes: Some(
                    claims
                        .iter()
                        .map(|c| Volume {
                            name: format!("vol-{}", c),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: c.to_string(),
                                read_only: None,
                            }),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_template_uses_claim() {
        assert!(template_uses_claim(&template(&["data", "logs"]), "logs"));
        assert!(!template_uses_claim(&template(&["data"]), "other"));
        assert!(!template_uses_claim(&PodTemplateSpec::default(), "data"));
    }

    #[test]
    fn test_statefulset_claim_templates() {
        let sts = StatefulSet {
            metadata: ObjectMeta {
                name: Some("db".into()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                volume_claim_templates: Some(vec![PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some("data".into()),
                        ..Default::default()
                    },
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert!(statefulset_owns_claim(&sts, "data-db-0"));
        assert!(statefulset_owns_claim(&sts, "data-db-12"));
        assert!(!statefulset_owns_claim(&sts, "data-db-primary"));
        assert!(!statefulset_owns_claim(&sts, "data-web-0"));
    }

    #[test]
    fn test_api_error_mapping() {
        let response = |code: u16| {
            kube::Error::Api(ErrorResponse {
                status: "Failure".into(),
                message: "the object has been modified".into(),
                reason: String::new(),
                code,
            })
        };

        assert!(matches!(
            map_api_error("Deployment", "web", response(404)),
            Error::NotFoundAfterCheck { .. }
        ));
        assert!(matches!(
            map_api_error("Deployment", "web", response(409)),
            Error::Conflict { ref reason, .. } if reason == "the object has been modified"
        ));
        assert!(matches!(
            map_api_error("Deployment", "web", response(500)),
            Error::Kube(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_wait_ends_when_object_gone() {
        let queries = Arc::new(AtomicU32::new(0));
        let q = queries.clone();
        wait_for_deletion("PersistentVolume pv-1", Duration::from_secs(60), &CancellationToken::new(), move || {
            let q = q.clone();
            async move { Ok(q.fetch_add(1, Ordering::SeqCst) < 2) }
        })
        .await
        .unwrap();
        assert_eq!(queries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_wait_stops_on_shutdown() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let result = wait_for_deletion("PersistentVolume pv-1", Duration::from_secs(60), &cancel, || async {
            Ok(true)
        })
        .await;
        assert_matches!(result, Err(Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
