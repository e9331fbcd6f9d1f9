//! VCenterMigration controller
//!
//! One reconcile runs one migration pass: discover candidate volumes, drive
//! every non-terminal record through the orchestrator, optionally roll back
//! the workloads of failed volumes, and publish the outcome in the status.
//! Progress is checkpointed into the status after every volume step.

use crate::config::OperatorConfig;
use crate::crd::{
    BackupManifest, CsiVolumeMigrationStatus, MigrationPhase, PersistentVolumeMigrationState,
    VCenterEndpointSpec, VCenterMigration, VCenterMigrationSpec, VCenterMigrationStatus,
    VolumeMigrationStatus,
};
use crate::domain::ports::{EndpointConnectorRef, MigrationCheckpoint};
use crate::adapters::{KubeObjectStore, KubeWorkloadAccessor};
use crate::error::{Error, ErrorAction, Result};
use crate::migration::discovery::{discover_candidates, observe_candidates};
use crate::migration::metrics::MigrationMetrics;
use crate::migration::orchestrator::{MigrationConfig, VolumeMigrator};
use crate::migration::relocator::{Placement, RelocationTarget};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{PersistentVolume, Secret};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const FIELD_MANAGER: &str = "vcenter-migration-operator";

// =============================================================================
// Context
// =============================================================================

/// Shared reconciler state
pub struct Context {
    pub client: Client,
    pub connector: EndpointConnectorRef,
    pub config: OperatorConfig,
    pub metrics: Option<MigrationMetrics>,
    /// Fires on shutdown; in-flight passes stop at the next poll
    pub shutdown: CancellationToken,
}

/// Username and password read from a credentials secret
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Status Checkpoint
// =============================================================================

/// Persists progress by merge-patching the resource status
pub struct StatusCheckpoint {
    api: Api<VCenterMigration>,
    name: String,
}

impl StatusCheckpoint {
    pub fn new(api: Api<VCenterMigration>, name: impl Into<String>) -> Self {
        Self {
            api,
            name: name.into(),
        }
    }

    async fn patch(&self, status: serde_json::Value) -> Result<()> {
        self.api
            .patch_status(
                &self.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&json!({ "status": status })),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MigrationCheckpoint for StatusCheckpoint {
    async fn save(&self, status: &CsiVolumeMigrationStatus, backups: &[BackupManifest]) -> Result<()> {
        self.patch(json!({
            "csiVolumeMigration": status,
            "backups": backups,
        }))
        .await
    }
}

// =============================================================================
// Configuration Assembly
// =============================================================================

pub fn credentials_from_secret(secret: &Secret) -> Result<Credentials> {
    let name = secret.name_any();
    let field = |key: &str| -> Result<String> {
        let bytes = secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .ok_or_else(|| Error::Configuration(format!("secret {} has no {} key", name, key)))?;
        String::from_utf8(bytes.0.clone())
            .map_err(|_| Error::Configuration(format!("secret {} key {} is not UTF-8", name, key)))
    };

    Ok(Credentials {
        username: field("username")?,
        password: field("password")?,
    })
}

pub fn placement(endpoint: &VCenterEndpointSpec) -> Placement {
    Placement {
        datacenter: endpoint.datacenter.clone(),
        cluster: endpoint.cluster.clone(),
        folder: endpoint.folder.clone(),
        resource_pool: endpoint.resource_pool.clone(),
        datastore: endpoint.datastore.clone(),
    }
}

/// Orchestrator configuration for one migration resource
pub fn build_migration_config(
    operator: &OperatorConfig,
    spec: &VCenterMigrationSpec,
    target_credentials: &Credentials,
) -> Result<MigrationConfig> {
    if spec.cluster_id.trim().is_empty() {
        return Err(Error::Configuration("clusterId must not be empty".into()));
    }
    if spec.detach_timeout_secs == 0 {
        return Err(Error::Configuration("detachTimeoutSecs must be positive".into()));
    }

    let mut config = operator.migration_config();
    config.cluster_id = spec.cluster_id.clone();
    config.source = placement(&spec.source);
    config.worker_folder = spec
        .source
        .worker_folder
        .clone()
        .unwrap_or_else(|| spec.source.folder.clone());
    config.target = RelocationTarget {
        placement: placement(&spec.target),
        username: target_credentials.username.clone(),
        password: target_credentials.password.clone(),
        thumbprint: spec.target.thumbprint.clone(),
    };
    config.detach_timeout = Duration::from_secs(spec.detach_timeout_secs);
    config.cns.vsphere_user = target_credentials.username.clone();
    Ok(config)
}

// =============================================================================
// Migration Pass
// =============================================================================

/// Run one pass over `status`: merge new candidates, migrate, roll back
/// failed volumes when asked to, and set the phase and message.
///
/// Volume failures are recorded in the status and do not fail the pass;
/// only cancellation and errors outside the per-volume machinery do.
pub async fn run_pass(
    migrator: &VolumeMigrator,
    status: &mut VCenterMigrationStatus,
    candidates: Vec<PersistentVolumeMigrationState>,
    restore_workloads_on_failure: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let added = observe_candidates(&mut status.csi_volume_migration, candidates);
    if added > 0 {
        info!(added, "Discovered new candidate volumes");
    }
    status.phase = MigrationPhase::Running;

    match migrator
        .migrate_all(&mut status.csi_volume_migration, &mut status.backups, cancel)
        .await
    {
        Ok(()) => {}
        Err(Error::BatchFailed { failed, total, .. }) => {
            warn!(failed, total, "Migration pass finished with failed volumes")
        }
        Err(e) => return Err(e),
    }

    if restore_workloads_on_failure {
        rollback_failed(migrator, status).await;
    }

    let csi = &status.csi_volume_migration;
    status.phase = if csi.failed_volumes == 0 {
        MigrationPhase::Completed
    } else {
        MigrationPhase::CompletedWithFailures
    };
    status.message = Some(format!(
        "{} of {} volumes migrated, {} failed",
        csi.migrated_volumes, csi.total_volumes, csi.failed_volumes
    ));
    status.last_reconcile_time = Some(Utc::now());
    Ok(())
}

async fn rollback_failed(migrator: &VolumeMigrator, status: &mut VCenterMigrationStatus) {
    let backups = status.backups.clone();
    for state in status
        .csi_volume_migration
        .volumes
        .iter_mut()
        .filter(|v| v.status == VolumeMigrationStatus::Failed && !v.workloads_restored)
    {
        match migrator.rollback(state, &backups).await {
            Ok(()) => state.workloads_restored = true,
            Err(e) => warn!(volume = %state.pv_name, error = %e, "Rollback failed, will retry"),
        }
    }
}

// =============================================================================
// Reconciler
// =============================================================================

async fn read_credentials(client: &Client, namespace: &str, secret: &str) -> Result<Credentials> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = api.get_opt(secret).await?.ok_or_else(|| Error::ResourceNotFound {
        kind: "Secret".into(),
        name: format!("{}/{}", namespace, secret),
    })?;
    credentials_from_secret(&secret)
}

/// Reconcile a VCenterMigration
pub async fn reconcile(migration: Arc<VCenterMigration>, ctx: Arc<Context>) -> Result<Action> {
    let name = migration.name_any();
    let namespace = migration.namespace().unwrap_or_else(|| "default".to_string());
    let spec = &migration.spec;
    info!(migration = %name, namespace = %namespace, "Reconciling VCenterMigration");

    let source_credentials = read_credentials(&ctx.client, &namespace, &spec.source.credentials_secret).await?;
    let target_credentials = read_credentials(&ctx.client, &namespace, &spec.target.credentials_secret).await?;
    let config = build_migration_config(&ctx.config, spec, &target_credentials)?;

    let source = ctx
        .connector
        .connect(&spec.source.server, &source_credentials.username, &source_credentials.password)
        .await?;
    let target = ctx
        .connector
        .connect(&spec.target.server, &target_credentials.username, &target_credentials.password)
        .await?;

    let pvs: Api<PersistentVolume> = Api::all(ctx.client.clone());
    let pvs = pvs.list(&ListParams::default()).await?.items;
    let candidates = discover_candidates(&pvs, &config.csi_driver, &spec.volumes);

    let api: Api<VCenterMigration> = Api::namespaced(ctx.client.clone(), &namespace);
    let checkpoint = Arc::new(StatusCheckpoint::new(api.clone(), name.clone()));
    let mut migrator = VolumeMigrator::new(
        source,
        target,
        Arc::new(KubeWorkloadAccessor::new(ctx.client.clone(), ctx.shutdown.clone())),
        Arc::new(KubeObjectStore::new(ctx.client.clone())),
        checkpoint.clone(),
        config,
    );
    if let Some(metrics) = &ctx.metrics {
        migrator = migrator.with_metrics(metrics.clone());
    }

    let mut status = migration.status.clone().unwrap_or_default();
    let outcome = run_pass(
        &migrator,
        &mut status,
        candidates,
        spec.restore_workloads_on_failure,
        &ctx.shutdown,
    )
    .await;

    // progress made before an error or shutdown is kept
    checkpoint.patch(serde_json::to_value(&status)?).await?;
    outcome?;
    info!(
        migration = %name,
        phase = %status.phase,
        migrated = status.csi_volume_migration.migrated_volumes,
        failed = status.csi_volume_migration.failed_volumes,
        "Migration pass complete"
    );

    Ok(Action::requeue(ctx.config.requeue_interval()))
}

/// Requeue policy for failed reconciles
pub fn error_policy(migration: Arc<VCenterMigration>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        error = %error,
        migration = %migration.name_any(),
        transient = error.is_transient(),
        "Reconciliation failed"
    );

    match error.action() {
        ErrorAction::RequeueWithBackoff => Action::requeue(Duration::from_secs(15)),
        ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn endpoint(server: &str, dc: &str) -> VCenterEndpointSpec {
        VCenterEndpointSpec {
            server: server.into(),
            datacenter: dc.into(),
            cluster: "cluster".into(),
            folder: "vcm".into(),
            resource_pool: "Resources".into(),
            datastore: "ds".into(),
            worker_folder: None,
            credentials_secret: "creds".into(),
            thumbprint: None,
        }
    }

    fn spec() -> VCenterMigrationSpec {
        VCenterMigrationSpec {
            source: endpoint("https://vc1/sdk", "dc1"),
            target: endpoint("https://vc2/sdk", "dc2"),
            cluster_id: "cluster-a".into(),
            volumes: vec![],
            detach_timeout_secs: 60,
            restore_workloads_on_failure: false,
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "admin".into(),
            password: "secret".into(),
        }
    }

    #[test]
    fn test_credentials_from_secret() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("creds".into()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                ("username".to_string(), ByteString(b"admin".to_vec())),
                ("password".to_string(), ByteString(b"secret".to_vec())),
            ])),
            ..Default::default()
        };
        let creds = credentials_from_secret(&secret).unwrap();
        assert_eq!(creds, credentials());
        assert!(!format!("{:?}", creds).contains("secret"));

        let empty = Secret::default();
        assert!(matches!(credentials_from_secret(&empty), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_build_migration_config() {
        let config = build_migration_config(&OperatorConfig::default(), &spec(), &credentials()).unwrap();
        assert_eq!(config.cluster_id, "cluster-a");
        assert_eq!(config.source.datacenter, "dc1");
        assert_eq!(config.worker_folder, "vcm");
        assert_eq!(config.target.placement.datacenter, "dc2");
        assert_eq!(config.target.username, "admin");
        assert_eq!(config.detach_timeout, Duration::from_secs(60));
        assert_eq!(config.cns.vsphere_user, "admin");

        let mut with_workers = spec();
        with_workers.source.worker_folder = Some("workers".into());
        let config = build_migration_config(&OperatorConfig::default(), &with_workers, &credentials()).unwrap();
        assert_eq!(config.worker_folder, "workers");

        let mut bad = spec();
        bad.cluster_id = " ".into();
        assert!(matches!(
            build_migration_config(&OperatorConfig::default(), &bad, &credentials()),
            Err(Error::Configuration(_))
        ));
    }
}
