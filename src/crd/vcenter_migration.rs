//! VCenterMigration CRD
//!
//! Describes a move of the cluster's vSphere-backed persistent volumes from
//! one vCenter to another. The status carries the only state that must
//! survive a restart: the per-volume migration records, their aggregate
//! counts and the backup manifests captured along the way.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::domain::ports::WorkloadKind;

// =============================================================================
// VCenterMigration CRD
// =============================================================================

/// VCenterMigration relocates the block storage of a running cluster from a
/// source vCenter to a target vCenter, one volume at a time.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "migration.billyronks.io",
    version = "v1",
    kind = "VCenterMigration",
    plural = "vcentermigrations",
    shortname = "vcm",
    status = "VCenterMigrationStatus",
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Total", "type": "integer", "jsonPath": ".status.csiVolumeMigration.totalVolumes"}"#,
    printcolumn = r#"{"name": "Migrated", "type": "integer", "jsonPath": ".status.csiVolumeMigration.migratedVolumes"}"#,
    printcolumn = r#"{"name": "Failed", "type": "integer", "jsonPath": ".status.csiVolumeMigration.failedVolumes"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VCenterMigrationSpec {
    /// vCenter currently backing the cluster
    pub source: VCenterEndpointSpec,

    /// vCenter the volumes move to
    pub target: VCenterEndpointSpec,

    /// Cluster identity recorded on registered CNS volumes
    pub cluster_id: String,

    /// Restrict the migration to these PersistentVolume names (empty = all)
    #[serde(default)]
    pub volumes: Vec<String>,

    /// How long to wait for a disk to detach from worker VMs
    #[serde(default = "default_detach_timeout_secs")]
    pub detach_timeout_secs: u64,

    /// Restore the captured workloads of failed volumes
    #[serde(default)]
    pub restore_workloads_on_failure: bool,
}

/// Location and credentials of one vCenter
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VCenterEndpointSpec {
    /// SDK URL, e.g. `https://vc1.example.com/sdk`
    pub server: String,

    /// Datacenter inventory path
    pub datacenter: String,

    /// Compute cluster path
    pub cluster: String,

    /// Folder receiving carrier VMs
    pub folder: String,

    /// Resource pool path
    pub resource_pool: String,

    /// Datastore name
    pub datastore: String,

    /// Folder holding the cluster's worker VMs
    #[serde(default)]
    pub worker_folder: Option<String>,

    /// Secret (same namespace) with `username` and `password` keys
    pub credentials_secret: String,

    /// SHA-256 TLS thumbprint; fetched from the server when absent
    #[serde(default)]
    pub thumbprint: Option<String>,
}

fn default_detach_timeout_secs() -> u64 {
    300
}

// =============================================================================
// Status
// =============================================================================

/// Status of the VCenterMigration
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VCenterMigrationStatus {
    /// Current phase
    #[serde(default)]
    pub phase: MigrationPhase,

    /// Summary of the last pass
    #[serde(default)]
    pub message: Option<String>,

    /// Per-volume records and aggregate counts
    #[serde(default)]
    pub csi_volume_migration: CsiVolumeMigrationStatus,

    /// Objects captured before they were modified
    #[serde(default)]
    pub backups: Vec<BackupManifest>,

    /// Last reconcile time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_reconcile_time: Option<DateTime<Utc>>,
}

/// Overall migration phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum MigrationPhase {
    #[default]
    Pending,
    Running,
    Completed,
    CompletedWithFailures,
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationPhase::Pending => write!(f, "Pending"),
            MigrationPhase::Running => write!(f, "Running"),
            MigrationPhase::Completed => write!(f, "Completed"),
            MigrationPhase::CompletedWithFailures => write!(f, "CompletedWithFailures"),
        }
    }
}

/// Aggregate CSI volume migration status.
///
/// The counters are always derived from `volumes` by [`recompute`](Self::recompute).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CsiVolumeMigrationStatus {
    #[serde(default)]
    pub total_volumes: u32,

    #[serde(default)]
    pub migrated_volumes: u32,

    #[serde(default)]
    pub failed_volumes: u32,

    #[serde(default)]
    pub volumes: Vec<PersistentVolumeMigrationState>,
}

impl CsiVolumeMigrationStatus {
    /// Recount totals from the per-volume records
    pub fn recompute(&mut self) {
        self.total_volumes = self.volumes.len() as u32;
        self.migrated_volumes = self
            .volumes
            .iter()
            .filter(|v| v.status == VolumeMigrationStatus::Complete)
            .count() as u32;
        self.failed_volumes = self
            .volumes
            .iter()
            .filter(|v| v.status == VolumeMigrationStatus::Failed)
            .count() as u32;
    }

    /// Add a record for a volume seen for the first time; existing records
    /// are left untouched. Returns whether the record was added.
    pub fn observe(&mut self, state: PersistentVolumeMigrationState) -> bool {
        if self.volumes.iter().any(|v| v.pv_name == state.pv_name) {
            return false;
        }
        self.volumes.push(state);
        self.recompute();
        true
    }

    pub fn volume(&self, pv_name: &str) -> Option<&PersistentVolumeMigrationState> {
        self.volumes.iter().find(|v| v.pv_name == pv_name)
    }
}

/// Per-volume migration state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum VolumeMigrationStatus {
    #[default]
    Pending,
    Quiesced,
    Relocating,
    Relocated,
    Registered,
    Complete,
    Failed,
}

impl VolumeMigrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VolumeMigrationStatus::Complete | VolumeMigrationStatus::Failed
        )
    }

    /// Forward edges of the state machine; any live state may fail
    pub fn can_transition_to(&self, next: VolumeMigrationStatus) -> bool {
        use VolumeMigrationStatus::*;
        match (self, next) {
            (Complete, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Pending, Quiesced)
            | (Quiesced, Relocating)
            | (Relocating, Relocated)
            | (Relocated, Registered)
            | (Registered, Complete) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for VolumeMigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VolumeMigrationStatus::Pending => "Pending",
            VolumeMigrationStatus::Quiesced => "Quiesced",
            VolumeMigrationStatus::Relocating => "Relocating",
            VolumeMigrationStatus::Relocated => "Relocated",
            VolumeMigrationStatus::Registered => "Registered",
            VolumeMigrationStatus::Complete => "Complete",
            VolumeMigrationStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// A workload paused to quiesce I/O on a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaledDownResource {
    pub kind: WorkloadKind,
    pub name: String,
    pub namespace: String,
    pub original_replicas: i32,
}

/// Migration record for one PersistentVolume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeMigrationState {
    /// PersistentVolume name (unique key)
    pub pv_name: String,

    #[serde(default)]
    pub pvc_name: String,

    #[serde(default)]
    pub pvc_namespace: String,

    pub source_volume_handle: String,

    #[serde(default)]
    pub target_volume_handle: Option<String>,

    #[serde(default)]
    pub status: VolumeMigrationStatus,

    /// Never cleared once populated, so workloads can always be resumed
    #[serde(default)]
    pub scaled_down_resources: Vec<ScaledDownResource>,

    #[serde(default)]
    pub message: Option<String>,

    /// Name of the carrier VM moving this volume
    #[serde(default)]
    pub carrier_vm: Option<String>,

    /// Relocation task issued for the carrier VM; a resumed pass polls it
    /// instead of issuing another
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relocation_task: Option<String>,

    /// Set once the rollback pass has restored this volume's workloads
    #[serde(default)]
    pub workloads_restored: bool,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl PersistentVolumeMigrationState {
    /// New pending record
    pub fn pending(
        pv_name: impl Into<String>,
        pvc_namespace: impl Into<String>,
        pvc_name: impl Into<String>,
        source_volume_handle: impl Into<String>,
    ) -> Self {
        Self {
            pv_name: pv_name.into(),
            pvc_name: pvc_name.into(),
            pvc_namespace: pvc_namespace.into(),
            source_volume_handle: source_volume_handle.into(),
            ..Default::default()
        }
    }

    /// Move to the next state; returns false if the edge does not exist
    pub fn advance(&mut self, next: VolumeMigrationStatus, message: impl Into<String>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.message = Some(message.into());
        self.last_transition_time = Some(Utc::now());
        true
    }

    /// Mark the record failed; scaled-down resources are kept as they are
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = VolumeMigrationStatus::Failed;
        self.message = Some(message.into());
        self.last_transition_time = Some(Utc::now());
    }
}

/// Snapshot of one cluster object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub resource_type: String,
    pub name: String,
    /// Empty for cluster-scoped objects
    #[serde(default)]
    pub namespace: String,
    /// Base64 of the YAML-serialized object including apiVersion and kind
    pub backup_data: String,
    #[schemars(with = "String")]
    pub backup_time: DateTime<Utc>,
}

impl BackupManifest {
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.resource_type, &self.name, &self.namespace)
    }
}

/// Insert a manifest, replacing any existing one with the same key in place
pub fn upsert_backup(backups: &mut Vec<BackupManifest>, manifest: BackupManifest) {
    if let Some(existing) = backups.iter_mut().find(|b| b.key() == manifest.key()) {
        *existing = manifest;
    } else {
        backups.push(manifest);
    }
}
