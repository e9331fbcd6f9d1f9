//! Per-Volume Migration Orchestrator
//!
//! Drives one state machine per volume:
//!
//! ```text
//! Pending -> Quiesced -> Relocating -> Relocated -> Registered -> Complete
//!     \__________\___________\____________\____________\-------> Failed
//! ```
//!
//! Every step is checkpointed, so a pass interrupted at any point resumes
//! from the last recorded state. A step either transitions the record or
//! records progress inside its state: each consumer's replica count is saved
//! before anything is scaled down, and the relocation task is saved before it
//! is polled. A failed volume keeps its `scaled_down_resources` for the
//! rollback pass and never stops the batch.

use crate::crd::{
    upsert_backup, BackupManifest, CsiVolumeMigrationStatus, PersistentVolumeMigrationState,
    ScaledDownResource, VolumeMigrationStatus,
};
use crate::domain::ports::{
    EndpointRef, Inventory, MigrationCheckpointRef, ObjectStoreRef, TaskRef, VirtualDevice,
    VmOperations, VmRef, WorkloadAccessorRef, WorkloadRef,
};
use crate::error::{Error, Result};
use crate::migration::backup::{BackupConfig, ResourceBackup};
use crate::migration::cns::{CnsConfig, CnsRegistrar};
use crate::migration::discovery::VSPHERE_CSI_DRIVER;
use crate::migration::fcd::{DiskObjectConfig, DiskObjectManager};
use crate::migration::metrics::MigrationMetrics;
use crate::migration::paths::{build_volume_handle, parse_volume_handle};
use crate::migration::relocator::{
    CarrierVmConfig, Placement, RelocationTarget, Relocator, RelocatorConfig, Side,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a migration between two vCenters
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Cluster identity recorded on registered CNS volumes
    pub cluster_id: String,
    /// Where carrier VMs are created
    pub source: Placement,
    /// Folder holding the cluster's worker VMs at the source
    pub worker_folder: String,
    pub target: RelocationTarget,
    /// How long to wait for workloads to release a disk
    pub detach_timeout: Duration,
    /// CSI driver whose volumes are migration candidates
    pub csi_driver: String,
    pub disk: DiskObjectConfig,
    pub relocator: RelocatorConfig,
    pub backup: BackupConfig,
    pub cns: CnsConfig,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            source: Placement::default(),
            worker_folder: String::new(),
            target: RelocationTarget::default(),
            detach_timeout: Duration::from_secs(300),
            csi_driver: VSPHERE_CSI_DRIVER.to_string(),
            disk: DiskObjectConfig::default(),
            relocator: RelocatorConfig::default(),
            backup: BackupConfig::default(),
            cns: CnsConfig::default(),
        }
    }
}

// =============================================================================
// Volume Migrator
// =============================================================================

/// Runs volume state machines between one source and one target vCenter
pub struct VolumeMigrator {
    config: MigrationConfig,
    source_disks: DiskObjectManager,
    target_disks: DiskObjectManager,
    relocator: Relocator,
    cns: CnsRegistrar,
    backup: ResourceBackup,
    workloads: WorkloadAccessorRef,
    store: ObjectStoreRef,
    checkpoint: MigrationCheckpointRef,
    metrics: Option<MigrationMetrics>,
}

impl VolumeMigrator {
    pub fn new(
        source: EndpointRef,
        target: EndpointRef,
        workloads: WorkloadAccessorRef,
        store: ObjectStoreRef,
        checkpoint: MigrationCheckpointRef,
        config: MigrationConfig,
    ) -> Self {
        Self {
            source_disks: DiskObjectManager::new(source.clone(), config.disk.clone()),
            target_disks: DiskObjectManager::new(target.clone(), config.disk.clone()),
            relocator: Relocator::new(source, target.clone(), config.relocator.clone()),
            cns: CnsRegistrar::new(target, config.cns.clone()),
            backup: ResourceBackup::new(store.clone(), config.backup.clone()),
            workloads,
            store,
            checkpoint,
            metrics: None,
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: MigrationMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn source(&self) -> &EndpointRef {
        self.relocator.endpoint(Side::Source)
    }

    fn target(&self) -> &EndpointRef {
        self.relocator.endpoint(Side::Target)
    }

    // -------------------------------------------------------------------------
    // Batch
    // -------------------------------------------------------------------------

    /// Drive every non-terminal volume to a terminal state.
    ///
    /// One volume failing does not stop the others. Counts are recomputed
    /// from the records at the end and every failed volume is reported in a
    /// single `BatchFailed`.
    pub async fn migrate_all(
        &self,
        status: &mut CsiVolumeMigrationStatus,
        backups: &mut Vec<BackupManifest>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        status.recompute();
        info!(
            total = status.total_volumes,
            migrated = status.migrated_volumes,
            failed = status.failed_volumes,
            "Starting volume migration pass"
        );

        for index in 0..status.volumes.len() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.migrate_volume(status, index, backups, cancel).await {
                Ok(()) => {}
                Err(e @ (Error::Cancelled | Error::CheckpointFailed { .. })) => return Err(e),
                Err(e) => debug!(index, error = %e, "Volume failed, continuing with the rest"),
            }
        }

        status.recompute();
        info!(
            total = status.total_volumes,
            migrated = status.migrated_volumes,
            failed = status.failed_volumes,
            "Volume migration pass finished"
        );

        let details: Vec<String> = status
            .volumes
            .iter()
            .filter(|v| v.status == VolumeMigrationStatus::Failed)
            .map(|v| format!("{}: {}", v.pv_name, v.message.as_deref().unwrap_or("failed")))
            .collect();

        if details.is_empty() {
            Ok(())
        } else {
            Err(Error::BatchFailed {
                failed: details.len(),
                total: status.volumes.len(),
                details,
            })
        }
    }

    /// Drive the volume at `index` until it is terminal, checkpointing after
    /// every step. Cancellation leaves the record where it was.
    ///
    /// While the record is still `Pending` a failed checkpoint stops the pass
    /// with `CheckpointFailed`: no consumer is scaled down before its replica
    /// count is durable.
    pub async fn migrate_volume(
        &self,
        status: &mut CsiVolumeMigrationStatus,
        index: usize,
        backups: &mut Vec<BackupManifest>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let outcome = {
                let state = status
                    .volumes
                    .get_mut(index)
                    .ok_or_else(|| Error::Internal(format!("no volume record at {}", index)))?;
                if state.status.is_terminal() {
                    return Ok(());
                }

                let before = state.clone();
                match self.step(state, backups, cancel).await {
                    Ok(()) if *state == before => Err(Error::Internal(format!(
                        "volume {} made no progress from {}",
                        state.pv_name, before.status
                    ))),
                    Ok(()) if state.status == before.status => {
                        debug!(volume = %state.pv_name, status = %state.status, "Volume progress recorded");
                        Ok(())
                    }
                    Ok(()) => {
                        info!(volume = %state.pv_name, from = %before.status, to = %state.status, "Volume transitioned");
                        if state.status == VolumeMigrationStatus::Complete {
                            if let Some(m) = &self.metrics {
                                m.record_completed();
                            }
                        }
                        Ok(())
                    }
                    Err(Error::Cancelled) => {
                        info!(volume = %state.pv_name, status = %state.status, "Migration cancelled");
                        Err(Error::Cancelled)
                    }
                    Err(e) => Err(e),
                }
            };

            match &outcome {
                Ok(()) | Err(Error::Cancelled) => {}
                Err(e) => {
                    if let Some(state) = status.volumes.get_mut(index) {
                        warn!(
                            volume = %state.pv_name,
                            status = %state.status,
                            scaled_down = state.scaled_down_resources.len(),
                            error = %e,
                            "Volume migration failed"
                        );
                        state.fail(e.to_string());
                    }
                    if let Some(m) = &self.metrics {
                        m.record_failed();
                    }
                    self.log_failed_calls();
                }
            }

            status.recompute();
            let saved = self.checkpoint.save(status, backups).await;
            if let Err(e) = &saved {
                warn!(error = %e, "Failed to checkpoint migration status");
            }
            outcome?;

            if let (Err(e), Some(state)) = (saved, status.volumes.get(index)) {
                if state.status == VolumeMigrationStatus::Pending {
                    return Err(Error::CheckpointFailed {
                        volume: state.pv_name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn log_failed_calls(&self) {
        for (side, endpoint) in [("source", self.source()), ("target", self.target())] {
            for record in endpoint.audit_log().iter().filter(|r| !r.success) {
                debug!(
                    endpoint = side,
                    method = %record.method,
                    duration = ?record.duration,
                    "Failed vCenter call"
                );
            }
        }
    }

    /// Perform the single transition out of the record's current state
    async fn step(
        &self,
        state: &mut PersistentVolumeMigrationState,
        backups: &mut Vec<BackupManifest>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match state.status {
            VolumeMigrationStatus::Pending => self.quiesce(state, backups, cancel).await,
            VolumeMigrationStatus::Quiesced => self.prepare_carrier(state, cancel).await,
            VolumeMigrationStatus::Relocating => self.relocate(state, cancel).await,
            VolumeMigrationStatus::Relocated => self.register(state, cancel).await,
            VolumeMigrationStatus::Registered => self.complete(state, cancel).await,
            VolumeMigrationStatus::Complete | VolumeMigrationStatus::Failed => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Pending -> Quiesced
    // -------------------------------------------------------------------------

    /// Record one unrecorded consumer per call; once every consumer is
    /// recorded, scale them all down, wait for the disk to detach and pass
    /// the gate.
    async fn quiesce(
        &self,
        state: &mut PersistentVolumeMigrationState,
        backups: &mut Vec<BackupManifest>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let disk_id = parse_volume_handle(&state.source_volume_handle)?;
        let consumers = self
            .workloads
            .find_consumers(&state.pvc_namespace, &state.pvc_name)
            .await?;

        let unrecorded = consumers.into_iter().find(|workload| {
            !state.scaled_down_resources.iter().any(|r| {
                r.kind == workload.kind && r.name == workload.name && r.namespace == workload.namespace
            })
        });
        if let Some(workload) = unrecorded {
            self.snapshot_workload(&workload, backups).await?;
            info!(
                volume = %state.pv_name,
                kind = %workload.kind,
                workload = %workload.name,
                replicas = workload.replicas,
                "Recorded consumer"
            );
            state.scaled_down_resources.push(ScaledDownResource {
                kind: workload.kind,
                name: workload.name,
                namespace: workload.namespace,
                original_replicas: workload.replicas,
            });
            return Ok(());
        }

        for resource in &state.scaled_down_resources {
            self.workloads
                .set_replicas(resource.kind, &resource.name, &resource.namespace, 0)
                .await?;
            info!(
                volume = %state.pv_name,
                kind = %resource.kind,
                workload = %resource.name,
                "Scaled down consumer"
            );
        }

        self.source_disks
            .wait_until_detached(
                &self.config.source.datacenter,
                &self.config.worker_folder,
                &disk_id,
                self.config.detach_timeout,
                cancel,
            )
            .await?;
        self.verify_workers_detached(&disk_id, None).await?;

        transition(state, VolumeMigrationStatus::Quiesced, "consumers scaled down and disk detached")
    }

    async fn snapshot_workload(&self, workload: &WorkloadRef, backups: &mut Vec<BackupManifest>) -> Result<()> {
        let resource_type = workload.kind.resource_type();
        let gvk = self.backup.resolve_type(&json!({}), resource_type)?;

        match self
            .store
            .get(&gvk, Some(&workload.namespace), &workload.name)
            .await?
        {
            Some(object) => {
                let manifest = self.backup.snapshot(&object, resource_type)?;
                upsert_backup(backups, manifest);
                debug!(kind = %workload.kind, workload = %workload.name, "Captured workload backup");
            }
            None => warn!(
                kind = %workload.kind,
                workload = %workload.name,
                "Workload not readable for backup, relying on recorded replicas"
            ),
        }
        Ok(())
    }

    /// Gate: no worker VM may still hold the disk.
    ///
    /// The carrier is skipped; it shares the worker folder when none is
    /// configured separately.
    async fn verify_workers_detached(&self, disk_id: &str, carrier: Option<&VmRef>) -> Result<()> {
        let source = self.source();
        let dc = source.find_datacenter(&self.config.source.datacenter).await?;
        let folder = source.find_folder(&dc, &self.config.worker_folder).await?;
        for vm in source.list_vms(&folder).await? {
            if carrier.is_some_and(|c| c.moref == vm.moref) {
                continue;
            }
            self.source_disks.verify_not_attached(&vm, disk_id).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Quiesced -> Relocating
    // -------------------------------------------------------------------------

    async fn prepare_carrier(
        &self,
        state: &mut PersistentVolumeMigrationState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let disk_id = parse_volume_handle(&state.source_volume_handle)?;
        let disk = self.source_disks.lookup(&disk_id).await?;
        let datastore = self
            .source()
            .list_datastores()
            .await?
            .into_iter()
            .find(|d| d.moref == disk.datastore)
            .ok_or_else(|| Error::InventoryNotFound {
                kind: "Datastore".into(),
                path: disk.datastore.to_string(),
            })?;

        let existing = match &state.carrier_vm {
            Some(name) => self.relocator.find_vm(Side::Source, &self.config.source, name).await?,
            None => None,
        };
        let carrier = match existing {
            Some(vm) => vm,
            None => {
                self.relocator
                    .create_carrier_vm(
                        &CarrierVmConfig {
                            name: state.carrier_vm.clone(),
                            placement: self.config.source.clone(),
                            ..Default::default()
                        },
                        cancel,
                    )
                    .await?
            }
        };
        state.carrier_vm = Some(carrier.name.clone());

        if !self.source_disks.is_attached_to_vm(&carrier, &disk_id).await? {
            let controller = self.relocator.find_scsi_controller(Side::Source, &carrier).await?;
            let unit = self
                .relocator
                .find_free_scsi_unit(Side::Source, &carrier, controller)
                .await?;
            self.source_disks
                .attach(&carrier, &datastore, &disk_id, controller, unit, cancel)
                .await?;
        }

        transition(
            state,
            VolumeMigrationStatus::Relocating,
            format!("disk attached to carrier VM {}", carrier.name),
        )
    }

    // -------------------------------------------------------------------------
    // Relocating -> Relocated
    // -------------------------------------------------------------------------

    /// Issue the relocation and record its task, or poll the recorded task
    async fn relocate(&self, state: &mut PersistentVolumeMigrationState, cancel: &CancellationToken) -> Result<()> {
        let carrier_name = carrier_name(state)?;
        let target = &self.config.target;

        if self
            .relocator
            .find_vm(Side::Target, &target.placement, &carrier_name)
            .await?
            .is_some()
        {
            info!(volume = %state.pv_name, vm = %carrier_name, "Carrier already at target");
            return transition(state, VolumeMigrationStatus::Relocated, "carrier VM found at target");
        }

        let Some(task) = state.relocation_task.clone() else {
            let carrier = self
                .relocator
                .find_vm(Side::Source, &self.config.source, &carrier_name)
                .await?
                .ok_or_else(|| Error::InventoryNotFound {
                    kind: "VirtualMachine".into(),
                    path: format!("{}/{}", self.config.source.folder, carrier_name),
                })?;

            let disk_id = parse_volume_handle(&state.source_volume_handle)?;
            self.verify_workers_detached(&disk_id, Some(&carrier)).await?;

            let task = self.relocator.start_relocation(&carrier, target).await?;
            state.relocation_task = Some(task.0);
            return Ok(());
        };

        info!(volume = %state.pv_name, vm = %carrier_name, task = %task, "Waiting for relocation");
        let started = Instant::now();
        let relocated = self
            .relocator
            .await_relocation(&carrier_name, &TaskRef(task), &target.placement, cancel)
            .await?;
        if let Some(m) = &self.metrics {
            m.observe_relocation(started.elapsed());
        }

        transition(
            state,
            VolumeMigrationStatus::Relocated,
            format!("carrier VM {} relocated to {}", relocated.name, self.target().url()),
        )
    }

    // -------------------------------------------------------------------------
    // Relocated -> Registered
    // -------------------------------------------------------------------------

    async fn carrier_at_target(&self, state: &PersistentVolumeMigrationState) -> Result<Option<VmRef>> {
        let name = carrier_name(state)?;
        self.relocator
            .find_vm(Side::Target, &self.config.target.placement, &name)
            .await
    }

    async fn register(
        &self,
        state: &mut PersistentVolumeMigrationState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let carrier = self
            .carrier_at_target(state)
            .await?
            .ok_or_else(|| Error::InventoryNotFound {
                kind: "VirtualMachine".into(),
                path: state.carrier_vm.clone().unwrap_or_default(),
            })?;

        let backing_path = self
            .target()
            .vm_devices(&carrier)
            .await?
            .into_iter()
            .find_map(|device| match device {
                VirtualDevice::Disk(disk) => disk.backing.file_name().map(str::to_string),
                _ => None,
            })
            .ok_or_else(|| Error::DiskObjectNotFound {
                id: format!("disk on carrier {}", carrier.name),
            })?;

        let placement = &self.config.target.placement;
        let dc = self.target().find_datacenter(&placement.datacenter).await?;
        let datastore = self.target().find_datastore(&dc, &placement.datastore).await?;

        let volume = match self.cns.query_by_backing_path(&backing_path).await {
            Ok(existing) => {
                info!(volume = %state.pv_name, id = %existing.id, "Backing file already registered");
                existing
            }
            Err(Error::ManagedVolumeNotFound { .. }) => {
                self.cns
                    .register(
                        &backing_path,
                        &state.pv_name,
                        &datastore.url,
                        &self.config.cluster_id,
                        cancel,
                    )
                    .await?
            }
            Err(e) => return Err(e),
        };

        let metadata = BTreeMap::from([
            ("pvName".to_string(), state.pv_name.clone()),
            ("pvcName".to_string(), state.pvc_name.clone()),
            ("pvcNamespace".to_string(), state.pvc_namespace.clone()),
            ("sourceVolumeHandle".to_string(), state.source_volume_handle.clone()),
        ]);
        self.cns.update_metadata(&volume.id, &metadata, cancel).await?;

        let handle = build_volume_handle(&volume.id);
        state.target_volume_handle = Some(handle.clone());
        transition(
            state,
            VolumeMigrationStatus::Registered,
            format!("registered at target as {}", handle),
        )
    }

    // -------------------------------------------------------------------------
    // Registered -> Complete
    // -------------------------------------------------------------------------

    async fn complete(
        &self,
        state: &mut PersistentVolumeMigrationState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let handle = state
            .target_volume_handle
            .clone()
            .ok_or_else(|| Error::Internal(format!("{} registered without a handle", state.pv_name)))?;
        let new_id = parse_volume_handle(&handle)?;

        self.workloads.set_volume_handle(&state.pv_name, &handle).await?;
        info!(volume = %state.pv_name, handle = %handle, "Repointed PersistentVolume");

        // destroying the carrier would take an attached disk with it
        if let Some(carrier) = self.carrier_at_target(state).await? {
            if self.target_disks.is_attached_to_vm(&carrier, &new_id).await? {
                self.target_disks.detach(&carrier, &new_id, cancel).await?;
            }
            self.target_disks.verify_not_attached(&carrier, &new_id).await?;
            self.relocator
                .delete_carrier_vm(Side::Target, &carrier, cancel)
                .await?;
        }

        self.resume_workloads(&state.scaled_down_resources).await?;
        transition(state, VolumeMigrationStatus::Complete, "migrated")
    }

    /// Scale every recorded workload back to its original replica count,
    /// attempting all of them before reporting failures
    pub async fn resume_workloads(&self, resources: &[ScaledDownResource]) -> Result<()> {
        let mut causes = Vec::new();
        for resource in resources {
            match self
                .workloads
                .set_replicas(
                    resource.kind,
                    &resource.name,
                    &resource.namespace,
                    resource.original_replicas,
                )
                .await
            {
                Ok(()) => info!(
                    kind = %resource.kind,
                    workload = %resource.name,
                    replicas = resource.original_replicas,
                    "Restored replicas"
                ),
                Err(e) => {
                    if let Some(m) = &self.metrics {
                        m.record_restore_failure();
                    }
                    causes.push(format!("{}/{}/{}: {}", resource.kind, resource.namespace, resource.name, e));
                }
            }
        }

        if causes.is_empty() {
            Ok(())
        } else {
            Err(Error::RestoreFailed {
                failed: causes.len(),
                total: resources.len(),
                causes,
            })
        }
    }

    /// Roll a failed volume's workloads back to their captured state
    pub async fn rollback(
        &self,
        state: &PersistentVolumeMigrationState,
        backups: &[BackupManifest],
    ) -> Result<()> {
        let manifests: Vec<BackupManifest> = backups
            .iter()
            .filter(|m| {
                state.scaled_down_resources.iter().any(|r| {
                    m.resource_type == r.kind.resource_type() && m.name == r.name && m.namespace == r.namespace
                })
            })
            .cloned()
            .collect();

        info!(
            volume = %state.pv_name,
            manifests = manifests.len(),
            workloads = state.scaled_down_resources.len(),
            "Rolling back workloads"
        );

        let restored = self.backup.restore_all(&manifests).await;
        if restored.is_err() {
            if let Some(m) = &self.metrics {
                m.record_restore_failure();
            }
        }
        // recorded replicas cover workloads without a backup
        let resumed = self.resume_workloads(&state.scaled_down_resources).await;
        restored.and(resumed)
    }
}

fn transition(
    state: &mut PersistentVolumeMigrationState,
    next: VolumeMigrationStatus,
    message: impl Into<String>,
) -> Result<()> {
    let from = state.status;
    if state.advance(next, message) {
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "illegal transition {} -> {} for {}",
            from, next, state.pv_name
        )))
    }
}

fn carrier_name(state: &PersistentVolumeMigrationState) -> Result<String> {
    state
        .carrier_vm
        .clone()
        .ok_or_else(|| Error::Internal(format!("{} has no carrier VM recorded", state.pv_name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryObjectStore, InMemoryWorkloads};
    use crate::adapters::simulator::{InventorySpec, SimulatedEndpoint, SimulatedFabric};
    use crate::domain::ports::{MigrationCheckpoint, NoopCheckpoint, TaskState, WorkloadKind};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use kube::core::GroupVersionKind;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Keeps every saved status and backup list; optionally refuses to save
    #[derive(Default)]
    struct RecordingCheckpoint {
        saves: Mutex<Vec<(CsiVolumeMigrationStatus, Vec<BackupManifest>)>>,
        unavailable: bool,
    }

    impl RecordingCheckpoint {
        fn last(&self) -> (CsiVolumeMigrationStatus, Vec<BackupManifest>) {
            self.saves.lock().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl MigrationCheckpoint for RecordingCheckpoint {
        async fn save(&self, status: &CsiVolumeMigrationStatus, backups: &[BackupManifest]) -> Result<()> {
            if self.unavailable {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "apiserver unreachable",
                )));
            }
            self.saves.lock().push((status.clone(), backups.to_vec()));
            Ok(())
        }
    }

    struct Harness {
        source: Arc<SimulatedEndpoint>,
        target: Arc<SimulatedEndpoint>,
        workloads: Arc<InMemoryWorkloads>,
        store: Arc<InMemoryObjectStore>,
        migrator: VolumeMigrator,
    }

    fn harness() -> Harness {
        harness_with("workers", Arc::new(NoopCheckpoint))
    }

    fn harness_with(worker_folder: &str, checkpoint: MigrationCheckpointRef) -> Harness {
        let fabric = SimulatedFabric::new();
        let source = fabric.add(InventorySpec::single("https://vc1/sdk", "dc1", "ds1"));
        let target = fabric.add(
            InventorySpec::single("https://vc2/sdk", "dc2", "ds2").with_credentials("admin", "pw"),
        );
        source.add_vm("dc1", worker_folder, "worker-1");
        source.add_disk("ds1", "fcd-1", "pvc-data", 1024);

        let workloads = InMemoryWorkloads::new();
        workloads.add_workload(WorkloadKind::Deployment, "default", "web", 3, &["data"]);
        workloads.add_volume("pv-1", "file://fcd-1");

        let store = InMemoryObjectStore::new();
        store.seed(
            &GroupVersionKind::gvk("apps", "v1", "Deployment"),
            json!({"metadata": {"name": "web", "namespace": "default"}, "spec": {"replicas": 3}}),
            "11",
        );

        let config = MigrationConfig {
            cluster_id: "cluster-a".into(),
            source: placement("dc1", "ds1"),
            worker_folder: worker_folder.into(),
            target: RelocationTarget {
                placement: placement("dc2", "ds2"),
                username: "admin".into(),
                password: "pw".into(),
                thumbprint: None,
            },
            detach_timeout: Duration::from_secs(60),
            ..Default::default()
        };

        let migrator = VolumeMigrator::new(
            source.clone(),
            target.clone(),
            workloads.clone(),
            store.clone(),
            checkpoint,
            config,
        );
        Harness {
            source,
            target,
            workloads,
            store,
            migrator,
        }
    }

    fn placement(dc: &str, ds: &str) -> Placement {
        Placement {
            datacenter: dc.into(),
            cluster: "cluster".into(),
            folder: "vcm".into(),
            resource_pool: "Resources".into(),
            datastore: ds.into(),
        }
    }

    fn status_with(states: Vec<PersistentVolumeMigrationState>) -> CsiVolumeMigrationStatus {
        let mut status = CsiVolumeMigrationStatus::default();
        for s in states {
            status.observe(s);
        }
        status
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_completes() {
        let h = harness();
        let mut status = status_with(vec![PersistentVolumeMigrationState::pending(
            "pv-1", "default", "data", "file://fcd-1",
        )]);
        let mut backups = Vec::new();

        h.migrator
            .migrate_all(&mut status, &mut backups, &CancellationToken::new())
            .await
            .unwrap();

        let state = &status.volumes[0];
        assert_eq!(state.status, VolumeMigrationStatus::Complete);
        assert_eq!(status.migrated_volumes, 1);
        assert_eq!(state.scaled_down_resources.len(), 1);
        assert_eq!(state.scaled_down_resources[0].original_replicas, 3);

        let handle = state.target_volume_handle.clone().unwrap();
        assert_eq!(h.workloads.volume_handle("pv-1"), Some(handle.clone()));
        assert_eq!(h.workloads.replicas(WorkloadKind::Deployment, "default", "web"), Some(3));

        // disk survived the carrier teardown
        let carrier = state.carrier_vm.clone().unwrap();
        assert!(h.target.vm(&carrier).is_none());
        assert!(h.target.file_exists("[ds2] fcd/pvc-data.vmdk"));
        let id = parse_volume_handle(&handle).unwrap();
        assert_eq!(
            h.target.volume_metadata(&id).unwrap().get("pvName").map(String::as_str),
            Some("pv-1")
        );

        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].name, "web");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_from_relocating_with_carrier_at_target() {
        let h = harness();
        let mut backups = Vec::new();
        let cancel = CancellationToken::new();
        let mut state = PersistentVolumeMigrationState::pending("pv-1", "default", "data", "file://fcd-1");
        state.status = VolumeMigrationStatus::Quiesced;

        h.migrator.step(&mut state, &mut backups, &cancel).await.unwrap();
        assert_eq!(state.status, VolumeMigrationStatus::Relocating);
        h.migrator.step(&mut state, &mut backups, &cancel).await.unwrap();
        assert_eq!(state.status, VolumeMigrationStatus::Relocating);
        assert!(state.relocation_task.is_some());
        h.migrator.step(&mut state, &mut backups, &cancel).await.unwrap();
        assert_eq!(state.status, VolumeMigrationStatus::Relocated);

        // the checkpoint after relocation never landed
        state.status = VolumeMigrationStatus::Relocating;
        h.migrator.step(&mut state, &mut backups, &cancel).await.unwrap();
        assert_eq!(state.status, VolumeMigrationStatus::Relocated);
        assert_eq!(state.message.as_deref(), Some("carrier VM found at target"));

        let carrier = state.carrier_vm.clone().unwrap();
        assert!(h.source.vm(&carrier).is_none());
        assert!(h.target.vm(&carrier).is_some());
        let relocations = h
            .source
            .audit_log()
            .iter()
            .filter(|r| r.method == "RelocateVM_Task")
            .count();
        assert_eq!(relocations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_polls_recorded_relocation_task() {
        let h = harness();
        let mut backups = Vec::new();
        let mut state = PersistentVolumeMigrationState::pending("pv-1", "default", "data", "file://fcd-1");
        state.status = VolumeMigrationStatus::Quiesced;
        let live = CancellationToken::new();

        h.migrator.step(&mut state, &mut backups, &live).await.unwrap();
        h.source.script_relocation(vec![TaskState::Running], None);
        h.migrator.step(&mut state, &mut backups, &live).await.unwrap();
        let task = state.relocation_task.clone().unwrap();

        let stopped = CancellationToken::new();
        stopped.cancel();
        assert_matches!(
            h.migrator.step(&mut state, &mut backups, &stopped).await,
            Err(Error::Cancelled)
        );
        assert_eq!(state.status, VolumeMigrationStatus::Relocating);

        // carrier still at the source, relocation still running
        let carrier = state.carrier_vm.clone().unwrap();
        assert!(h.source.vm(&carrier).is_some());
        h.source.finish_relocations();
        h.migrator.step(&mut state, &mut backups, &live).await.unwrap();

        assert_eq!(state.status, VolumeMigrationStatus::Relocated);
        assert_eq!(state.relocation_task.as_deref(), Some(task.as_str()));
        assert!(h.target.vm(&carrier).is_some());
        let relocations = h
            .source
            .audit_log()
            .iter()
            .filter(|r| r.method == "RelocateVM_Task")
            .count();
        assert_eq!(relocations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_carrier_sharing_worker_folder_passes_gate() {
        // no separate worker folder: workers and carriers both live in "vcm"
        let h = harness_with("vcm", Arc::new(NoopCheckpoint));
        let mut status = status_with(vec![PersistentVolumeMigrationState::pending(
            "pv-1", "default", "data", "file://fcd-1",
        )]);
        let mut backups = Vec::new();

        h.migrator
            .migrate_all(&mut status, &mut backups, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(status.volumes[0].status, VolumeMigrationStatus::Complete);
        assert_eq!(h.workloads.replicas(WorkloadKind::Deployment, "default", "web"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_still_catches_workers_in_shared_folder() {
        let h = harness_with("vcm", Arc::new(NoopCheckpoint));
        let mut backups = Vec::new();
        let mut state = PersistentVolumeMigrationState::pending("pv-1", "default", "data", "file://fcd-1");
        state.status = VolumeMigrationStatus::Quiesced;
        let cancel = CancellationToken::new();
        h.migrator.step(&mut state, &mut backups, &cancel).await.unwrap();

        // a worker grabs the disk again after quiesce
        let worker = h.source.vm("worker-1").unwrap();
        let ds = h.source.datastore("ds1").unwrap();
        DiskObjectManager::new(h.source.clone(), DiskObjectConfig::default())
            .attach(&worker, &ds, "fcd-1", 1000, 0, &cancel)
            .await
            .unwrap();

        assert_matches!(
            h.migrator.step(&mut state, &mut backups, &cancel).await,
            Err(Error::DiskStillAttached { ref vm, .. }) if vm == "worker-1"
        );
        assert!(state.relocation_task.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_from_checkpoint_restores_replicas() {
        let checkpoint = Arc::new(RecordingCheckpoint::default());
        let h = harness_with("workers", checkpoint.clone());
        let worker = h.source.vm("worker-1").unwrap();
        let ds = h.source.datastore("ds1").unwrap();
        DiskObjectManager::new(h.source.clone(), DiskObjectConfig::default())
            .attach(&worker, &ds, "fcd-1", 1000, 0, &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            trigger.cancel();
        });

        let mut status = status_with(vec![PersistentVolumeMigrationState::pending(
            "pv-1", "default", "data", "file://fcd-1",
        )]);
        let mut backups = Vec::new();
        assert_matches!(
            h.migrator.migrate_all(&mut status, &mut backups, &cancel).await,
            Err(Error::Cancelled)
        );
        assert_eq!(h.workloads.replicas(WorkloadKind::Deployment, "default", "web"), Some(0));

        // the process restarts: only the last checkpoint survives
        let (mut status, mut backups) = checkpoint.last();
        let state = &status.volumes[0];
        assert_eq!(state.status, VolumeMigrationStatus::Pending);
        assert_eq!(state.scaled_down_resources.len(), 1);
        assert_eq!(state.scaled_down_resources[0].original_replicas, 3);
        assert_eq!(backups.len(), 1);

        h.source.force_detach("worker-1", "fcd-1");
        h.migrator
            .migrate_all(&mut status, &mut backups, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(status.volumes[0].status, VolumeMigrationStatus::Complete);
        assert_eq!(status.volumes[0].scaled_down_resources[0].original_replicas, 3);
        assert_eq!(h.workloads.replicas(WorkloadKind::Deployment, "default", "web"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsaved_replica_counts_block_scale_down() {
        let checkpoint = Arc::new(RecordingCheckpoint {
            unavailable: true,
            ..Default::default()
        });
        let h = harness_with("workers", checkpoint);
        let mut status = status_with(vec![PersistentVolumeMigrationState::pending(
            "pv-1", "default", "data", "file://fcd-1",
        )]);
        let mut backups = Vec::new();

        let err = h
            .migrator
            .migrate_all(&mut status, &mut backups, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(err, Error::CheckpointFailed { ref volume, .. } if volume == "pv-1");
        assert_eq!(status.volumes[0].status, VolumeMigrationStatus::Pending);
        assert_eq!(h.workloads.replicas(WorkloadKind::Deployment, "default", "web"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_timeout_fails_and_keeps_scaled_down() {
        let h = harness();
        let worker = h.source.vm("worker-1").unwrap();
        let ds = h.source.datastore("ds1").unwrap();
        DiskObjectManager::new(h.source.clone(), DiskObjectConfig::default())
            .attach(&worker, &ds, "fcd-1", 1000, 0, &CancellationToken::new())
            .await
            .unwrap();

        let mut status = status_with(vec![PersistentVolumeMigrationState::pending(
            "pv-1", "default", "data", "file://fcd-1",
        )]);
        let mut backups = Vec::new();
        let err = h
            .migrator
            .migrate_all(&mut status, &mut backups, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(err, Error::BatchFailed { failed: 1, total: 1, .. });
        let state = &status.volumes[0];
        assert_eq!(state.status, VolumeMigrationStatus::Failed);
        assert!(state.message.as_deref().unwrap().contains("worker-1"));
        assert_eq!(state.scaled_down_resources.len(), 1);
        assert!(state.carrier_vm.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_leaves_record_resumable() {
        let h = harness();
        let worker = h.source.vm("worker-1").unwrap();
        let ds = h.source.datastore("ds1").unwrap();
        DiskObjectManager::new(h.source.clone(), DiskObjectConfig::default())
            .attach(&worker, &ds, "fcd-1", 1000, 0, &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            trigger.cancel();
        });

        let mut status = status_with(vec![PersistentVolumeMigrationState::pending(
            "pv-1", "default", "data", "file://fcd-1",
        )]);
        let mut backups = Vec::new();
        assert_matches!(
            h.migrator.migrate_all(&mut status, &mut backups, &cancel).await,
            Err(Error::Cancelled)
        );
        assert_eq!(status.volumes[0].status, VolumeMigrationStatus::Pending);
        assert_eq!(status.volumes[0].scaled_down_resources.len(), 1);

        // resumed pass does not record the paused workload twice
        h.source.force_detach("worker-1", "fcd-1");
        h.migrator
            .migrate_all(&mut status, &mut backups, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status.volumes[0].scaled_down_resources.len(), 1);
        assert_eq!(status.volumes[0].scaled_down_resources[0].original_replicas, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_update_failure_then_rollback() {
        let h = harness();
        h.workloads.fail_handle_updates(true);

        let mut status = status_with(vec![PersistentVolumeMigrationState::pending(
            "pv-1", "default", "data", "file://fcd-1",
        )]);
        let mut backups = Vec::new();
        h.migrator
            .migrate_all(&mut status, &mut backups, &CancellationToken::new())
            .await
            .unwrap_err();

        let state = &status.volumes[0];
        assert_eq!(state.status, VolumeMigrationStatus::Failed);
        assert!(state.target_volume_handle.is_some());
        assert_eq!(h.workloads.replicas(WorkloadKind::Deployment, "default", "web"), Some(0));

        h.migrator.rollback(state, &backups).await.unwrap();
        assert_eq!(h.workloads.replicas(WorkloadKind::Deployment, "default", "web"), Some(3));
        let last = h.store.operations().pop().unwrap();
        assert_eq!(last.verb, "replace");
    }
}
