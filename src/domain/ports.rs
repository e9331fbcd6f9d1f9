//! Domain Ports - Core trait definitions for the migration operator
//!
//! These traits define the boundaries between the migration logic and the
//! systems it drives: the vCenter inventory/session, VM hardware, first-class
//! disks (FCD), the Cloud Native Storage (CNS) layer, Kubernetes workloads and
//! the generic object store used for backup/restore.

use crate::crd::{BackupManifest, CsiVolumeMigrationStatus};
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Inventory References
// =============================================================================

/// Reference to a vCenter managed object (e.g. `VirtualMachine:vm-42`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManagedObjectRef {
    pub r#type: String,
    pub value: String,
}

impl ManagedObjectRef {
    pub fn new(r#type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            r#type: r#type.into(),
            value: value.into(),
        }
    }
}

impl std::fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.r#type, self.value)
    }
}

/// A virtual machine as seen through the inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRef {
    pub moref: ManagedObjectRef,
    pub name: String,
}

impl std::fmt::Display for VmRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// A datastore with its name (used in `[name] path` file paths) and URL
/// (used by CNS)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreRef {
    pub moref: ManagedObjectRef,
    pub name: String,
    pub url: String,
}

/// VM power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

// =============================================================================
// Virtual Hardware
// =============================================================================

/// Backing of a virtual disk.
///
/// Every variant can carry the id of the first-class disk it represents;
/// attachment checks walk all variants through [`DiskBacking::backing_object_id`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskBacking {
    FlatVer2 {
        file_name: String,
        backing_object_id: Option<String>,
    },
    SeSparse {
        file_name: String,
        backing_object_id: Option<String>,
    },
    SparseVer2 {
        file_name: String,
        backing_object_id: Option<String>,
    },
    RawDiskMappingVer1 {
        file_name: String,
        lun_uuid: String,
        backing_object_id: Option<String>,
    },
    /// Backing types without a first-class disk identity
    Other { description: String },
}

impl DiskBacking {
    /// Id of the first-class disk behind this backing, if any
    pub fn backing_object_id(&self) -> Option<&str> {
        match self {
            DiskBacking::FlatVer2 {
                backing_object_id, ..
            }
            | DiskBacking::SeSparse {
                backing_object_id, ..
            }
            | DiskBacking::SparseVer2 {
                backing_object_id, ..
            }
            | DiskBacking::RawDiskMappingVer1 {
                backing_object_id, ..
            } => backing_object_id.as_deref(),
            DiskBacking::Other { .. } => None,
        }
    }

    /// Datastore path of the backing file
    pub fn file_name(&self) -> Option<&str> {
        match self {
            DiskBacking::FlatVer2 { file_name, .. }
            | DiskBacking::SeSparse { file_name, .. }
            | DiskBacking::SparseVer2 { file_name, .. }
            | DiskBacking::RawDiskMappingVer1 { file_name, .. } => Some(file_name),
            DiskBacking::Other { .. } => None,
        }
    }

    /// Replace the disk-object identity carried by this backing
    pub fn set_backing_object_id(&mut self, id: Option<String>) {
        match self {
            DiskBacking::FlatVer2 {
                backing_object_id, ..
            }
            | DiskBacking::SeSparse {
                backing_object_id, ..
            }
            | DiskBacking::SparseVer2 {
                backing_object_id, ..
            }
            | DiskBacking::RawDiskMappingVer1 {
                backing_object_id, ..
            } => *backing_object_id = id,
            DiskBacking::Other { .. } => {}
        }
    }
}

/// A virtual disk device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDisk {
    pub key: i32,
    pub controller_key: i32,
    pub unit_number: Option<i32>,
    pub capacity_bytes: u64,
    pub backing: DiskBacking,
}

/// SCSI controller hardware variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScsiControllerKind {
    ParaVirtual,
    LsiLogic,
    LsiLogicSas,
    BusLogic,
}

/// A virtual SCSI controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScsiController {
    pub key: i32,
    pub bus_number: i32,
    pub kind: ScsiControllerKind,
}

/// Virtual hardware device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VirtualDevice {
    Disk(VirtualDisk),
    ScsiController(ScsiController),
    Other { key: i32, label: String },
}

impl VirtualDevice {
    pub fn key(&self) -> i32 {
        match self {
            VirtualDevice::Disk(d) => d.key,
            VirtualDevice::ScsiController(c) => c.key,
            VirtualDevice::Other { key, .. } => *key,
        }
    }
}

/// Specification for creating a VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmCreateSpec {
    pub name: String,
    pub num_cpus: u32,
    pub memory_mb: u64,
    pub guest_id: String,
    /// Datastore holding the VM's configuration files
    pub datastore_name: String,
    pub devices: Vec<VirtualDevice>,
}

/// Credential bundle used to authenticate against a different vCenter
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLocator {
    pub url: String,
    pub username: String,
    pub password: String,
    pub ssl_thumbprint: String,
}

impl std::fmt::Debug for ServiceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceLocator")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ssl_thumbprint", &self.ssl_thumbprint)
            .finish()
    }
}

/// VM relocation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelocateSpec {
    /// Present for cross-vCenter relocation
    pub service: Option<ServiceLocator>,
    pub folder: ManagedObjectRef,
    pub resource_pool: ManagedObjectRef,
    pub datastore: ManagedObjectRef,
    pub host: Option<ManagedObjectRef>,
}

// =============================================================================
// Tasks
// =============================================================================

/// Handle on an asynchronous vCenter task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef(pub String);

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task state as reported by vCenter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
    /// A state this operator does not know about
    Other(String),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Error)
    }
}

/// Outcome of a CNS volume operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CnsVolumeOperationResult {
    pub volume_id: Option<String>,
    pub fault: Option<String>,
}

/// Typed task result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskResult {
    Vm(VmRef),
    CnsVolumeOperation(CnsVolumeOperationResult),
    DiskObject(DiskObjectInfo),
    Other(String),
}

impl TaskResult {
    pub fn type_name(&self) -> &'static str {
        match self {
            TaskResult::Vm(_) => "VirtualMachine",
            TaskResult::CnsVolumeOperation(_) => "CnsVolumeOperationResult",
            TaskResult::DiskObject(_) => "VStorageObject",
            TaskResult::Other(_) => "Other",
        }
    }
}

/// Snapshot of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task: TaskRef,
    pub state: TaskState,
    pub progress: Option<i32>,
    pub error: Option<String>,
    pub result: Option<TaskResult>,
}

// =============================================================================
// Disk Objects and Managed Volumes
// =============================================================================

/// Read-only projection of a first-class disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskObjectInfo {
    pub id: String,
    pub name: String,
    /// `[datastore] relative/path.vmdk`
    pub file_path: String,
    pub datastore: ManagedObjectRef,
    pub capacity_mb: i64,
}

/// Read-only projection of a CNS volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedVolumeInfo {
    pub id: String,
    pub name: String,
    pub volume_type: String,
    pub datastore_url: String,
    pub backing_path: String,
    pub capacity_mb: i64,
    pub health: String,
}

/// Cluster identity attached to a CNS volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerCluster {
    pub cluster_type: String,
    pub cluster_id: String,
    pub vsphere_user: String,
    pub cluster_flavor: String,
}

/// CNS create/register request for a block volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CnsVolumeCreateSpec {
    pub name: String,
    pub volume_type: String,
    pub datastore_urls: Vec<String>,
    pub container_cluster: ContainerCluster,
    /// Existing disk file to adopt
    pub backing_disk_path: String,
}

/// CNS query filter; an empty id list matches every volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CnsQueryFilter {
    pub volume_ids: Vec<String>,
}

/// One audited endpoint call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub method: String,
    pub duration: Duration,
    pub success: bool,
}

// =============================================================================
// Virtualization Endpoint Ports
// =============================================================================

/// Session and inventory lookups against one vCenter
#[async_trait]
pub trait Inventory: Send + Sync {
    /// SDK URL of the endpoint
    fn url(&self) -> &str;

    async fn find_datacenter(&self, path: &str) -> Result<ManagedObjectRef>;

    async fn find_cluster(&self, datacenter: &ManagedObjectRef, path: &str)
        -> Result<ManagedObjectRef>;

    async fn find_folder(&self, datacenter: &ManagedObjectRef, path: &str)
        -> Result<ManagedObjectRef>;

    async fn find_resource_pool(
        &self,
        datacenter: &ManagedObjectRef,
        path: &str,
    ) -> Result<ManagedObjectRef>;

    async fn find_datastore(&self, datacenter: &ManagedObjectRef, name: &str)
        -> Result<DatastoreRef>;

    async fn find_network(&self, datacenter: &ManagedObjectRef, path: &str)
        -> Result<ManagedObjectRef>;

    /// Look up a VM by inventory path, `None` if absent
    async fn find_vm(&self, datacenter: &ManagedObjectRef, path: &str) -> Result<Option<VmRef>>;

    async fn list_vms(&self, folder: &ManagedObjectRef) -> Result<Vec<VmRef>>;

    async fn list_datastores(&self) -> Result<Vec<DatastoreRef>>;

    /// DER encoding of the endpoint's TLS leaf certificate
    async fn server_certificate_der(&self) -> Result<Vec<u8>>;

    /// Per-call audit records, oldest first
    fn audit_log(&self) -> Vec<CallRecord> {
        Vec::new()
    }
}

/// VM hardware, power and task operations
#[async_trait]
pub trait VmOperations: Send + Sync {
    async fn vm_devices(&self, vm: &VmRef) -> Result<Vec<VirtualDevice>>;

    async fn vm_power_state(&self, vm: &VmRef) -> Result<PowerState>;

    async fn create_vm(
        &self,
        spec: &VmCreateSpec,
        folder: &ManagedObjectRef,
        resource_pool: &ManagedObjectRef,
        host: Option<&ManagedObjectRef>,
    ) -> Result<TaskRef>;

    async fn power_off_vm(&self, vm: &VmRef) -> Result<TaskRef>;

    async fn destroy_vm(&self, vm: &VmRef) -> Result<TaskRef>;

    async fn relocate_vm(&self, vm: &VmRef, spec: &RelocateSpec) -> Result<TaskRef>;

    async fn task_info(&self, task: &TaskRef) -> Result<TaskInfo>;
}

/// First-class disk (VStorageObject) operations
#[async_trait]
pub trait DiskObjectOperations: Send + Sync {
    async fn list_disk_ids(&self, datastore: &DatastoreRef) -> Result<Vec<String>>;

    /// Retrieve a disk on a known datastore
    async fn retrieve_disk(&self, datastore: &DatastoreRef, id: &str)
        -> Result<Option<DiskObjectInfo>>;

    /// Retrieve a disk by id alone
    async fn find_disk(&self, id: &str) -> Result<Option<DiskObjectInfo>>;

    async fn register_disk(&self, path: &str, name: &str) -> Result<DiskObjectInfo>;

    async fn attach_disk(
        &self,
        vm: &VmRef,
        id: &str,
        datastore: &DatastoreRef,
        controller_key: i32,
        unit_number: i32,
    ) -> Result<TaskRef>;

    async fn detach_disk(&self, vm: &VmRef, id: &str) -> Result<TaskRef>;

    async fn delete_disk(&self, datastore: &DatastoreRef, id: &str) -> Result<TaskRef>;
}

/// Cloud Native Storage volume operations
#[async_trait]
pub trait CnsOperations: Send + Sync {
    async fn cns_query_volumes(&self, filter: &CnsQueryFilter) -> Result<Vec<ManagedVolumeInfo>>;

    async fn cns_create_volume(&self, spec: &CnsVolumeCreateSpec) -> Result<TaskRef>;

    async fn cns_delete_volume(&self, id: &str, delete_disk: bool) -> Result<TaskRef>;

    async fn cns_update_volume_metadata(
        &self,
        id: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<TaskRef>;
}

/// Everything the migration needs from one vCenter
pub trait VirtualizationEndpoint:
    Inventory + VmOperations + DiskObjectOperations + CnsOperations
{
}

impl<T> VirtualizationEndpoint for T where
    T: Inventory + VmOperations + DiskObjectOperations + CnsOperations
{
}

/// Opens authenticated sessions against vCenter endpoints
#[async_trait]
pub trait EndpointConnector: Send + Sync {
    async fn connect(&self, server: &str, username: &str, password: &str) -> Result<EndpointRef>;
}

// =============================================================================
// Kubernetes Ports
// =============================================================================

/// Scalable workload kinds
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, schemars::JsonSchema,
)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

impl WorkloadKind {
    /// Resource type name used for backups
    pub fn resource_type(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployments",
            WorkloadKind::StatefulSet => "statefulsets",
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadKind::Deployment => write!(f, "Deployment"),
            WorkloadKind::StatefulSet => write!(f, "StatefulSet"),
        }
    }
}

impl std::str::FromStr for WorkloadKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Deployment" => Ok(WorkloadKind::Deployment),
            "StatefulSet" => Ok(WorkloadKind::StatefulSet),
            other => Err(Error::Configuration(format!(
                "unsupported workload kind: {}",
                other
            ))),
        }
    }
}

/// A workload consuming a claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub name: String,
    pub namespace: String,
    pub replicas: i32,
}

/// Port for workload and persistent-volume bookkeeping
#[async_trait]
pub trait WorkloadAccessor: Send + Sync {
    /// Workloads whose pods mount the given claim
    async fn find_consumers(&self, claim_namespace: &str, claim_name: &str)
        -> Result<Vec<WorkloadRef>>;

    async fn set_replicas(
        &self,
        kind: WorkloadKind,
        name: &str,
        namespace: &str,
        replicas: i32,
    ) -> Result<()>;

    async fn set_volume_handle(&self, pv_name: &str, handle: &str) -> Result<()>;
}

/// Port for schema-agnostic object reads and writes
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    async fn create(&self, gvk: &GroupVersionKind, object: &DynamicObject)
        -> Result<DynamicObject>;

    async fn replace(&self, gvk: &GroupVersionKind, object: &DynamicObject)
        -> Result<DynamicObject>;
}

/// Port for persisting migration progress
#[async_trait]
pub trait MigrationCheckpoint: Send + Sync {
    async fn save(
        &self,
        status: &CsiVolumeMigrationStatus,
        backups: &[BackupManifest],
    ) -> Result<()>;
}

/// Checkpoint that keeps nothing
pub struct NoopCheckpoint;

#[async_trait]
impl MigrationCheckpoint for NoopCheckpoint {
    async fn save(&self, _: &CsiVolumeMigrationStatus, _: &[BackupManifest]) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type EndpointRef = Arc<dyn VirtualizationEndpoint>;
pub type EndpointConnectorRef = Arc<dyn EndpointConnector>;
pub type WorkloadAccessorRef = Arc<dyn WorkloadAccessor>;
pub type ObjectStoreRef = Arc<dyn ObjectStore>;
pub type MigrationCheckpointRef = Arc<dyn MigrationCheckpoint>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backing_object_id_across_variants() {
        let backings = vec![
            DiskBacking::FlatVer2 {
                file_name: "[ds1] a.vmdk".into(),
                backing_object_id: Some("fcd-1".into()),
            },
            DiskBacking::SeSparse {
                file_name: "[ds1] b.vmdk".into(),
                backing_object_id: Some("fcd-2".into()),
            },
            DiskBacking::RawDiskMappingVer1 {
                file_name: "[ds1] c.vmdk".into(),
                lun_uuid: "lun".into(),
                backing_object_id: Some("fcd-3".into()),
            },
        ];
        let ids: Vec<_> = backings.iter().filter_map(|b| b.backing_object_id()).collect();
        assert_eq!(ids, vec!["fcd-1", "fcd-2", "fcd-3"]);

        let other = DiskBacking::Other {
            description: "nfs".into(),
        };
        assert_eq!(other.backing_object_id(), None);
        assert_eq!(other.file_name(), None);
    }

    #[test]
    fn test_workload_kind_round_trip() {
        assert_eq!(format!("{}", WorkloadKind::StatefulSet), "StatefulSet");
        assert_eq!(
            "Deployment".parse::<WorkloadKind>().unwrap(),
            WorkloadKind::Deployment
        );
        assert!("DaemonSet".parse::<WorkloadKind>().is_err());
    }

    #[test]
    fn test_service_locator_debug_redacts_password() {
        let locator = ServiceLocator {
            url: "https://vc2/sdk".into(),
            username: "admin".into(),
            password: "hunter2".into(),
            ssl_thumbprint: "AA".into(),
        };
        let rendered = format!("{:?}", locator);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("redacted"));
    }
}
