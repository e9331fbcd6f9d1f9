//! Simulated vCenter endpoint
//!
//! In-memory implementation of the virtualization ports: inventory, VM
//! hardware, first-class disks, CNS volumes and asynchronous tasks. Endpoints
//! joined in a [`SimulatedFabric`] can relocate VMs to each other; the
//! relocation verifies the service locator credentials and TLS thumbprint
//! like a real cross-vCenter vMotion does.
//!
//! Every port call is recorded in an audit log, and the fault hooks
//! (`fail_*`, `script_relocation`) drive the failure paths in tests and
//! rehearsal runs.

use crate::domain::ports::{
    CallRecord, CnsOperations, CnsQueryFilter, CnsVolumeCreateSpec, CnsVolumeOperationResult,
    DatastoreRef, DiskBacking, DiskObjectInfo, DiskObjectOperations, EndpointConnector,
    EndpointRef, Inventory, ManagedObjectRef,
    ManagedVolumeInfo, PowerState, RelocateSpec, ScsiController, ScsiControllerKind, TaskInfo,
    TaskRef, TaskResult, TaskState, VirtualDevice, VirtualDisk, VmCreateSpec, VmOperations, VmRef,
};
use crate::error::{Error, Result};
use crate::migration::paths::{thumbprint, DatastorePath};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::debug;

const MIB: u64 = 1024 * 1024;

// =============================================================================
// Inventory Description
// =============================================================================

/// Initial contents of one simulated vCenter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventorySpec {
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Base64 DER leaf certificate; derived from the URL when absent
    #[serde(default)]
    pub certificate: Option<String>,
    pub datacenters: Vec<DatacenterSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatacenterSpec {
    pub name: String,
    #[serde(default)]
    pub clusters: Vec<String>,
    #[serde(default)]
    pub folders: Vec<String>,
    #[serde(default)]
    pub resource_pools: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub datastores: Vec<DatastoreSpec>,
    #[serde(default)]
    pub vms: Vec<VmSpec>,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastoreSpec {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    pub name: String,
    pub folder: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpec {
    pub id: String,
    pub name: String,
    pub datastore: String,
    pub capacity_mb: i64,
}

/// Several endpoints that can reach each other
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FabricSpec {
    pub endpoints: Vec<InventorySpec>,
}

impl InventorySpec {
    /// One datacenter with one datastore, folders `vcm` and `workers`,
    /// cluster `cluster` and resource pool `Resources`
    pub fn single(url: &str, datacenter: &str, datastore: &str) -> Self {
        Self {
            url: url.to_string(),
            username: String::new(),
            password: String::new(),
            certificate: None,
            datacenters: vec![DatacenterSpec {
                name: datacenter.to_string(),
                clusters: vec!["cluster".into()],
                folders: vec!["vcm".into(), "workers".into()],
                resource_pools: vec!["Resources".into()],
                networks: vec!["VM Network".into()],
                datastores: vec![DatastoreSpec {
                    name: datastore.to_string(),
                    url: None,
                }],
                ..Default::default()
            }],
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Clone, Default)]
struct DatacenterState {
    clusters: BTreeSet<String>,
    folders: BTreeSet<String>,
    resource_pools: BTreeSet<String>,
    networks: BTreeSet<String>,
    datastores: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct SimVm {
    vm: VmRef,
    datacenter: String,
    folder: String,
    num_cpus: u32,
    memory_mb: u64,
    guest_id: String,
    power: PowerState,
    devices: Vec<VirtualDevice>,
}

#[derive(Debug, Clone)]
struct SimDisk {
    id: String,
    name: String,
    datastore: String,
    path: String,
    capacity_mb: i64,
}

#[derive(Debug, Clone)]
struct SimVolume {
    info: ManagedVolumeInfo,
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    datacenters: BTreeMap<String, DatacenterState>,
    datastores: BTreeMap<String, DatastoreRef>,
    /// Datastore path -> capacity (MB)
    files: BTreeMap<String, i64>,
    disks: BTreeMap<String, SimDisk>,
    volumes: BTreeMap<String, SimVolume>,
}

#[derive(Debug, Clone)]
struct RelocationPlan {
    vm: String,
    target: Option<String>,
    folder: ManagedObjectRef,
    datastore: ManagedObjectRef,
}

#[derive(Debug)]
struct SimTask {
    info: TaskInfo,
    script: VecDeque<TaskState>,
    fault: Option<String>,
    relocation: Option<RelocationPlan>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_disks: BTreeSet<String>,
    failing_device_vms: BTreeSet<String>,
    vm_creation: Option<String>,
    task_query_failures: u32,
    relocation_script: Option<(Vec<TaskState>, Option<String>)>,
    cns_result: Option<TaskResult>,
}

// =============================================================================
// Fabric
// =============================================================================

/// Registry of endpoints reachable from each other by URL
#[derive(Default)]
pub struct SimulatedFabric {
    endpoints: DashMap<String, Arc<SimulatedEndpoint>>,
}

impl SimulatedFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Build a fabric from a YAML-loaded description
    pub fn from_spec(spec: FabricSpec) -> Result<Arc<Self>> {
        let fabric = Self::new();
        for endpoint in spec.endpoints {
            fabric.try_add(endpoint)?;
        }
        Ok(fabric)
    }

    pub fn add(self: &Arc<Self>, spec: InventorySpec) -> Arc<SimulatedEndpoint> {
        let endpoint = Arc::new(SimulatedEndpoint::build(spec, Arc::downgrade(self), Vec::new()));
        self.endpoints
            .insert(endpoint.url.clone(), endpoint.clone());
        endpoint
    }

    fn try_add(self: &Arc<Self>, spec: InventorySpec) -> Result<Arc<SimulatedEndpoint>> {
        let certificate = decode_certificate(&spec)?;
        let endpoint = Arc::new(SimulatedEndpoint::build(spec, Arc::downgrade(self), certificate));
        self.endpoints
            .insert(endpoint.url.clone(), endpoint.clone());
        Ok(endpoint)
    }

    pub fn endpoint(&self, url: &str) -> Option<Arc<SimulatedEndpoint>> {
        self.endpoints.get(url).map(|e| e.value().clone())
    }

    /// Load a fabric description from a YAML file
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Arc<Self>> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_spec(serde_yaml::from_str(&raw)?)
    }
}

#[async_trait]
impl EndpointConnector for SimulatedFabric {
    async fn connect(&self, server: &str, username: &str, password: &str) -> Result<EndpointRef> {
        let endpoint = self
            .endpoint(server)
            .ok_or_else(|| Error::endpoint("Login", format!("{} is not reachable", server)))?;
        if endpoint.username != username || endpoint.password != password {
            return Err(Error::endpoint(
                "Login",
                format!("incorrect user name or password on {}", server),
            ));
        }
        debug!(server, username, "Opened simulated session");
        Ok(endpoint as EndpointRef)
    }
}

fn decode_certificate(spec: &InventorySpec) -> Result<Vec<u8>> {
    match &spec.certificate {
        Some(encoded) => Ok(STANDARD.decode(encoded)?),
        None => Ok(Vec::new()),
    }
}

// =============================================================================
// Simulated Endpoint
// =============================================================================

/// One simulated vCenter
pub struct SimulatedEndpoint {
    url: String,
    username: String,
    password: String,
    certificate: Vec<u8>,
    state: Mutex<State>,
    vms: DashMap<String, SimVm>,
    tasks: DashMap<String, SimTask>,
    faults: Mutex<Faults>,
    /// Tasks issued while set never leave `Running`
    stalled: AtomicBool,
    audit: Mutex<Vec<CallRecord>>,
    counter: AtomicU64,
    fabric: Weak<SimulatedFabric>,
}

impl SimulatedEndpoint {
    /// Standalone endpoint outside any fabric
    pub fn new(spec: InventorySpec) -> Arc<Self> {
        Arc::new(Self::build(spec, Weak::new(), Vec::new()))
    }

    fn build(spec: InventorySpec, fabric: Weak<SimulatedFabric>, certificate: Vec<u8>) -> Self {
        let certificate = if certificate.is_empty() {
            format!("simulated-leaf-certificate:{}", spec.url).into_bytes()
        } else {
            certificate
        };

        let endpoint = Self {
            url: spec.url.clone(),
            username: spec.username.clone(),
            password: spec.password.clone(),
            certificate,
            state: Mutex::new(State::default()),
            vms: DashMap::new(),
            tasks: DashMap::new(),
            faults: Mutex::new(Faults::default()),
            stalled: AtomicBool::new(false),
            audit: Mutex::new(Vec::new()),
            counter: AtomicU64::new(1),
            fabric,
        };

        for dc in &spec.datacenters {
            endpoint.add_datacenter(dc);
        }
        endpoint
    }

    fn add_datacenter(&self, spec: &DatacenterSpec) {
        {
            let mut state = self.state.lock();
            let dc = state.datacenters.entry(spec.name.clone()).or_default();
            dc.clusters.extend(spec.clusters.iter().cloned());
            dc.folders.extend(spec.folders.iter().cloned());
            dc.resource_pools.extend(spec.resource_pools.iter().cloned());
            dc.networks.extend(spec.networks.iter().cloned());
            dc.datastores
                .extend(spec.datastores.iter().map(|d| d.name.clone()));

            for ds in &spec.datastores {
                let url = ds
                    .url
                    .clone()
                    .unwrap_or_else(|| format!("ds:///vmfs/volumes/{}/", ds.name));
                state.datastores.insert(
                    ds.name.clone(),
                    DatastoreRef {
                        moref: ManagedObjectRef::new("Datastore", format!("datastore-{}", ds.name)),
                        name: ds.name.clone(),
                        url,
                    },
                );
            }
        }

        for vm in &spec.vms {
            self.add_vm(&spec.name, &vm.folder, &vm.name);
        }
        for disk in &spec.disks {
            self.add_disk(&disk.datastore, &disk.id, &disk.name, disk.capacity_mb);
        }
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn thumbprint(&self) -> String {
        thumbprint(&self.certificate)
    }

    // -------------------------------------------------------------------------
    // Setup helpers
    // -------------------------------------------------------------------------

    /// Add a powered-on VM with one paravirtual controller (key 1000)
    pub fn add_vm(&self, datacenter: &str, folder: &str, name: &str) -> VmRef {
        self.state
            .lock()
            .datacenters
            .entry(datacenter.to_string())
            .or_default()
            .folders
            .insert(folder.to_string());

        let vm = VmRef {
            moref: ManagedObjectRef::new("VirtualMachine", format!("vm-{}", self.next())),
            name: name.to_string(),
        };
        self.vms.insert(
            vm.moref.value.clone(),
            SimVm {
                vm: vm.clone(),
                datacenter: datacenter.to_string(),
                folder: folder.to_string(),
                num_cpus: 4,
                memory_mb: 16384,
                guest_id: "rhel8_64Guest".into(),
                power: PowerState::PoweredOn,
                devices: vec![VirtualDevice::ScsiController(ScsiController {
                    key: 1000,
                    bus_number: 0,
                    kind: ScsiControllerKind::ParaVirtual,
                })],
            },
        );
        vm
    }

    /// Add a first-class disk backed by `[datastore] fcd/<name>.vmdk`
    pub fn add_disk(&self, datastore: &str, id: &str, name: &str, capacity_mb: i64) {
        let path = DatastorePath::new(datastore, format!("fcd/{}.vmdk", name)).to_string();
        let mut state = self.state.lock();
        state.files.insert(path.clone(), capacity_mb);
        state.disks.insert(
            id.to_string(),
            SimDisk {
                id: id.to_string(),
                name: name.to_string(),
                datastore: datastore.to_string(),
                path,
                capacity_mb,
            },
        );
    }

    /// Add a raw disk file not registered as a first-class disk
    pub fn add_file(&self, datastore: &str, path: &str, capacity_mb: i64) {
        self.state
            .lock()
            .files
            .insert(DatastorePath::new(datastore, path).to_string(), capacity_mb);
    }

    pub fn vm(&self, name: &str) -> Option<VmRef> {
        self.vms
            .iter()
            .find(|entry| entry.vm.name == name)
            .map(|entry| entry.vm.clone())
    }

    /// Hardware summary of a VM, in create-spec form
    pub fn vm_spec(&self, name: &str) -> Option<VmCreateSpec> {
        self.vms
            .iter()
            .find(|entry| entry.vm.name == name)
            .map(|entry| VmCreateSpec {
                name: entry.vm.name.clone(),
                num_cpus: entry.num_cpus,
                memory_mb: entry.memory_mb,
                guest_id: entry.guest_id.clone(),
                datastore_name: String::new(),
                devices: entry.devices.clone(),
            })
    }

    pub fn datastore(&self, name: &str) -> Option<DatastoreRef> {
        self.state.lock().datastores.get(name).cloned()
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.state.lock().files.contains_key(path)
    }

    pub fn volume_metadata(&self, id: &str) -> Option<BTreeMap<String, String>> {
        self.state.lock().volumes.get(id).map(|v| v.metadata.clone())
    }

    pub fn power_on(&self, name: &str) {
        self.with_vm_named(name, |vm| vm.power = PowerState::PoweredOn);
    }

    /// Remove a disk from a VM without a task (a kubelet finishing a detach)
    pub fn force_detach(&self, vm_name: &str, id: &str) {
        self.with_vm_named(vm_name, |vm| {
            vm.devices.retain(|device| match device {
                VirtualDevice::Disk(disk) => disk.backing.backing_object_id() != Some(id),
                _ => true,
            })
        });
    }

    pub fn strip_controllers(&self, vm_name: &str) {
        self.with_vm_named(vm_name, |vm| {
            vm.devices
                .retain(|device| !matches!(device, VirtualDevice::ScsiController(_)))
        });
    }

    fn with_vm_named(&self, name: &str, f: impl FnOnce(&mut SimVm)) {
        if let Some(mut entry) = self.vms.iter_mut().find(|entry| entry.vm.name == name) {
            f(entry.value_mut());
        }
    }

    // -------------------------------------------------------------------------
    // Fault injection
    // -------------------------------------------------------------------------

    pub fn fail_disk_retrieval(&self, id: &str) {
        self.faults.lock().failing_disks.insert(id.to_string());
    }

    pub fn fail_device_queries(&self, vm_name: &str) {
        self.faults
            .lock()
            .failing_device_vms
            .insert(vm_name.to_string());
    }

    pub fn fail_vm_creation(&self, reason: &str) {
        self.faults.lock().vm_creation = Some(reason.to_string());
    }

    /// Fail the next `count` task queries
    pub fn fail_task_queries(&self, count: u32) {
        self.faults.lock().task_query_failures = count;
    }

    /// States reported by the next relocation task, one per query; the last
    /// one sticks. `fault` is reported with an `Error` state.
    pub fn script_relocation(&self, states: Vec<TaskState>, fault: Option<String>) {
        self.faults.lock().relocation_script = Some((states, fault));
    }

    /// Result returned by the next CNS create task
    pub fn override_cns_result(&self, result: TaskResult) {
        self.faults.lock().cns_result = Some(result);
    }

    /// Every task issued from now on stays `Running` (a hung vCenter task)
    pub fn stall_tasks(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    /// Let every relocation task still in flight succeed on its next query
    pub fn finish_relocations(&self) {
        for mut entry in self.tasks.iter_mut() {
            let task = entry.value_mut();
            if task.relocation.is_some() {
                task.script = VecDeque::from([TaskState::Success]);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn audited<T>(&self, method: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let result = f();
        self.audit.lock().push(CallRecord {
            method: method.to_string(),
            duration: started.elapsed(),
            success: result.is_ok(),
        });
        result
    }

    fn finished_task(&self, state: TaskState, error: Option<String>, result: Option<TaskResult>) -> TaskRef {
        let task = TaskRef(format!("task-{}", self.next()));
        let sim = if self.stalled.load(Ordering::SeqCst) {
            SimTask {
                info: TaskInfo {
                    task: task.clone(),
                    state: TaskState::Running,
                    progress: Some(50),
                    error: None,
                    result: None,
                },
                script: VecDeque::from([TaskState::Running]),
                fault: None,
                relocation: None,
            }
        } else {
            SimTask {
                info: TaskInfo {
                    task: task.clone(),
                    state,
                    progress: Some(100),
                    error,
                    result,
                },
                script: VecDeque::new(),
                fault: None,
                relocation: None,
            }
        };
        self.tasks.insert(task.0.clone(), sim);
        task
    }

    fn succeeded(&self, result: Option<TaskResult>) -> TaskRef {
        self.finished_task(TaskState::Success, None, result)
    }

    fn failed(&self, error: impl Into<String>) -> TaskRef {
        self.finished_task(TaskState::Error, Some(error.into()), None)
    }

    fn vm_not_found(vm: &VmRef) -> Error {
        Error::InventoryNotFound {
            kind: "VirtualMachine".into(),
            path: vm.name.clone(),
        }
    }

    fn not_found(kind: &str, path: &str) -> Error {
        Error::InventoryNotFound {
            kind: kind.into(),
            path: path.into(),
        }
    }

    fn dc_lookup(
        &self,
        datacenter: &ManagedObjectRef,
        kind: &str,
        path: &str,
        select: impl FnOnce(&DatacenterState) -> &BTreeSet<String>,
    ) -> Result<ManagedObjectRef> {
        let state = self.state.lock();
        let dc = state
            .datacenters
            .get(&datacenter.value)
            .ok_or_else(|| Self::not_found("Datacenter", &datacenter.value))?;
        if select(dc).contains(path) {
            Ok(ManagedObjectRef::new(kind, format!("{}/{}", datacenter.value, path)))
        } else {
            Err(Self::not_found(kind, path))
        }
    }

    /// Inverse of the `dc/path` encoding used for folders
    fn split_folder(folder: &ManagedObjectRef) -> (String, String) {
        match folder.value.split_once('/') {
            Some((dc, path)) => (dc.to_string(), path.to_string()),
            None => (folder.value.clone(), String::new()),
        }
    }

    fn mb_to_bytes(capacity_mb: i64) -> u64 {
        capacity_mb.max(0) as u64 * MIB
    }

    /// Carry out a relocation once its task reports success
    fn apply_relocation(&self, plan: &RelocationPlan) -> std::result::Result<VmRef, String> {
        let target: Arc<SimulatedEndpoint>;
        let destination: &SimulatedEndpoint = match &plan.target {
            Some(url) => {
                target = self
                    .fabric
                    .upgrade()
                    .and_then(|f| f.endpoint(url))
                    .ok_or_else(|| format!("target {} unreachable", url))?;
                target.as_ref()
            }
            None => self,
        };
        let cross_endpoint = plan.target.is_some();

        let datastore = destination
            .state
            .lock()
            .datastores
            .values()
            .find(|d| d.moref == plan.datastore)
            .map(|d| d.name.clone())
            .ok_or_else(|| format!("datastore {} not found at target", plan.datastore))?;

        let (_, mut vm) = self
            .vms
            .remove(&plan.vm)
            .ok_or_else(|| format!("VM {} vanished during relocation", plan.vm))?;

        // move backing files with the VM
        let mut moved_files = Vec::new();
        {
            let mut state = self.state.lock();
            for device in vm.devices.iter_mut() {
                let VirtualDevice::Disk(disk) = device else {
                    continue;
                };
                let Some(old_path) = disk.backing.file_name().map(str::to_string) else {
                    continue;
                };
                let relative = old_path
                    .parse::<DatastorePath>()
                    .map(|p| p.path)
                    .unwrap_or_else(|_| old_path.clone());
                let new_path = DatastorePath::new(&datastore, relative).to_string();

                let capacity = state.files.remove(&old_path).unwrap_or_default();
                if cross_endpoint {
                    state.disks.retain(|_, d| d.path != old_path);
                    disk.backing.set_backing_object_id(None);
                } else if let Some(d) = state.disks.values_mut().find(|d| d.path == old_path) {
                    d.path = new_path.clone();
                    d.datastore = datastore.clone();
                }
                set_file_name(&mut disk.backing, new_path.clone());
                moved_files.push((new_path, capacity));
            }
        }

        destination.state.lock().files.extend(moved_files);

        let (datacenter, folder) = Self::split_folder(&plan.folder);
        vm.datacenter = datacenter;
        vm.folder = folder;
        if cross_endpoint {
            vm.vm.moref = ManagedObjectRef::new("VirtualMachine", format!("vm-{}", destination.next()));
        }
        let relocated = vm.vm.clone();
        destination.vms.insert(relocated.moref.value.clone(), vm);

        debug!(vm = %relocated.name, target = %destination.url, "Simulated relocation applied");
        Ok(relocated)
    }

    fn remove_disk_files(&self, devices: &[VirtualDevice]) {
        let mut state = self.state.lock();
        for device in devices {
            if let VirtualDevice::Disk(disk) = device {
                if let Some(path) = disk.backing.file_name() {
                    state.files.remove(path);
                    state.disks.retain(|_, d| d.path != path);
                    state.volumes.retain(|_, v| v.info.backing_path != path);
                }
            }
        }
    }

    fn disk_info(&self, disk: &SimDisk) -> DiskObjectInfo {
        let datastore = self
            .state
            .lock()
            .datastores
            .get(&disk.datastore)
            .map(|d| d.moref.clone())
            .unwrap_or_else(|| ManagedObjectRef::new("Datastore", &disk.datastore));
        DiskObjectInfo {
            id: disk.id.clone(),
            name: disk.name.clone(),
            file_path: disk.path.clone(),
            datastore,
            capacity_mb: disk.capacity_mb,
        }
    }

    fn new_disk_id(&self) -> String {
        let n = self.next();
        let salt: u32 = rand::random();
        format!("{:08x}-{:04x}-sim", salt, n)
    }
}

fn set_file_name(backing: &mut DiskBacking, path: String) {
    match backing {
        DiskBacking::FlatVer2 { file_name, .. }
        | DiskBacking::SeSparse { file_name, .. }
        | DiskBacking::SparseVer2 { file_name, .. }
        | DiskBacking::RawDiskMappingVer1 { file_name, .. } => *file_name = path,
        DiskBacking::Other { .. } => {}
    }
}

// =============================================================================
// Inventory
// =============================================================================

#[async_trait]
impl Inventory for SimulatedEndpoint {
    fn url(&self) -> &str {
        &self.url
    }

    async fn find_datacenter(&self, path: &str) -> Result<ManagedObjectRef> {
        self.audited("FindDatacenter", || {
            if self.state.lock().datacenters.contains_key(path) {
                Ok(ManagedObjectRef::new("Datacenter", path))
            } else {
                Err(Self::not_found("Datacenter", path))
            }
        })
    }

    async fn find_cluster(&self, datacenter: &ManagedObjectRef, path: &str) -> Result<ManagedObjectRef> {
        self.audited("FindCluster", || {
            self.dc_lookup(datacenter, "ClusterComputeResource", path, |dc| &dc.clusters)
        })
    }

    async fn find_folder(&self, datacenter: &ManagedObjectRef, path: &str) -> Result<ManagedObjectRef> {
        self.audited("FindFolder", || {
            self.dc_lookup(datacenter, "Folder", path, |dc| &dc.folders)
        })
    }

    async fn find_resource_pool(
        &self,
        datacenter: &ManagedObjectRef,
        path: &str,
    ) -> Result<ManagedObjectRef> {
        self.audited("FindResourcePool", || {
            self.dc_lookup(datacenter, "ResourcePool", path, |dc| &dc.resource_pools)
        })
    }

    async fn find_datastore(&self, datacenter: &ManagedObjectRef, name: &str) -> Result<DatastoreRef> {
        self.audited("FindDatastore", || {
            let state = self.state.lock();
            let in_dc = state
                .datacenters
                .get(&datacenter.value)
                .map(|dc| dc.datastores.contains(name))
                .unwrap_or(false);
            match state.datastores.get(name) {
                Some(ds) if in_dc => Ok(ds.clone()),
                _ => Err(Self::not_found("Datastore", name)),
            }
        })
    }

    async fn find_network(&self, datacenter: &ManagedObjectRef, path: &str) -> Result<ManagedObjectRef> {
        self.audited("FindNetwork", || {
            self.dc_lookup(datacenter, "Network", path, |dc| &dc.networks)
        })
    }

    async fn find_vm(&self, datacenter: &ManagedObjectRef, path: &str) -> Result<Option<VmRef>> {
        self.audited("FindVM", || {
            let (folder, name) = match path.rsplit_once('/') {
                Some((folder, name)) => (Some(folder), name),
                None => (None, path),
            };
            Ok(self
                .vms
                .iter()
                .find(|entry| {
                    entry.datacenter == datacenter.value
                        && entry.vm.name == name
                        && folder.map_or(true, |f| entry.folder == f)
                })
                .map(|entry| entry.vm.clone()))
        })
    }

    async fn list_vms(&self, folder: &ManagedObjectRef) -> Result<Vec<VmRef>> {
        self.audited("ListVMs", || {
            let (datacenter, path) = Self::split_folder(folder);
            let mut vms: Vec<VmRef> = self
                .vms
                .iter()
                .filter(|entry| entry.datacenter == datacenter && entry.folder == path)
                .map(|entry| entry.vm.clone())
                .collect();
            vms.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(vms)
        })
    }

    async fn list_datastores(&self) -> Result<Vec<DatastoreRef>> {
        self.audited("ListDatastores", || {
            Ok(self.state.lock().datastores.values().cloned().collect())
        })
    }

    async fn server_certificate_der(&self) -> Result<Vec<u8>> {
        Ok(self.certificate.clone())
    }

    fn audit_log(&self) -> Vec<CallRecord> {
        self.audit.lock().clone()
    }
}

// =============================================================================
// VM Operations
// =============================================================================

#[async_trait]
impl VmOperations for SimulatedEndpoint {
    async fn vm_devices(&self, vm: &VmRef) -> Result<Vec<VirtualDevice>> {
        self.audited("RetrieveVMDevices", || {
            if self.faults.lock().failing_device_vms.contains(&vm.name) {
                return Err(Error::endpoint(
                    format!("RetrieveProperties {}", vm.name),
                    "ManagedObjectNotFound",
                ));
            }
            self.vms
                .get(&vm.moref.value)
                .map(|entry| entry.devices.clone())
                .ok_or_else(|| Self::vm_not_found(vm))
        })
    }

    async fn vm_power_state(&self, vm: &VmRef) -> Result<PowerState> {
        self.audited("RetrievePowerState", || {
            self.vms
                .get(&vm.moref.value)
                .map(|entry| entry.power)
                .ok_or_else(|| Self::vm_not_found(vm))
        })
    }

    async fn create_vm(
        &self,
        spec: &VmCreateSpec,
        folder: &ManagedObjectRef,
        _resource_pool: &ManagedObjectRef,
        _host: Option<&ManagedObjectRef>,
    ) -> Result<TaskRef> {
        self.audited("CreateVM_Task", || {
            if let Some(reason) = self.faults.lock().vm_creation.clone() {
                return Ok(self.failed(reason));
            }

            let (datacenter, path) = Self::split_folder(folder);
            if self.vms.iter().any(|e| e.datacenter == datacenter && e.vm.name == spec.name) {
                return Ok(self.failed(format!("The name '{}' already exists.", spec.name)));
            }

            let devices = spec
                .devices
                .iter()
                .map(|device| match device {
                    VirtualDevice::ScsiController(c) => VirtualDevice::ScsiController(ScsiController {
                        key: 1000 + c.bus_number,
                        ..c.clone()
                    }),
                    other => other.clone(),
                })
                .collect();

            let vm = VmRef {
                moref: ManagedObjectRef::new("VirtualMachine", format!("vm-{}", self.next())),
                name: spec.name.clone(),
            };
            self.vms.insert(
                vm.moref.value.clone(),
                SimVm {
                    vm: vm.clone(),
                    datacenter,
                    folder: path,
                    num_cpus: spec.num_cpus,
                    memory_mb: spec.memory_mb,
                    guest_id: spec.guest_id.clone(),
                    power: PowerState::PoweredOff,
                    devices,
                },
            );
            Ok(self.succeeded(Some(TaskResult::Vm(vm))))
        })
    }

    async fn power_off_vm(&self, vm: &VmRef) -> Result<TaskRef> {
        self.audited("PowerOffVM_Task", || {
            let mut entry = self
                .vms
                .get_mut(&vm.moref.value)
                .ok_or_else(|| Self::vm_not_found(vm))?;
            entry.power = PowerState::PoweredOff;
            drop(entry);
            Ok(self.succeeded(None))
        })
    }

    async fn destroy_vm(&self, vm: &VmRef) -> Result<TaskRef> {
        self.audited("Destroy_Task", || {
            let powered_on = self
                .vms
                .get(&vm.moref.value)
                .map(|entry| entry.power == PowerState::PoweredOn)
                .ok_or_else(|| Self::vm_not_found(vm))?;
            if powered_on {
                return Ok(self.failed(
                    "The attempted operation cannot be performed in the current state (Powered on).",
                ));
            }

            // attached disks go with the VM
            if let Some((_, removed)) = self.vms.remove(&vm.moref.value) {
                self.remove_disk_files(&removed.devices);
            }
            Ok(self.succeeded(None))
        })
    }

    async fn relocate_vm(&self, vm: &VmRef, spec: &RelocateSpec) -> Result<TaskRef> {
        self.audited("RelocateVM_Task", || {
            if !self.vms.contains_key(&vm.moref.value) {
                return Err(Self::vm_not_found(vm));
            }

            let mut target = None;
            if let Some(locator) = &spec.service {
                let destination = self
                    .fabric
                    .upgrade()
                    .and_then(|f| f.endpoint(&locator.url))
                    .ok_or_else(|| {
                        Error::endpoint("RelocateVM_Task", format!("cannot reach {}", locator.url))
                    })?;

                if locator.ssl_thumbprint != destination.thumbprint() {
                    return Ok(self.failed("thumbprint verification failed"));
                }
                if locator.username != destination.username
                    || locator.password != destination.password
                {
                    return Ok(self.failed(format!(
                        "Cannot complete login due to an incorrect user name or password on {}",
                        locator.url
                    )));
                }
                target = Some(locator.url.clone());
            }

            let (script, fault) = self
                .faults
                .lock()
                .relocation_script
                .take()
                .unwrap_or_else(|| (vec![TaskState::Success], None));

            let task = TaskRef(format!("task-{}", self.next()));
            self.tasks.insert(
                task.0.clone(),
                SimTask {
                    info: TaskInfo {
                        task: task.clone(),
                        state: TaskState::Queued,
                        progress: Some(0),
                        error: None,
                        result: None,
                    },
                    script: script.into(),
                    fault,
                    relocation: Some(RelocationPlan {
                        vm: vm.moref.value.clone(),
                        target,
                        folder: spec.folder.clone(),
                        datastore: spec.datastore.clone(),
                    }),
                },
            );
            Ok(task)
        })
    }

    async fn task_info(&self, task: &TaskRef) -> Result<TaskInfo> {
        self.audited("TaskInfo", || {
            {
                let mut faults = self.faults.lock();
                if faults.task_query_failures > 0 {
                    faults.task_query_failures -= 1;
                    return Err(Error::endpoint("RetrieveProperties Task", "503 Service Unavailable"));
                }
            }

            let (info, plan) = {
                let mut entry = self.tasks.get_mut(&task.0).ok_or_else(|| {
                    Error::endpoint("RetrieveProperties Task", format!("{} not found", task))
                })?;
                let sim = entry.value_mut();

                // the last scripted state sticks
                let next = if sim.script.len() > 1 {
                    sim.script.pop_front()
                } else {
                    sim.script.front().cloned()
                };
                if let Some(next) = next {
                    sim.info.state = next;
                    match sim.info.state {
                        TaskState::Running => sim.info.progress = Some(50),
                        TaskState::Error => {
                            sim.info.error = Some(
                                sim.fault
                                    .clone()
                                    .unwrap_or_else(|| "A general system error occurred".into()),
                            )
                        }
                        _ => {}
                    }
                }

                let plan = if sim.info.state == TaskState::Success {
                    sim.relocation.take()
                } else {
                    None
                };
                (sim.info.clone(), plan)
            };

            let Some(plan) = plan else {
                return Ok(info);
            };

            let outcome = self.apply_relocation(&plan);
            let mut entry = self.tasks.get_mut(&task.0).ok_or_else(|| {
                Error::endpoint("RetrieveProperties Task", format!("{} not found", task))
            })?;
            match outcome {
                Ok(vm) => {
                    entry.info.progress = Some(100);
                    entry.info.result = Some(TaskResult::Vm(vm));
                }
                Err(reason) => {
                    entry.script.clear();
                    entry.info.state = TaskState::Error;
                    entry.info.error = Some(reason);
                }
            }
            Ok(entry.info.clone())
        })
    }
}

// =============================================================================
// Disk Object Operations
// =============================================================================

#[async_trait]
impl DiskObjectOperations for SimulatedEndpoint {
    async fn list_disk_ids(&self, datastore: &DatastoreRef) -> Result<Vec<String>> {
        self.audited("ListVStorageObject", || {
            Ok(self
                .state
                .lock()
                .disks
                .values()
                .filter(|d| d.datastore == datastore.name)
                .map(|d| d.id.clone())
                .collect())
        })
    }

    async fn retrieve_disk(&self, datastore: &DatastoreRef, id: &str) -> Result<Option<DiskObjectInfo>> {
        self.audited("RetrieveVStorageObject", || {
            if self.faults.lock().failing_disks.contains(id) {
                return Err(Error::endpoint(
                    format!("RetrieveVStorageObject {}", id),
                    "InvalidDatastore",
                ));
            }
            let disk = self
                .state
                .lock()
                .disks
                .get(id)
                .filter(|d| d.datastore == datastore.name)
                .cloned();
            Ok(disk.map(|d| self.disk_info(&d)))
        })
    }

    async fn find_disk(&self, id: &str) -> Result<Option<DiskObjectInfo>> {
        self.audited("RetrieveVStorageObject", || {
            let disk = self.state.lock().disks.get(id).cloned();
            Ok(disk.map(|d| self.disk_info(&d)))
        })
    }

    async fn register_disk(&self, path: &str, name: &str) -> Result<DiskObjectInfo> {
        self.audited("RegisterDisk", || {
            let parsed: DatastorePath = path.parse()?;
            let disk = {
                let mut state = self.state.lock();
                let capacity_mb = *state.files.get(path).ok_or_else(|| {
                    Error::endpoint("RegisterDisk", format!("file {} was not found", path))
                })?;
                if state.disks.values().any(|d| d.path == path) {
                    return Err(Error::endpoint(
                        "RegisterDisk",
                        format!("{} is already a first-class disk", path),
                    ));
                }
                let disk = SimDisk {
                    id: self.new_disk_id(),
                    name: name.to_string(),
                    datastore: parsed.datastore,
                    path: path.to_string(),
                    capacity_mb,
                };
                state.disks.insert(disk.id.clone(), disk.clone());
                disk
            };
            Ok(self.disk_info(&disk))
        })
    }

    async fn attach_disk(
        &self,
        vm: &VmRef,
        id: &str,
        _datastore: &DatastoreRef,
        controller_key: i32,
        unit_number: i32,
    ) -> Result<TaskRef> {
        self.audited("AttachDisk_Task", || {
            let Some(disk) = self.state.lock().disks.get(id).cloned() else {
                return Ok(self.failed(format!("The object 'vim.vslm.ID:{}' has already been deleted or has not been completely created", id)));
            };

            let key = 2000 + self.next() as i32;
            let mut entry = self
                .vms
                .get_mut(&vm.moref.value)
                .ok_or_else(|| Self::vm_not_found(vm))?;

            let devices = &mut entry.devices;
            let has_controller = devices
                .iter()
                .any(|d| matches!(d, VirtualDevice::ScsiController(c) if c.key == controller_key));
            let unit_taken = devices.iter().any(|d| {
                matches!(d, VirtualDevice::Disk(disk) if disk.controller_key == controller_key && disk.unit_number == Some(unit_number))
            });
            let already = devices.iter().any(|d| {
                matches!(d, VirtualDevice::Disk(disk) if disk.backing.backing_object_id() == Some(id))
            });

            let error = if !has_controller {
                Some(format!("controller {} not present", controller_key))
            } else if unit_taken || unit_number == 7 {
                Some(format!("unit {} on controller {} is in use", unit_number, controller_key))
            } else if already {
                Some(format!("disk {} is already attached", id))
            } else {
                None
            };
            if let Some(error) = error {
                drop(entry);
                return Ok(self.failed(error));
            }

            devices.push(VirtualDevice::Disk(VirtualDisk {
                key,
                controller_key,
                unit_number: Some(unit_number),
                capacity_bytes: Self::mb_to_bytes(disk.capacity_mb),
                backing: DiskBacking::FlatVer2 {
                    file_name: disk.path.clone(),
                    backing_object_id: Some(id.to_string()),
                },
            }));
            drop(entry);
            Ok(self.succeeded(None))
        })
    }

    async fn detach_disk(&self, vm: &VmRef, id: &str) -> Result<TaskRef> {
        self.audited("DetachDisk_Task", || {
            let mut entry = self
                .vms
                .get_mut(&vm.moref.value)
                .ok_or_else(|| Self::vm_not_found(vm))?;
            let before = entry.devices.len();
            entry.devices.retain(|d| match d {
                VirtualDevice::Disk(disk) => disk.backing.backing_object_id() != Some(id),
                _ => true,
            });
            let detached = entry.devices.len() < before;
            drop(entry);

            if detached {
                Ok(self.succeeded(None))
            } else {
                Ok(self.failed(format!("disk {} is not attached to {}", id, vm.name)))
            }
        })
    }

    async fn delete_disk(&self, datastore: &DatastoreRef, id: &str) -> Result<TaskRef> {
        self.audited("DeleteVStorageObject_Task", || {
            let in_use = self.vms.iter().any(|entry| {
                entry.devices.iter().any(|d| {
                    matches!(d, VirtualDevice::Disk(disk) if disk.backing.backing_object_id() == Some(id))
                })
            });
            if in_use {
                return Ok(self.failed(format!("disk {} is in use", id)));
            }

            let mut state = self.state.lock();
            match state.disks.get(id) {
                Some(disk) if disk.datastore == datastore.name => {
                    let path = disk.path.clone();
                    state.disks.remove(id);
                    state.files.remove(&path);
                    drop(state);
                    Ok(self.succeeded(None))
                }
                _ => {
                    drop(state);
                    Ok(self.failed(format!("disk {} not found on {}", id, datastore.name)))
                }
            }
        })
    }
}

// =============================================================================
// CNS Operations
// =============================================================================

#[async_trait]
impl CnsOperations for SimulatedEndpoint {
    async fn cns_query_volumes(&self, filter: &CnsQueryFilter) -> Result<Vec<ManagedVolumeInfo>> {
        self.audited("CnsQueryVolume", || {
            Ok(self
                .state
                .lock()
                .volumes
                .values()
                .filter(|v| filter.volume_ids.is_empty() || filter.volume_ids.contains(&v.info.id))
                .map(|v| v.info.clone())
                .collect())
        })
    }

    async fn cns_create_volume(&self, spec: &CnsVolumeCreateSpec) -> Result<TaskRef> {
        self.audited("CnsCreateVolume", || {
            if let Some(result) = self.faults.lock().cns_result.take() {
                return Ok(self.succeeded(Some(result)));
            }

            let fault = |message: String| {
                Some(TaskResult::CnsVolumeOperation(CnsVolumeOperationResult {
                    volume_id: None,
                    fault: Some(message),
                }))
            };

            let path = spec.backing_disk_path.clone();
            let id = {
                let mut state = self.state.lock();
                let Some(capacity_mb) = state.files.get(&path).copied() else {
                    drop(state);
                    return Ok(self.succeeded(fault(format!("file {} not found", path))));
                };
                let Some(datastore) = state
                    .datastores
                    .values()
                    .find(|d| spec.datastore_urls.contains(&d.url))
                    .cloned()
                else {
                    drop(state);
                    return Ok(self.succeeded(fault("datastore not accessible".into())));
                };
                if state.volumes.values().any(|v| v.info.backing_path == path) {
                    drop(state);
                    return Ok(self.succeeded(fault(format!("{} is already a CNS volume", path))));
                }

                let id = match state.disks.values().find(|d| d.path == path) {
                    Some(disk) => disk.id.clone(),
                    None => {
                        let disk = SimDisk {
                            id: self.new_disk_id(),
                            name: spec.name.clone(),
                            datastore: datastore.name.clone(),
                            path: path.clone(),
                            capacity_mb,
                        };
                        state.disks.insert(disk.id.clone(), disk.clone());
                        disk.id
                    }
                };

                state.volumes.insert(
                    id.clone(),
                    SimVolume {
                        info: ManagedVolumeInfo {
                            id: id.clone(),
                            name: spec.name.clone(),
                            volume_type: spec.volume_type.clone(),
                            datastore_url: datastore.url.clone(),
                            backing_path: path.clone(),
                            capacity_mb,
                            health: "green".into(),
                        },
                        metadata: BTreeMap::from([(
                            "clusterId".to_string(),
                            spec.container_cluster.cluster_id.clone(),
                        )]),
                    },
                );
                id
            };

            // attached copies of the file now carry the new identity
            for mut entry in self.vms.iter_mut() {
                for device in entry.devices.iter_mut() {
                    if let VirtualDevice::Disk(disk) = device {
                        if disk.backing.file_name() == Some(path.as_str()) {
                            disk.backing.set_backing_object_id(Some(id.clone()));
                        }
                    }
                }
            }

            Ok(self.succeeded(Some(TaskResult::CnsVolumeOperation(CnsVolumeOperationResult {
                volume_id: Some(id),
                fault: None,
            }))))
        })
    }

    async fn cns_delete_volume(&self, id: &str, delete_disk: bool) -> Result<TaskRef> {
        self.audited("CnsDeleteVolume", || {
            let mut state = self.state.lock();
            let Some(volume) = state.volumes.remove(id) else {
                drop(state);
                return Ok(self.failed(format!("volume {} not found", id)));
            };
            if delete_disk {
                state.files.remove(&volume.info.backing_path);
                state.disks.remove(id);
            }
            drop(state);
            Ok(self.succeeded(Some(TaskResult::CnsVolumeOperation(CnsVolumeOperationResult {
                volume_id: Some(id.to_string()),
                fault: None,
            }))))
        })
    }

    async fn cns_update_volume_metadata(
        &self,
        id: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<TaskRef> {
        self.audited("CnsUpdateVolumeMetadata", || {
            let mut state = self.state.lock();
            match state.volumes.get_mut(id) {
                Some(volume) => {
                    volume
                        .metadata
                        .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
                    drop(state);
                    Ok(self.succeeded(None))
                }
                None => {
                    drop(state);
                    Ok(self.failed(format!("volume {} not found", id)))
                }
            }
        })
    }
}
