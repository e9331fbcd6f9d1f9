//! Cross-Endpoint Relocator
//!
//! Moves a disk between vCenters by attaching it to a minimal "carrier" VM
//! and live-relocating that VM. The relocation request authenticates the
//! target out-of-band through a service locator carrying the target's
//! credentials and TLS thumbprint.

use crate::domain::ports::{
    EndpointRef, Inventory, PowerState, RelocateSpec, ScsiController, ScsiControllerKind,
    ServiceLocator, TaskRef, TaskResult, TaskState, VirtualDevice, VmCreateSpec, VmOperations,
    VmRef,
};
use crate::error::{Error, Result};
use crate::migration::paths::{thumbprint, validate_thumbprint};
use crate::migration::poll::{poll_until, wait_for_task, PollOptions, PollStatus};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Units per SCSI bus
pub const SCSI_UNITS_PER_CONTROLLER: i32 = 16;

/// Unit taken by the controller itself
pub const SCSI_RESERVED_UNIT: i32 = 7;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for carrier VMs and relocation polling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocatorConfig {
    /// Interval between relocation task queries
    pub task_poll_interval: Duration,
    /// Task queries allowed to fail in a row before giving up
    pub max_consecutive_failures: u32,
    pub carrier_num_cpus: u32,
    pub carrier_memory_mb: u64,
    pub carrier_guest_id: String,
    /// Prefix of generated carrier names
    pub carrier_name_prefix: String,
}

impl Default for RelocatorConfig {
    fn default() -> Self {
        Self {
            task_poll_interval: Duration::from_secs(30),
            max_consecutive_failures: 3,
            carrier_num_cpus: 1,
            carrier_memory_mb: 128,
            carrier_guest_id: "otherGuest64".to_string(),
            carrier_name_prefix: "vcm-carrier".to_string(),
        }
    }
}

/// Where a VM lives on one endpoint, by inventory path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub datacenter: String,
    #[serde(default)]
    pub cluster: String,
    pub folder: String,
    pub resource_pool: String,
    pub datastore: String,
}

/// Carrier VM request; unset fields take the relocator defaults
#[derive(Debug, Clone, Default)]
pub struct CarrierVmConfig {
    pub name: Option<String>,
    pub num_cpus: Option<u32>,
    pub memory_mb: Option<u64>,
    pub placement: Placement,
}

/// Destination of a cross-vCenter relocation
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RelocationTarget {
    pub placement: Placement,
    pub username: String,
    pub password: String,
    /// Pinned thumbprint; computed from the target's certificate when unset
    pub thumbprint: Option<String>,
}

impl std::fmt::Debug for RelocationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelocationTarget")
            .field("placement", &self.placement)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("thumbprint", &self.thumbprint)
            .finish()
    }
}

/// Which endpoint of the pair an operation runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

// =============================================================================
// SCSI Allocation
// =============================================================================

/// Lowest free unit on `controller_key`, never the reserved unit
pub fn free_scsi_unit(devices: &[VirtualDevice], controller_key: i32) -> Result<i32> {
    let used: BTreeSet<i32> = devices
        .iter()
        .filter_map(|device| match device {
            VirtualDevice::Disk(disk) if disk.controller_key == controller_key => disk.unit_number,
            _ => None,
        })
        .collect();

    (0..SCSI_UNITS_PER_CONTROLLER)
        .filter(|unit| *unit != SCSI_RESERVED_UNIT)
        .find(|unit| !used.contains(unit))
        .ok_or(Error::NoFreeUnits { controller_key })
}

fn generated_carrier_name(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{}-{}", prefix, suffix.to_lowercase())
}

// =============================================================================
// Relocator
// =============================================================================

/// Carrier VM lifecycle and relocation between a source and target vCenter
pub struct Relocator {
    source: EndpointRef,
    target: EndpointRef,
    config: RelocatorConfig,
}

impl Relocator {
    pub fn new(source: EndpointRef, target: EndpointRef, config: RelocatorConfig) -> Self {
        Self {
            source,
            target,
            config,
        }
    }

    pub fn endpoint(&self, side: Side) -> &EndpointRef {
        match side {
            Side::Source => &self.source,
            Side::Target => &self.target,
        }
    }

    /// Create an empty VM with one paravirtual SCSI controller on the source
    pub async fn create_carrier_vm(
        &self,
        request: &CarrierVmConfig,
        cancel: &CancellationToken,
    ) -> Result<VmRef> {
        let ep = &self.source;
        let placement = &request.placement;
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| generated_carrier_name(&self.config.carrier_name_prefix));

        let dc = ep.find_datacenter(&placement.datacenter).await?;
        let folder = ep.find_folder(&dc, &placement.folder).await?;
        let pool = ep.find_resource_pool(&dc, &placement.resource_pool).await?;
        let datastore = ep.find_datastore(&dc, &placement.datastore).await?;

        let spec = VmCreateSpec {
            name: name.clone(),
            num_cpus: request.num_cpus.unwrap_or(self.config.carrier_num_cpus),
            memory_mb: request.memory_mb.unwrap_or(self.config.carrier_memory_mb),
            guest_id: self.config.carrier_guest_id.clone(),
            datastore_name: datastore.name.clone(),
            devices: vec![VirtualDevice::ScsiController(ScsiController {
                key: -100,
                bus_number: 0,
                kind: ScsiControllerKind::ParaVirtual,
            })],
        };

        let create_error = |reason: String| Error::CreateVm {
            name: name.clone(),
            reason,
        };

        let task = ep
            .create_vm(&spec, &folder, &pool, None)
            .await
            .map_err(|e| create_error(e.to_string()))?;
        let info = wait_for_task(&**ep, &task, cancel)
            .await
            .map_err(|e| match e {
                Error::Cancelled => e,
                e => create_error(e.to_string()),
            })?;

        if info.state != TaskState::Success {
            return Err(create_error(
                info.error.unwrap_or_else(|| format!("task ended in {:?}", info.state)),
            ));
        }

        match info.result {
            Some(TaskResult::Vm(vm)) => {
                info!(vm = %vm, folder = %placement.folder, "Created carrier VM");
                Ok(vm)
            }
            other => Err(Error::UnexpectedResultType {
                expected: "VirtualMachine".into(),
                actual: other.map(|r| r.type_name()).unwrap_or("none").into(),
            }),
        }
    }

    /// Thumbprint presented in the service locator
    async fn target_thumbprint(&self, target: &RelocationTarget) -> Result<String> {
        match &target.thumbprint {
            Some(pinned) => validate_thumbprint(pinned),
            None => {
                let der = self.target.server_certificate_der().await?;
                Ok(thumbprint(&der))
            }
        }
    }

    /// Issue the relocation of `vm` from the source to the target vCenter.
    ///
    /// Returns as soon as the endpoint accepts the request; the task handle
    /// is what [`Relocator::await_relocation`] polls.
    pub async fn start_relocation(&self, vm: &VmRef, target: &RelocationTarget) -> Result<TaskRef> {
        let placement = &target.placement;
        let dc = self.target.find_datacenter(&placement.datacenter).await?;
        let folder = self.target.find_folder(&dc, &placement.folder).await?;
        let pool = self
            .target
            .find_resource_pool(&dc, &placement.resource_pool)
            .await?;
        let datastore = self.target.find_datastore(&dc, &placement.datastore).await?;

        let spec = RelocateSpec {
            service: Some(ServiceLocator {
                url: self.target.url().to_string(),
                username: target.username.clone(),
                password: target.password.clone(),
                ssl_thumbprint: self.target_thumbprint(target).await?,
            }),
            folder,
            resource_pool: pool,
            datastore: datastore.moref,
            host: None,
        };

        let task = self.source.relocate_vm(vm, &spec).await?;
        info!(
            vm = %vm,
            task = %task,
            target = %self.target.url(),
            "Started cross-vCenter relocation"
        );
        Ok(task)
    }

    /// Poll a relocation task until it ends and return the VM as seen in the
    /// target placement.
    ///
    /// The task is polled every `task_poll_interval`; cancellation stops the
    /// polling but leaves the task running on the endpoint, so a later call
    /// can pick the same task up again.
    pub async fn await_relocation(
        &self,
        vm_name: &str,
        task: &TaskRef,
        placement: &Placement,
        cancel: &CancellationToken,
    ) -> Result<VmRef> {
        let operation = format!("relocation of {}", vm_name);
        let options = PollOptions::new(self.config.task_poll_interval)
            .with_error_tolerance(self.config.max_consecutive_failures);
        let source = &self.source;

        let outcome = poll_until(&operation, options, cancel, move || async move {
            let info = source.task_info(task).await?;
            match info.state {
                TaskState::Success => Ok(PollStatus::Ready(Ok(()))),
                TaskState::Error => Ok(PollStatus::Ready(Err(info
                    .error
                    .unwrap_or_else(|| "relocation task failed without a fault".into())))),
                TaskState::Running | TaskState::Queued => {
                    info!(
                        vm = vm_name,
                        state = ?info.state,
                        progress = ?info.progress,
                        "Relocation in progress"
                    );
                    Ok(PollStatus::Pending(None))
                }
                TaskState::Other(state) => {
                    warn!(vm = vm_name, state = %state, "Unknown relocation task state");
                    Ok(PollStatus::Pending(Some(format!("task state {}", state))))
                }
            }
        })
        .await
        .map_err(|e| match e {
            Error::ConsecutiveErrors { count, last, .. } => Error::TaskStatusUnavailable {
                task: task.to_string(),
                attempts: count,
                reason: last.to_string(),
            },
            other => other,
        })?;

        if let Err(fault) = outcome {
            return Err(Error::Relocation {
                vm: vm_name.to_string(),
                fault,
            });
        }

        let relocated = self
            .find_vm(Side::Target, placement, vm_name)
            .await?
            .ok_or_else(|| Error::InventoryNotFound {
                kind: "VirtualMachine".into(),
                path: format!("{}/{}", placement.folder, vm_name),
            })?;

        info!(vm = %relocated, "Relocation complete");
        Ok(relocated)
    }

    /// Look up a VM by name in a placement's folder
    pub async fn find_vm(&self, side: Side, placement: &Placement, name: &str) -> Result<Option<VmRef>> {
        let ep = self.endpoint(side);
        let dc = ep.find_datacenter(&placement.datacenter).await?;
        ep.find_vm(&dc, &format!("{}/{}", placement.folder, name)).await
    }

    /// Power off (if running) and destroy a carrier VM
    pub async fn delete_carrier_vm(
        &self,
        side: Side,
        vm: &VmRef,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ep = self.endpoint(side);
        let destroy_error = |reason: String| Error::DestroyVm {
            name: vm.name.clone(),
            reason,
        };

        if ep.vm_power_state(vm).await? == PowerState::PoweredOn {
            let task = ep.power_off_vm(vm).await?;
            let info = wait_for_task(&**ep, &task, cancel).await?;
            if info.state != TaskState::Success {
                return Err(destroy_error(format!(
                    "power off failed: {}",
                    info.error.unwrap_or_default()
                )));
            }
            debug!(vm = %vm, "Powered off carrier VM");
        }

        let task = ep.destroy_vm(vm).await?;
        let info = wait_for_task(&**ep, &task, cancel).await?;
        if info.state != TaskState::Success {
            return Err(destroy_error(info.error.unwrap_or_default()));
        }

        info!(vm = %vm, ?side, "Deleted carrier VM");
        Ok(())
    }

    /// Key of the first SCSI controller on the VM
    pub async fn find_scsi_controller(&self, side: Side, vm: &VmRef) -> Result<i32> {
        self.endpoint(side)
            .vm_devices(vm)
            .await?
            .iter()
            .find_map(|device| match device {
                VirtualDevice::ScsiController(controller) => Some(controller.key),
                _ => None,
            })
            .ok_or_else(|| Error::NoController { vm: vm.name.clone() })
    }

    /// Lowest free unit on the VM's controller
    pub async fn find_free_scsi_unit(&self, side: Side, vm: &VmRef, controller_key: i32) -> Result<i32> {
        let devices = self.endpoint(side).vm_devices(vm).await?;
        free_scsi_unit(&devices, controller_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::simulator::{InventorySpec, SimulatedEndpoint, SimulatedFabric};
    use crate::domain::ports::{DiskBacking, VirtualDisk};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn disk_on(controller_key: i32, unit: i32) -> VirtualDevice {
        VirtualDevice::Disk(VirtualDisk {
            key: 2000 + unit,
            controller_key,
            unit_number: Some(unit),
            capacity_bytes: 1 << 30,
            backing: DiskBacking::FlatVer2 {
                file_name: format!("[ds1] d{}.vmdk", unit),
                backing_object_id: None,
            },
        })
    }

    #[test]
    fn test_free_unit_skips_reserved() {
        let devices: Vec<_> = (0..7).map(|u| disk_on(1000, u)).collect();
        assert_eq!(free_scsi_unit(&devices, 1000).unwrap(), 8);

        // disks on another controller do not count
        assert_eq!(free_scsi_unit(&devices, 1001).unwrap(), 0);
    }

    #[test]
    fn test_free_unit_fills_gaps() {
        let devices = vec![disk_on(1000, 0), disk_on(1000, 2)];
        assert_eq!(free_scsi_unit(&devices, 1000).unwrap(), 1);
    }

    #[test]
    fn test_no_free_units() {
        let devices: Vec<_> = (0..16)
            .filter(|u| *u != SCSI_RESERVED_UNIT)
            .map(|u| disk_on(1000, u))
            .collect();
        assert_eq!(devices.len(), 15);
        assert_matches!(
            free_scsi_unit(&devices, 1000),
            Err(Error::NoFreeUnits { controller_key: 1000 })
        );
    }

    #[test]
    fn test_generated_names_are_distinct() {
        let a = generated_carrier_name("vcm-carrier");
        let b = generated_carrier_name("vcm-carrier");
        assert!(a.starts_with("vcm-carrier-"));
        assert_eq!(a.len(), "vcm-carrier-".len() + 8);
        assert_ne!(a, b);
    }

    struct Pair {
        source: Arc<SimulatedEndpoint>,
        target: Arc<SimulatedEndpoint>,
        relocator: Relocator,
    }

    fn pair() -> Pair {
        let fabric = SimulatedFabric::new();
        let source = fabric.add(InventorySpec::single("https://vc1/sdk", "dc1", "ds1"));
        let target = fabric.add(
            InventorySpec::single("https://vc2/sdk", "dc2", "ds2").with_credentials("admin", "secret"),
        );
        let relocator = Relocator::new(source.clone(), target.clone(), RelocatorConfig::default());
        Pair {
            source,
            target,
            relocator,
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

    async fn carrier(p: &Pair, name: Option<&str>) -> VmRef {
        p.relocator
            .create_carrier_vm(
                &CarrierVmConfig {
                    name: name.map(str::to_string),
                    placement: placement("dc1", "ds1"),
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap()
    }

    async fn relocate(
        p: &Pair,
        vm: &VmRef,
        target: &RelocationTarget,
        cancel: &CancellationToken,
    ) -> Result<VmRef> {
        let task = p.relocator.start_relocation(vm, target).await?;
        p.relocator
            .await_relocation(&vm.name, &task, &target.placement, cancel)
            .await
    }

    fn target() -> RelocationTarget {
        RelocationTarget {
            placement: placement("dc2", "ds2"),
            username: "admin".into(),
            password: "secret".into(),
            thumbprint: None,
        }
    }

    #[tokio::test]
    async fn test_carrier_vm_has_one_controller_and_no_disks() {
        let p = pair();
        let vm = carrier(&p, None).await;

        let devices = p.source.vm_devices(&vm).await.unwrap();
        assert_eq!(devices.len(), 1);
        let key = p.relocator.find_scsi_controller(Side::Source, &vm).await.unwrap();
        assert_eq!(
            p.relocator.find_free_scsi_unit(Side::Source, &vm, key).await.unwrap(),
            0
        );
        assert_eq!(p.source.vm_spec(&vm.name).map(|s| (s.num_cpus, s.memory_mb)), Some((1, 128)));
    }

    #[tokio::test]
    async fn test_carrier_vm_create_failure() {
        let p = pair();
        p.source.fail_vm_creation("insufficient resources");
        let err = p
            .relocator
            .create_carrier_vm(
                &CarrierVmConfig {
                    name: Some("carrier-x".into()),
                    placement: placement("dc1", "ds1"),
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::CreateVm { ref name, ref reason } if name == "carrier-x" && reason.contains("insufficient"));
    }

    #[tokio::test]
    async fn test_no_controller() {
        let p = pair();
        p.source.add_vm("dc1", "workers", "bare");
        p.source.strip_controllers("bare");
        let vm = p.source.vm("bare").unwrap();
        assert_matches!(
            p.relocator.find_scsi_controller(Side::Source, &vm).await,
            Err(Error::NoController { .. })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_relocate_moves_vm_to_target() {
        let p = pair();
        let vm = carrier(&p, Some("carrier-1")).await;
        p.source.script_relocation(vec![TaskState::Queued, TaskState::Running, TaskState::Success], None);

        let moved = relocate(&p, &vm, &target(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(moved.name, "carrier-1");
        assert!(p.source.vm("carrier-1").is_none());
        assert!(p.target.vm("carrier-1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relocate_surfaces_fault_verbatim() {
        let p = pair();
        let vm = carrier(&p, None).await;

        let mut bad = target();
        bad.thumbprint = Some(vec!["AB"; 32].join(":"));

        let err = relocate(&p, &vm, &bad, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Relocation { ref fault, .. } if fault == "thumbprint verification failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_relocate_rejects_malformed_thumbprint() {
        let p = pair();
        let vm = carrier(&p, None).await;

        let mut bad = target();
        bad.thumbprint = Some("AB:CD".into());
        assert_matches!(
            relocate(&p, &vm, &bad, &CancellationToken::new()).await,
            Err(Error::Configuration(_))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_relocate_tolerates_three_query_failures() {
        let p = pair();
        let vm = carrier(&p, None).await;

        p.source.script_relocation(vec![TaskState::Running, TaskState::Success], None);
        p.source.fail_task_queries(3);
        relocate(&p, &vm, &target(), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_relocate_gives_up_after_four_query_failures() {
        let p = pair();
        let vm = carrier(&p, None).await;

        p.source.script_relocation(vec![TaskState::Running], None);
        p.source.fail_task_queries(4);
        assert_matches!(
            relocate(&p, &vm, &target(), &CancellationToken::new()).await,
            Err(Error::TaskStatusUnavailable { attempts: 4, .. })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_relocate_unknown_state_keeps_polling() {
        let p = pair();
        let vm = carrier(&p, None).await;

        p.source.script_relocation(
            vec![TaskState::Other("paused".into()), TaskState::Success],
            None,
        );
        relocate(&p, &vm, &target(), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_relocate_cancelled() {
        let p = pair();
        let vm = carrier(&p, None).await;
        p.source.script_relocation(vec![TaskState::Running], None);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(45)).await;
            trigger.cancel();
        });

        assert_matches!(
            relocate(&p, &vm, &target(), &cancel).await,
            Err(Error::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_carrier_creation_yields_to_cancellation() {
        let p = pair();
        p.source.stall_tasks();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let result = p
            .relocator
            .create_carrier_vm(
                &CarrierVmConfig {
                    placement: placement("dc1", "ds1"),
                    ..Default::default()
                },
                &cancel,
            )
            .await;
        assert_matches!(result, Err(Error::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_wait_resumes_same_task() {
        let p = pair();
        let vm = carrier(&p, Some("carrier-3")).await;
        p.source.script_relocation(vec![TaskState::Running], None);

        let task = p.relocator.start_relocation(&vm, &target()).await.unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(90)).await;
            trigger.cancel();
        });
        assert_matches!(
            p.relocator
                .await_relocation(&vm.name, &task, &target().placement, &cancel)
                .await,
            Err(Error::Cancelled)
        );

        p.source.finish_relocations();
        let moved = p
            .relocator
            .await_relocation(&vm.name, &task, &target().placement, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(moved.name, "carrier-3");

        let relocations = p
            .source
            .audit_log()
            .into_iter()
            .filter(|r| r.method == "RelocateVM_Task")
            .count();
        assert_eq!(relocations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_thumbprint_sent_uppercase() {
        let p = pair();
        let vm = carrier(&p, None).await;

        let mut pinned = target();
        pinned.thumbprint = Some(p.target.thumbprint().to_lowercase());
        relocate(&p, &vm, &pinned, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_carrier_powers_off_first() {
        let p = pair();
        let vm = carrier(&p, Some("carrier-2")).await;
        p.source.power_on("carrier-2");

        p.relocator
            .delete_carrier_vm(Side::Source, &vm, &CancellationToken::new())
            .await
            .unwrap();
        assert!(p.source.vm("carrier-2").is_none());

        let calls: Vec<_> = p.source.audit_log().into_iter().map(|r| r.method).collect();
        let off = calls.iter().position(|m| m == "PowerOffVM_Task").unwrap();
        let destroy = calls.iter().position(|m| m == "Destroy_Task").unwrap();
        assert!(off < destroy);
    }
}
