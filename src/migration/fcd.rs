//! Disk Object Manager (FCD)
//!
//! Lifecycle and attachment-safety queries for first-class disks, independent
//! of any particular VM. [`DiskObjectManager::verify_not_attached`] is the
//! hard gate in front of every operation that could repurpose a disk.

use crate::domain::ports::{
    DatastoreRef, DiskObjectInfo, DiskObjectOperations, EndpointRef, Inventory, TaskState,
    VirtualDevice, VmOperations, VmRef,
};
use crate::error::{Error, Result};
use crate::migration::paths::DatastorePath;
use crate::migration::poll::{poll_until, wait_for_task, PollOptions, PollStatus};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for disk-object operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskObjectConfig {
    /// Interval between attachment scans while waiting for a detach
    pub detach_poll_interval: Duration,
}

impl Default for DiskObjectConfig {
    fn default() -> Self {
        Self {
            detach_poll_interval: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// Disk Object Manager
// =============================================================================

/// First-class disk operations against one endpoint
pub struct DiskObjectManager {
    endpoint: EndpointRef,
    config: DiskObjectConfig,
}

impl DiskObjectManager {
    pub fn new(endpoint: EndpointRef, config: DiskObjectConfig) -> Self {
        Self { endpoint, config }
    }

    pub fn endpoint(&self) -> &EndpointRef {
        &self.endpoint
    }

    /// Look up a disk by id
    pub async fn lookup(&self, id: &str) -> Result<DiskObjectInfo> {
        self.endpoint
            .find_disk(id)
            .await?
            .ok_or_else(|| Error::DiskObjectNotFound { id: id.to_string() })
    }

    /// Every disk on every datastore; unreadable disks are skipped
    pub async fn list_all(&self) -> Result<Vec<DiskObjectInfo>> {
        let mut disks = Vec::new();
        for datastore in self.endpoint.list_datastores().await? {
            match self.list_on_datastore(&datastore).await {
                Ok(found) => disks.extend(found),
                Err(e) => warn!(
                    datastore = %datastore.name,
                    error = %e,
                    "Skipping datastore while listing disks"
                ),
            }
        }
        Ok(disks)
    }

    /// Disks on one datastore; unreadable disks are skipped
    pub async fn list_on_datastore(&self, datastore: &DatastoreRef) -> Result<Vec<DiskObjectInfo>> {
        let ids = self.endpoint.list_disk_ids(datastore).await?;
        let mut disks = Vec::with_capacity(ids.len());

        for id in ids {
            match self.endpoint.retrieve_disk(datastore, &id).await {
                Ok(Some(info)) => disks.push(info),
                Ok(None) => debug!(id = %id, "Disk vanished while listing"),
                Err(e) => warn!(
                    id = %id,
                    datastore = %datastore.name,
                    error = %e,
                    "Skipping unreadable disk"
                ),
            }
        }
        Ok(disks)
    }

    /// Adopt a raw disk file as a first-class disk
    pub async fn register_existing(
        &self,
        datastore: &DatastoreRef,
        path: &str,
        name: &str,
    ) -> Result<DiskObjectInfo> {
        let full_path = DatastorePath::new(&datastore.name, path).to_string();
        let info = self.endpoint.register_disk(&full_path, name).await?;
        info!(id = %info.id, path = %full_path, "Registered existing disk");
        Ok(info)
    }

    /// Attach a disk to a VM on the given controller slot
    pub async fn attach(
        &self,
        vm: &VmRef,
        datastore: &DatastoreRef,
        id: &str,
        controller_key: i32,
        unit_number: i32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let attach_error = |reason: String| Error::Attach {
            id: id.to_string(),
            vm: vm.name.clone(),
            reason,
        };

        let task = self
            .endpoint
            .attach_disk(vm, id, datastore, controller_key, unit_number)
            .await
            .map_err(|e| attach_error(e.to_string()))?;
        let info = wait_for_task(&*self.endpoint, &task, cancel)
            .await
            .map_err(|e| match e {
                Error::Cancelled => e,
                e => attach_error(e.to_string()),
            })?;

        if info.state != TaskState::Success {
            return Err(attach_error(
                info.error.unwrap_or_else(|| format!("task ended in {:?}", info.state)),
            ));
        }

        info!(id, vm = %vm, controller_key, unit_number, "Attached disk");
        Ok(())
    }

    /// Detach a disk from a VM
    pub async fn detach(&self, vm: &VmRef, id: &str, cancel: &CancellationToken) -> Result<()> {
        let detach_error = |reason: String| Error::Detach {
            id: id.to_string(),
            vm: vm.name.clone(),
            reason,
        };

        let task = self
            .endpoint
            .detach_disk(vm, id)
            .await
            .map_err(|e| detach_error(e.to_string()))?;
        let info = wait_for_task(&*self.endpoint, &task, cancel)
            .await
            .map_err(|e| match e {
                Error::Cancelled => e,
                e => detach_error(e.to_string()),
            })?;

        if info.state != TaskState::Success {
            return Err(detach_error(
                info.error.unwrap_or_else(|| format!("task ended in {:?}", info.state)),
            ));
        }

        info!(id, vm = %vm, "Detached disk");
        Ok(())
    }

    /// Delete a disk and its backing file
    pub async fn delete(
        &self,
        datastore: &DatastoreRef,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let delete_error = |reason: String| Error::DiskDelete {
            id: id.to_string(),
            reason,
        };

        let task = self
            .endpoint
            .delete_disk(datastore, id)
            .await
            .map_err(|e| delete_error(e.to_string()))?;
        let info = wait_for_task(&*self.endpoint, &task, cancel)
            .await
            .map_err(|e| match e {
                Error::Cancelled => e,
                e => delete_error(e.to_string()),
            })?;

        if info.state != TaskState::Success {
            return Err(delete_error(
                info.error.unwrap_or_else(|| format!("task ended in {:?}", info.state)),
            ));
        }

        info!(id, datastore = %datastore.name, "Deleted disk");
        Ok(())
    }

    /// Whether any virtual disk on `vm` is backed by disk `id`
    pub async fn is_attached_to_vm(&self, vm: &VmRef, id: &str) -> Result<bool> {
        let devices = self.endpoint.vm_devices(vm).await?;
        Ok(devices.iter().any(|device| match device {
            VirtualDevice::Disk(disk) => disk.backing.backing_object_id() == Some(id),
            _ => false,
        }))
    }

    /// Scan every VM in a folder for disk `id`.
    ///
    /// VMs that cannot be queried are skipped; the scan keeps going.
    pub async fn is_attached_anywhere(
        &self,
        datacenter: &str,
        folder_path: &str,
        id: &str,
    ) -> Result<(bool, Option<String>)> {
        let dc = self.endpoint.find_datacenter(datacenter).await?;
        let folder = self.endpoint.find_folder(&dc, folder_path).await?;

        for vm in self.endpoint.list_vms(&folder).await? {
            match self.is_attached_to_vm(&vm, id).await {
                Ok(true) => return Ok((true, Some(vm.name))),
                Ok(false) => {}
                Err(e) => warn!(
                    vm = %vm,
                    id,
                    error = %e,
                    "Skipping VM during attachment scan"
                ),
            }
        }
        Ok((false, None))
    }

    /// Poll until disk `id` is attached to no VM in the folder.
    ///
    /// A scan error aborts immediately; on timeout the error names the VM
    /// still holding the disk.
    pub async fn wait_until_detached(
        &self,
        datacenter: &str,
        folder_path: &str,
        id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let operation = format!("disk {} to detach", id);
        let options = PollOptions::new(self.config.detach_poll_interval).with_timeout(timeout);

        poll_until(&operation, options, cancel, move || async move {
            match self.is_attached_anywhere(datacenter, folder_path, id).await? {
                (false, _) => Ok(PollStatus::Ready(())),
                (true, vm) => Ok(PollStatus::Pending(Some(format!(
                    "still attached to VM {}",
                    vm.unwrap_or_else(|| "<unknown>".into())
                )))),
            }
        })
        .await?;

        info!(id, folder = folder_path, "Disk detached from all VMs");
        Ok(())
    }

    /// Fail unless disk `id` is detached from `vm`. Never retried.
    pub async fn verify_not_attached(&self, vm: &VmRef, id: &str) -> Result<()> {
        if self.is_attached_to_vm(vm, id).await? {
            return Err(Error::DiskStillAttached {
                id: id.to_string(),
                vm: vm.name.clone(),
            });
        }
        debug!(id, vm = %vm, "Verified disk not attached");
        Ok(())
    }
}
