//! Managed-Volume Registrar (CNS)
//!
//! Registers raw disk files as Cloud Native Storage block volumes and looks
//! volumes up by id or backing path.

use crate::domain::ports::{
    CnsOperations, CnsQueryFilter, CnsVolumeCreateSpec, ContainerCluster, EndpointRef,
    ManagedVolumeInfo, TaskResult, TaskState,
};
use crate::error::{Error, Result};
use crate::migration::poll::wait_for_task;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Configuration for CNS registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CnsConfig {
    pub volume_type: String,
    pub cluster_type: String,
    pub cluster_flavor: String,
    /// vSphere user recorded as the volume owner
    pub vsphere_user: String,
}

impl Default for CnsConfig {
    fn default() -> Self {
        Self {
            volume_type: "BLOCK".to_string(),
            cluster_type: "KUBERNETES".to_string(),
            cluster_flavor: "VANILLA".to_string(),
            vsphere_user: String::new(),
        }
    }
}

/// CNS volume operations against one endpoint
pub struct CnsRegistrar {
    endpoint: EndpointRef,
    config: CnsConfig,
}

impl CnsRegistrar {
    pub fn new(endpoint: EndpointRef, config: CnsConfig) -> Self {
        Self { endpoint, config }
    }

    pub async fn query(&self, id: &str) -> Result<ManagedVolumeInfo> {
        let filter = CnsQueryFilter {
            volume_ids: vec![id.to_string()],
        };
        self.endpoint
            .cns_query_volumes(&filter)
            .await?
            .into_iter()
            .find(|v| v.id == id)
            .ok_or_else(|| Error::ManagedVolumeNotFound { id: id.to_string() })
    }

    /// Linear scan of every volume for a matching backing path
    pub async fn query_by_backing_path(&self, path: &str) -> Result<ManagedVolumeInfo> {
        self.endpoint
            .cns_query_volumes(&CnsQueryFilter::default())
            .await?
            .into_iter()
            .find(|v| v.backing_path == path)
            .ok_or_else(|| Error::ManagedVolumeNotFound {
                id: path.to_string(),
            })
    }

    /// Register an existing disk file as a block volume owned by `cluster_id`
    pub async fn register(
        &self,
        backing_path: &str,
        name: &str,
        datastore_url: &str,
        cluster_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ManagedVolumeInfo> {
        let spec = CnsVolumeCreateSpec {
            name: name.to_string(),
            volume_type: self.config.volume_type.clone(),
            datastore_urls: vec![datastore_url.to_string()],
            container_cluster: ContainerCluster {
                cluster_type: self.config.cluster_type.clone(),
                cluster_id: cluster_id.to_string(),
                vsphere_user: self.config.vsphere_user.clone(),
                cluster_flavor: self.config.cluster_flavor.clone(),
            },
            backing_disk_path: backing_path.to_string(),
        };

        let task = self.endpoint.cns_create_volume(&spec).await?;
        let info = wait_for_task(&*self.endpoint, &task, cancel).await?;

        if info.state != TaskState::Success {
            return Err(Error::CnsCreateFailed(
                info.error.unwrap_or_else(|| format!("task ended in {:?}", info.state)),
            ));
        }

        let id = match info.result {
            Some(TaskResult::CnsVolumeOperation(result)) => match (result.fault, result.volume_id) {
                (Some(fault), _) => return Err(Error::CnsCreateFailed(fault)),
                (None, Some(id)) => id,
                (None, None) => {
                    return Err(Error::CnsCreateFailed(
                        "operation succeeded without a volume id".into(),
                    ))
                }
            },
            other => {
                return Err(Error::UnexpectedResultType {
                    expected: "CnsVolumeOperationResult".into(),
                    actual: other.map(|r| r.type_name()).unwrap_or("none").into(),
                })
            }
        };

        info!(id = %id, path = backing_path, cluster_id, "Registered CNS volume");
        self.query(&id).await
    }

    /// Delete a volume, optionally with its backing disk
    pub async fn delete(&self, id: &str, delete_disk: bool, cancel: &CancellationToken) -> Result<()> {
        let task = self.endpoint.cns_delete_volume(id, delete_disk).await?;
        let info = wait_for_task(&*self.endpoint, &task, cancel).await?;
        if info.state != TaskState::Success {
            return Err(Error::endpoint(
                format!("CnsDeleteVolume {}", id),
                info.error.unwrap_or_default(),
            ));
        }
        info!(id, delete_disk, "Deleted CNS volume");
        Ok(())
    }

    /// Attach key/value entity metadata to a volume
    pub async fn update_metadata(
        &self,
        id: &str,
        entries: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let task = self.endpoint.cns_update_volume_metadata(id, entries).await?;
        let info = wait_for_task(&*self.endpoint, &task, cancel).await?;
        if info.state != TaskState::Success {
            return Err(Error::endpoint(
                format!("CnsUpdateVolumeMetadata {}", id),
                info.error.unwrap_or_default(),
            ));
        }
        debug!(id, entries = entries.len(), "Updated CNS volume metadata");
        Ok(())
    }
}
