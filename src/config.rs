//! Operator configuration
//!
//! Optional YAML file overriding the built-in defaults of each component.
//! Every key is optional; durations are whole seconds.
//!
//! ```yaml
//! csiDriver: csi.vsphere.vmware.com
//! requeueIntervalSecs: 60
//! detachPollIntervalSecs: 5
//! relocation:
//!   taskPollIntervalSecs: 30
//!   maxConsecutiveFailures: 3
//! carrier:
//!   numCpus: 1
//!   memoryMb: 128
//! restore:
//!   maxAttempts: 3
//! ```

use crate::error::{Error, Result};
use crate::migration::backup::{BackupConfig, RetryPolicy};
use crate::migration::cns::CnsConfig;
use crate::migration::discovery::VSPHERE_CSI_DRIVER;
use crate::migration::fcd::DiskObjectConfig;
use crate::migration::orchestrator::MigrationConfig;
use crate::migration::relocator::RelocatorConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level operator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    /// CSI driver whose volumes are migration candidates
    pub csi_driver: String,
    /// Requeue interval once a pass has finished
    pub requeue_interval_secs: u64,
    pub detach_poll_interval_secs: u64,
    pub relocation: RelocationSettings,
    pub carrier: CarrierSettings,
    pub restore: RestoreSettings,
    pub cns: CnsSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelocationSettings {
    pub task_poll_interval_secs: u64,
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CarrierSettings {
    pub num_cpus: u32,
    pub memory_mb: u64,
    pub guest_id: String,
    pub name_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestoreSettings {
    pub initial_interval_secs: u64,
    pub multiplier: f64,
    pub randomization_factor: f64,
    pub max_interval_secs: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CnsSettings {
    pub cluster_flavor: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            csi_driver: VSPHERE_CSI_DRIVER.to_string(),
            requeue_interval_secs: 60,
            detach_poll_interval_secs: DiskObjectConfig::default().detach_poll_interval.as_secs(),
            relocation: RelocationSettings::default(),
            carrier: CarrierSettings::default(),
            restore: RestoreSettings::default(),
            cns: CnsSettings::default(),
        }
    }
}

impl Default for RelocationSettings {
    fn default() -> Self {
        let defaults = RelocatorConfig::default();
        Self {
            task_poll_interval_secs: defaults.task_poll_interval.as_secs(),
            max_consecutive_failures: defaults.max_consecutive_failures,
        }
    }
}

impl Default for CarrierSettings {
    fn default() -> Self {
        let defaults = RelocatorConfig::default();
        Self {
            num_cpus: defaults.carrier_num_cpus,
            memory_mb: defaults.carrier_memory_mb,
            guest_id: defaults.carrier_guest_id,
            name_prefix: defaults.carrier_name_prefix,
        }
    }
}

impl Default for RestoreSettings {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            initial_interval_secs: defaults.initial_interval.as_secs(),
            multiplier: defaults.multiplier,
            randomization_factor: defaults.randomization_factor,
            max_interval_secs: defaults.max_interval.as_secs(),
            max_attempts: defaults.max_attempts,
        }
    }
}

impl Default for CnsSettings {
    fn default() -> Self {
        Self {
            cluster_flavor: CnsConfig::default().cluster_flavor,
        }
    }
}

impl OperatorConfig {
    /// Load from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_yaml(&raw)?;
        tracing::debug!(path = %path.as_ref().display(), "Loaded operator config");
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.csi_driver.trim().is_empty() {
            return Err(Error::Configuration("csiDriver must not be empty".into()));
        }
        if self.detach_poll_interval_secs == 0 || self.relocation.task_poll_interval_secs == 0 {
            return Err(Error::Configuration("poll intervals must be at least 1s".into()));
        }
        if self.restore.max_attempts == 0 {
            return Err(Error::Configuration("restore.maxAttempts must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.restore.randomization_factor) {
            return Err(Error::Configuration(
                "restore.randomizationFactor must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }

    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_interval_secs)
    }

    /// Component configuration with endpoint-independent settings applied.
    /// Placement, credentials and cluster id are filled per migration.
    pub fn migration_config(&self) -> MigrationConfig {
        MigrationConfig {
            csi_driver: self.csi_driver.clone(),
            disk: DiskObjectConfig {
                detach_poll_interval: Duration::from_secs(self.detach_poll_interval_secs),
            },
            relocator: RelocatorConfig {
                task_poll_interval: Duration::from_secs(self.relocation.task_poll_interval_secs),
                max_consecutive_failures: self.relocation.max_consecutive_failures,
                carrier_num_cpus: self.carrier.num_cpus,
                carrier_memory_mb: self.carrier.memory_mb,
                carrier_guest_id: self.carrier.guest_id.clone(),
                carrier_name_prefix: self.carrier.name_prefix.clone(),
            },
            backup: BackupConfig {
                retry: RetryPolicy {
                    initial_interval: Duration::from_secs(self.restore.initial_interval_secs),
                    multiplier: self.restore.multiplier,
                    randomization_factor: self.restore.randomization_factor,
                    max_interval: Duration::from_secs(self.restore.max_interval_secs),
                    max_attempts: self.restore.max_attempts,
                },
                ..Default::default()
            },
            cns: CnsConfig {
                cluster_flavor: self.cns.cluster_flavor.clone(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
