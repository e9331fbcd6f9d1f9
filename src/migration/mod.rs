//! Volume migration engine
//!
//! Components, bottom-up:
//!
//! - [`poll`]: poll-until primitive shared by every timed wait
//! - [`paths`]: volume handles, datastore paths and TLS thumbprints
//! - [`backup`]: resource snapshot and restore
//! - [`fcd`]: first-class disk lookups, attach/detach and the detach gate
//! - [`relocator`]: carrier VMs and cross-vCenter relocation
//! - [`cns`]: CNS volume registration at the destination
//! - [`orchestrator`]: per-volume state machine and the batch pass
//! - [`discovery`]: candidate volumes from PersistentVolumes
//! - [`metrics`]: Prometheus collectors

pub mod backup;
pub mod cns;
pub mod discovery;
pub mod fcd;
pub mod metrics;
pub mod orchestrator;
pub mod paths;
pub mod poll;
pub mod relocator;

pub use backup::{BackupConfig, ResourceBackup, RetryPolicy};
pub use cns::{CnsConfig, CnsRegistrar};
pub use discovery::{discover_candidates, observe_candidates, VSPHERE_CSI_DRIVER};
pub use fcd::{DiskObjectConfig, DiskObjectManager};
pub use metrics::MigrationMetrics;
pub use orchestrator::{MigrationConfig, VolumeMigrator};
pub use poll::{poll_until, PollOptions, PollStatus};
pub use relocator::{CarrierVmConfig, Placement, RelocationTarget, Relocator, RelocatorConfig, Side};
