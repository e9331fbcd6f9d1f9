//! vCenter Migration Operator
//!
//! A Kubernetes operator that moves the cluster's vSphere CSI persistent
//! volumes from one vCenter to another without copying data through the
//! cluster.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   VCenterMigration Controller                           │
//! │          discovery · pass · rollback · status checkpoint                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                 Per-Volume Migration Orchestrator                       │
//! │  Pending → Quiesced → Relocating → Relocated → Registered → Complete    │
//! ├──────────────┬──────────────┬──────────────────┬────────────────────────┤
//! │   Resource   │  Disk Object │  Cross-Endpoint  │    CNS Registrar       │
//! │   Backup     │  Manager     │  Relocator       │                        │
//! ├──────────────┴──────────────┴──────────────────┴────────────────────────┤
//! │                           Domain Ports                                  │
//! │   vCenter endpoint · workloads · object store · checkpoint              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                            Adapters                                     │
//! │        kube (live cluster) · memory · simulated vCenter fabric          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A volume's disk travels inside a throwaway carrier VM: the disk is
//! attached to the carrier at the source, the carrier is relocated across
//! vCenters, and the disk file is registered as a CNS volume at the target
//! before the PersistentVolume is repointed and the carrier destroyed.
//!
//! # Modules
//!
//! - [`migration`]: the migration engine
//! - [`controller`]: kube-runtime reconciler
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: port traits
//! - [`adapters`]: port implementations
//! - [`config`]: operator configuration file
//! - [`error`]: Error types and handling

pub mod adapters;
pub mod config;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod migration;

// Re-export commonly used types
pub use config::OperatorConfig;

pub use controller::{error_policy, reconcile, run_pass, Context};

pub use crd::{
    BackupManifest, CsiVolumeMigrationStatus, MigrationPhase, PersistentVolumeMigrationState,
    ScaledDownResource, VCenterEndpointSpec, VCenterMigration, VCenterMigrationSpec,
    VCenterMigrationStatus, VolumeMigrationStatus,
};

pub use domain::ports::{
    EndpointConnector, EndpointRef, MigrationCheckpoint, ObjectStore, VirtualizationEndpoint,
    WorkloadAccessor, WorkloadKind,
};

pub use error::{Error, ErrorAction, Result};

pub use migration::{
    MigrationConfig, MigrationMetrics, Placement, RelocationTarget, VolumeMigrator,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
