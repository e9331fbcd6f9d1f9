//! Custom Resource Definitions for the migration operator
//!
//! - VCenterMigration: a cross-vCenter volume migration and its persisted
//!   per-volume progress

pub mod vcenter_migration;

pub use vcenter_migration::*;
