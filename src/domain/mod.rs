//! Domain layer - port definitions
//!
//! The traits the migration engine drives: vCenter endpoints, Kubernetes
//! workloads, the object store and the progress checkpoint. Adapters in
//! [`crate::adapters`] implement them.

pub mod ports;

pub use ports::*;
