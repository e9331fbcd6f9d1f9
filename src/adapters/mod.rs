//! Adapters implementing the domain ports
//!
//! - [`kube`]: live cluster access
//! - [`memory`]: in-memory workloads and object store
//! - [`simulator`]: simulated vCenter endpoints

pub mod kube;
pub mod memory;
pub mod simulator;

pub use self::kube::{KubeObjectStore, KubeWorkloadAccessor};
pub use memory::{InMemoryObjectStore, InMemoryWorkloads, StoreFault};
pub use simulator::{FabricSpec, InventorySpec, SimulatedEndpoint, SimulatedFabric};
