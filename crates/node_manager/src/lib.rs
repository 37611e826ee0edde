//! Node Manager for Cluster Node Virtual Machines
//!
//! This crate keeps a process-local index from cluster node names and VM
//! UUIDs to handles on the virtual machines backing them. Handles are
//! discovered through a [`VirtualizationClient`] on first use and renewed
//! on every lookup. Node UUIDs that are not yet known at registration time
//! are resolved later through a [`KubernetesClient`].

pub mod errors;
pub mod kubernetes;
pub mod manager;
pub mod types;
pub mod vsphere;

pub use errors::*;
pub use kubernetes::{KubernetesClient, KubernetesError, StubKubernetesClient};
pub use manager::{Manager, NodeManager};
pub use types::*;
pub use vsphere::{StubVirtualizationClient, VirtualizationClient, VirtualizationError};
