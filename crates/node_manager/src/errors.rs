//! Error types for the node manager

use crate::kubernetes::KubernetesError;
use crate::types::{Datacenter, NodeName, NodeUuid};
use crate::vsphere::VirtualizationError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeManagerError {
    /// Name is not registered with the node manager.
    #[error("node wasn't found: {name}")]
    NodeNotFound { name: NodeName },

    /// No registered name maps to the UUID.
    #[error("failed to find node name for node with UUID: {uuid:?}")]
    NodeNameNotFound { uuid: NodeUuid },

    #[error("node UUID is empty")]
    EmptyNodeUuid,

    #[error("failed to discover VM with nodeUUID {uuid}: {source}")]
    Discovery {
        uuid: NodeUuid,
        #[source]
        source: VirtualizationError,
    },

    #[error("failed to find node with nodeUUID {uuid} on datacenter {datacenter}: {source}")]
    DatacenterDiscovery {
        uuid: NodeUuid,
        datacenter: Datacenter,
        #[source]
        source: VirtualizationError,
    },

    #[error("failed to renew VM with nodeUUID {uuid}: {source}")]
    Renewal {
        uuid: NodeUuid,
        #[source]
        source: VirtualizationError,
    },

    #[error("failed to get node UUID for node {name}: {source}")]
    Resolution {
        name: NodeName,
        #[source]
        source: KubernetesError,
    },

    #[error("node {name} resolved to an empty node UUID")]
    EmptyResolvedUuid { name: NodeName },

    #[error("kubernetes client not set, cannot resolve node UUID for node {name}")]
    KubernetesClientNotSet { name: NodeName },
}

impl NodeManagerError {
    /// Whether the error means the node is unknown to the local index
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            NodeManagerError::NodeNotFound { .. } | NodeManagerError::NodeNameNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, NodeManagerError>;
