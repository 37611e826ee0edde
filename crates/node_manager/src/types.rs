//! Types for the node manager

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable VM UUID backing a cluster node.
///
/// The empty string is a placeholder: the node name is registered but its
/// UUID has not been resolved yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeUuid(pub String);

impl NodeUuid {
    /// Create a new node UUID from string
    pub fn new(uuid: impl Into<String>) -> Self {
        Self(uuid.into())
    }

    /// Placeholder UUID for a node whose UUID is still pending resolution
    pub fn placeholder() -> Self {
        Self(String::new())
    }

    /// Get the UUID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_placeholder(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodeUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeUuid {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Orchestration platform name of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(pub String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Which platform object carries the node UUID.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeUuidSource {
    /// The Node object (provider ID / system UUID).
    #[default]
    Node,
    /// The CSINode object (driver node ID).
    CsiNode,
}

impl NodeUuidSource {
    /// Map the boolean `use_node_uuid` switch onto a source
    pub fn from_use_node_uuid(use_node_uuid: bool) -> Self {
        if use_node_uuid {
            NodeUuidSource::CsiNode
        } else {
            NodeUuidSource::Node
        }
    }
}

impl fmt::Display for NodeUuidSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            NodeUuidSource::Node => "node",
            NodeUuidSource::CsiNode => "csinode",
        };
        f.write_str(value)
    }
}

/// Datacenter scope used to narrow a cold VM lookup
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Datacenter {
    /// Datacenter inventory name
    pub name: String,
    /// vCenter endpoint hosting the datacenter
    pub vcenter_host: String,
}

impl Datacenter {
    pub fn new(name: impl Into<String>, vcenter_host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vcenter_host: vcenter_host.into(),
        }
    }
}

impl fmt::Display for Datacenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.vcenter_host)
    }
}

/// Connection state carried by a VM handle, refreshed by renewal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Backend connection the handle is bound to
    pub connection_id: u64,
    /// Number of successful renewals since discovery
    pub renewals: u64,
    /// Unix timestamp (seconds) of the last discovery or renewal
    pub refreshed_at: u64,
}

impl SessionState {
    pub fn connected(connection_id: u64) -> Self {
        Self {
            connection_id,
            renewals: 0,
            refreshed_at: unix_now(),
        }
    }

    /// Record a renewal against `connection_id`
    pub fn renewed(&mut self, connection_id: u64) {
        self.connection_id = connection_id;
        self.renewals += 1;
        self.refreshed_at = unix_now();
    }
}

/// Handle to a live virtual machine on a vCenter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachine {
    /// BIOS/instance UUID the VM was located by
    pub uuid: NodeUuid,
    /// vCenter endpoint the VM lives on
    pub vcenter_host: String,
    /// Datacenter inventory name
    pub datacenter: String,
    /// Managed object reference, e.g. `vm-42`
    pub moref: String,
    #[serde(default)]
    pub session: SessionState,
}

impl VirtualMachine {
    pub fn new(
        uuid: NodeUuid,
        vcenter_host: impl Into<String>,
        datacenter: impl Into<String>,
        moref: impl Into<String>,
    ) -> Self {
        Self {
            uuid,
            vcenter_host: vcenter_host.into(),
            datacenter: datacenter.into(),
            moref: moref.into(),
            session: SessionState::default(),
        }
    }

    /// Whether the VM is hosted in `datacenter`
    pub fn is_in(&self, datacenter: &Datacenter) -> bool {
        self.datacenter == datacenter.name && self.vcenter_host == datacenter.vcenter_host
    }
}

impl fmt::Display for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VirtualMachine:{} [VirtualCenterHost: {}, UUID: {}, Datacenter: {}]",
            self.moref, self.vcenter_host, self.uuid, self.datacenter
        )
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_uuid_is_empty() {
        assert!(NodeUuid::placeholder().is_placeholder());
        assert!(NodeUuid::default().is_placeholder());
        assert!(!NodeUuid::new("4213-aa").is_placeholder());
    }

    #[test]
    fn uuid_source_follows_use_node_uuid() {
        assert_eq!(NodeUuidSource::from_use_node_uuid(true), NodeUuidSource::CsiNode);
        assert_eq!(NodeUuidSource::from_use_node_uuid(false), NodeUuidSource::Node);
    }

    #[test]
    fn renewal_bumps_session() {
        let mut session = SessionState::connected(1);
        session.renewed(3);
        assert_eq!(session.connection_id, 3);
        assert_eq!(session.renewals, 1);
    }

    #[test]
    fn vm_scope_check() {
        let vm = VirtualMachine::new(NodeUuid::new("u1"), "vc-1", "dc-a", "vm-7");
        assert!(vm.is_in(&Datacenter::new("dc-a", "vc-1")));
        assert!(!vm.is_in(&Datacenter::new("dc-a", "vc-2")));
    }
}
