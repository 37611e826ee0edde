//! Node manager implementation
//!
//! Keeps two concurrent indices: node UUID -> virtual machine handle and
//! node name -> node UUID. Handles are discovered lazily and renewed on
//! every lookup.

use crate::errors::*;
use crate::kubernetes::KubernetesClient;
use crate::types::*;
use crate::vsphere::VirtualizationClient;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Node lookup and lifecycle operations.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Set the kubernetes client used to resolve pending node UUIDs.
    fn set_kubernetes_client(&self, client: Arc<dyn KubernetesClient>);

    /// Select the Node or CSINode object as the node UUID source.
    fn set_identifier_source(&self, source: NodeUuidSource);

    /// Register a node given its UUID and name, then discover its VM.
    async fn register_node(&self, uuid: NodeUuid, name: NodeName) -> Result<()>;

    /// Scan every vCenter for a VM with `uuid` and cache its handle.
    async fn discover_node(&self, uuid: &NodeUuid) -> Result<()>;

    /// Refresh and return the VM of a node given its UUID. A cold lookup is
    /// narrowed to `datacenter` when one is given.
    async fn get_node(
        &self,
        uuid: &NodeUuid,
        datacenter: Option<&Datacenter>,
    ) -> Result<VirtualMachine>;

    /// Refresh and return the VM of a registered node given its name.
    async fn get_node_by_name(&self, name: &NodeName) -> Result<VirtualMachine>;

    /// Name of the registered node whose UUID is `uuid`.
    async fn get_node_name_by_uuid(&self, uuid: &NodeUuid) -> Result<NodeName>;

    /// Refresh and return the VMs of all discovered nodes. Nodes registered
    /// or unregistered concurrently may or may not be reflected.
    async fn get_all_nodes(&self) -> Result<Vec<VirtualMachine>>;

    /// Unregister a node given its name.
    async fn unregister_node(&self, name: &NodeName) -> Result<()>;
}

/// Default [`Manager`] holding the node indices in memory.
pub struct NodeManager {
    /// Node UUID -> VM handle
    node_vms: DashMap<NodeUuid, VirtualMachine>,
    /// Node name -> node UUID, the placeholder UUID while pending
    node_name_to_uuid: DashMap<NodeName, NodeUuid>,
    vcenter: Arc<dyn VirtualizationClient>,
    k8s_client: RwLock<Option<Arc<dyn KubernetesClient>>>,
    uuid_source: RwLock<NodeUuidSource>,
}

impl NodeManager {
    /// Create an empty node manager. The process constructs one and shares
    /// it.
    pub fn new(vcenter: Arc<dyn VirtualizationClient>) -> Self {
        info!("Initializing node manager");
        let manager = Self {
            node_vms: DashMap::new(),
            node_name_to_uuid: DashMap::new(),
            vcenter,
            k8s_client: RwLock::new(None),
            uuid_source: RwLock::new(NodeUuidSource::default()),
        };
        info!("Node manager initialized");
        manager
    }

    /// Number of registered node names, pending ones included
    pub fn registered_node_count(&self) -> usize {
        self.node_name_to_uuid.len()
    }

    /// Number of nodes with a discovered VM handle
    pub fn discovered_node_count(&self) -> usize {
        self.node_vms.len()
    }

    /// Snapshot of registered (name, UUID) pairs, sorted by name
    pub fn registered_nodes(&self) -> Vec<(NodeName, NodeUuid)> {
        let mut nodes: Vec<_> = self
            .node_name_to_uuid
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        nodes.sort_by(|a, b| a.0 .0.cmp(&b.0 .0));
        nodes
    }

    async fn discover(&self, uuid: &NodeUuid) -> Result<VirtualMachine> {
        if uuid.is_placeholder() {
            return Err(NodeManagerError::EmptyNodeUuid);
        }
        let vm = self
            .vcenter
            .find_vm_by_uuid(uuid, false)
            .await
            .map_err(|source| {
                error!(
                    "Couldn't find VM instance with nodeUUID {}, failed to discover with err: {}",
                    uuid, source
                );
                NodeManagerError::Discovery {
                    uuid: uuid.clone(),
                    source,
                }
            })?;
        self.node_vms.insert(uuid.clone(), vm.clone());
        info!("Successfully discovered node with nodeUUID {} in vm {}", uuid, vm);
        Ok(vm)
    }

    /// Renew `vm` and write the renewed handle back if the node is still
    /// discovered.
    async fn renew(
        &self,
        uuid: &NodeUuid,
        mut vm: VirtualMachine,
        reconnect: bool,
    ) -> Result<VirtualMachine> {
        self.vcenter
            .renew(&mut vm, reconnect)
            .await
            .map_err(|source| {
                error!("failed to renew VM {} with nodeUUID {} with err: {}", vm, uuid, source);
                NodeManagerError::Renewal {
                    uuid: uuid.clone(),
                    source,
                }
            })?;
        if let Some(mut entry) = self.node_vms.get_mut(uuid) {
            *entry = vm.clone();
        }
        Ok(vm)
    }

    async fn resolve_node_uuid(&self, name: &NodeName) -> Result<NodeUuid> {
        let client = self
            .k8s_client
            .read()
            .clone()
            .ok_or_else(|| NodeManagerError::KubernetesClientNotSet { name: name.clone() })?;
        let source = *self.uuid_source.read();
        client
            .get_node_uuid(name, source)
            .await
            .map_err(|source| NodeManagerError::Resolution {
                name: name.clone(),
                source,
            })
    }

    /// Persist a resolved UUID unless the name was unregistered or resolved
    /// concurrently.
    fn upgrade_placeholder(&self, name: &NodeName, uuid: &NodeUuid) {
        if let Some(mut entry) = self.node_name_to_uuid.get_mut(name) {
            if entry.is_placeholder() {
                *entry = uuid.clone();
            }
        }
    }
}

#[async_trait]
impl Manager for NodeManager {
    fn set_kubernetes_client(&self, client: Arc<dyn KubernetesClient>) {
        *self.k8s_client.write() = Some(client);
    }

    fn set_identifier_source(&self, source: NodeUuidSource) {
        *self.uuid_source.write() = source;
    }

    async fn register_node(&self, uuid: NodeUuid, name: NodeName) -> Result<()> {
        self.node_name_to_uuid.insert(name.clone(), uuid.clone());
        info!(
            "Successfully registered node: {:?} with nodeUUID {:?}",
            name.as_str(),
            uuid.as_str()
        );
        if let Err(err) = self.discover(&uuid).await {
            error!(
                "failed to discover VM with uuid: {:?} for node: {:?}",
                uuid.as_str(),
                name.as_str()
            );
            return Err(err);
        }
        info!(
            "Successfully discovered node: {:?} with nodeUUID {:?}",
            name.as_str(),
            uuid.as_str()
        );
        Ok(())
    }

    async fn discover_node(&self, uuid: &NodeUuid) -> Result<()> {
        self.discover(uuid).await.map(|_| ())
    }

    async fn get_node(
        &self,
        uuid: &NodeUuid,
        datacenter: Option<&Datacenter>,
    ) -> Result<VirtualMachine> {
        if uuid.is_placeholder() {
            return Err(NodeManagerError::EmptyNodeUuid);
        }

        // Clone out so no shard lock is held across the backend call.
        let cached = self.node_vms.get(uuid).map(|entry| entry.value().clone());
        let Some(vm) = cached else {
            info!("Node hasn't been discovered yet with nodeUUID {}", uuid);
            let vm = match datacenter {
                Some(dc) => {
                    let vm = self
                        .vcenter
                        .find_vm_by_uuid_in_datacenter(uuid, dc, false)
                        .await
                        .map_err(|source| {
                            error!(
                                "failed to find node with nodeUUID {} on datacenter: {} with err: {}",
                                uuid, dc, source
                            );
                            NodeManagerError::DatacenterDiscovery {
                                uuid: uuid.clone(),
                                datacenter: dc.clone(),
                                source,
                            }
                        })?;
                    self.node_vms.insert(uuid.clone(), vm.clone());
                    vm
                }
                None => self.discover(uuid).await?,
            };
            info!("Node was successfully discovered with nodeUUID {} in vm {}", uuid, vm);
            return Ok(vm);
        };

        debug!("Renewing virtual machine {} with nodeUUID {:?}", vm, uuid.as_str());
        let vm = self.renew(uuid, vm, true).await?;
        debug!("VM {} was successfully renewed with nodeUUID {:?}", vm, uuid.as_str());
        Ok(vm)
    }

    async fn get_node_by_name(&self, name: &NodeName) -> Result<VirtualMachine> {
        let uuid = self
            .node_name_to_uuid
            .get(name)
            .map(|entry| entry.value().clone());
        let Some(uuid) = uuid else {
            error!("Node not found with nodeName {}", name);
            return Err(NodeManagerError::NodeNotFound { name: name.clone() });
        };
        if !uuid.is_placeholder() {
            return self.get_node(&uuid, None).await;
        }

        info!("Empty nodeUUID observed in cache for the node: {:?}", name.as_str());
        let resolved = self.resolve_node_uuid(name).await.map_err(|err| {
            error!("failed to get node UUID from node: {:?}. Err: {}", name.as_str(), err);
            err
        })?;
        if resolved.is_placeholder() {
            error!("Node: {:?} with empty node UUID found in the cluster", name.as_str());
            return Err(NodeManagerError::EmptyResolvedUuid { name: name.clone() });
        }
        self.upgrade_placeholder(name, &resolved);
        self.get_node(&resolved, None).await
    }

    async fn get_node_name_by_uuid(&self, uuid: &NodeUuid) -> Result<NodeName> {
        if !uuid.is_placeholder() {
            let found = self
                .node_name_to_uuid
                .iter()
                .find(|entry| entry.value() == uuid)
                .map(|entry| entry.key().clone());
            if let Some(name) = found {
                debug!(
                    "Retrieved node name {:?} for node UUID {:?}",
                    name.as_str(),
                    uuid.as_str()
                );
                return Ok(name);
            }
        }
        error!("failed to find node name for node with UUID: {:?}", uuid.as_str());
        Err(NodeManagerError::NodeNameNotFound { uuid: uuid.clone() })
    }

    async fn get_all_nodes(&self) -> Result<Vec<VirtualMachine>> {
        let pending: Vec<NodeName> = self
            .node_name_to_uuid
            .iter()
            .filter(|entry| entry.value().is_placeholder())
            .map(|entry| entry.key().clone())
            .collect();

        for name in pending {
            info!("Empty node UUID observed for the node: {:?}", name.as_str());
            let resolved = match self.resolve_node_uuid(&name).await {
                Ok(uuid) => uuid,
                Err(err) => {
                    error!(
                        "failed to get node UUID from node: {:?}. Err: {}",
                        name.as_str(),
                        err
                    );
                    continue;
                }
            };
            if resolved.is_placeholder() {
                warn!(
                    "Node: {:?} with empty node UUID found in the cluster, skipping it",
                    name.as_str()
                );
                continue;
            }
            self.upgrade_placeholder(&name, &resolved);
        }

        let uuids: Vec<NodeUuid> = self
            .node_vms
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut reconnected_hosts: HashSet<String> = HashSet::new();
        let mut vms = Vec::with_capacity(uuids.len());

        for uuid in uuids {
            let Some(vm) = self.node_vms.get(&uuid).map(|entry| entry.value().clone()) else {
                warn!("VM instance was removed concurrently, ignoring with nodeUUID {}", uuid);
                continue;
            };

            let reconnect = !reconnected_hosts.contains(&vm.vcenter_host);
            if reconnect {
                debug!("Renewing VM {} with new connection: nodeUUID {}", vm, uuid);
                reconnected_hosts.insert(vm.vcenter_host.clone());
            } else {
                debug!("Renewing VM {}, no new connection needed: nodeUUID {}", vm, uuid);
            }

            let vm = self.renew(&uuid, vm, reconnect).await.map_err(|err| {
                error!("failed to renew VM with nodeUUID {}, aborting get all nodes", uuid);
                err
            })?;
            debug!("Updated VM {} for node with nodeUUID {}", vm, uuid);
            vms.push(vm);
        }

        Ok(vms)
    }

    async fn unregister_node(&self, name: &NodeName) -> Result<()> {
        let Some((_, uuid)) = self.node_name_to_uuid.remove(name) else {
            error!("Node wasn't found, failed to unregister node: {:?}", name.as_str());
            return Err(NodeManagerError::NodeNotFound { name: name.clone() });
        };
        if !uuid.is_placeholder() {
            self.node_vms.remove(&uuid);
        }
        info!("Successfully unregistered node with nodeName {}", name);
        Ok(())
    }
}
