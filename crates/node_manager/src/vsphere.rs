//! Virtualization backend contract used by the node manager.

use crate::types::{Datacenter, NodeUuid, SessionState, VirtualMachine};
use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by the virtualization backend.
#[derive(Debug, Error)]
pub enum VirtualizationError {
    #[error("virtual machine with UUID {uuid} wasn't found")]
    VmNotFound { uuid: NodeUuid },

    #[error("multiple virtual machines found with UUID {uuid}")]
    MultipleVmsFound { uuid: NodeUuid },

    #[error("failed to connect to vCenter {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("virtualization backend error: {0}")]
    Backend(String),
}

impl From<anyhow::Error> for VirtualizationError {
    fn from(value: anyhow::Error) -> Self {
        Self::Backend(value.to_string())
    }
}

/// Locates virtual machines and keeps their handles connected.
#[async_trait]
pub trait VirtualizationClient: Send + Sync {
    /// Search every registered vCenter for a VM with `uuid`.
    async fn find_vm_by_uuid(
        &self,
        uuid: &NodeUuid,
        allow_multiple: bool,
    ) -> Result<VirtualMachine, VirtualizationError>;

    /// Search a single datacenter for a VM with `uuid`.
    async fn find_vm_by_uuid_in_datacenter(
        &self,
        uuid: &NodeUuid,
        datacenter: &Datacenter,
        allow_multiple: bool,
    ) -> Result<VirtualMachine, VirtualizationError>;

    /// Refresh `vm` in place. With `reconnect` the vCenter connection is
    /// re-established first, otherwise the current one is reused.
    async fn renew(&self, vm: &mut VirtualMachine, reconnect: bool)
        -> Result<(), VirtualizationError>;
}

#[derive(Default)]
struct StubInventory {
    vms: RwLock<HashMap<NodeUuid, Vec<VirtualMachine>>>,
    /// vCenter host -> id of the live connection
    connections: RwLock<HashMap<String, u64>>,
    unreachable: RwLock<HashSet<NodeUuid>>,
    failing_renewals: RwLock<HashSet<NodeUuid>>,
    /// Successful renewals left before every renewal fails
    renewal_budget: RwLock<Option<usize>>,
    reconnects_by_host: RwLock<HashMap<String, usize>>,
    find_calls: AtomicUsize,
    datacenter_find_calls: AtomicUsize,
    reconnect_renewals: AtomicUsize,
    reused_renewals: AtomicUsize,
}

/// In-memory virtualization backend.
///
/// Counts every call and lets callers inject discovery or renewal failures
/// per UUID.
#[derive(Clone, Default)]
pub struct StubVirtualizationClient {
    inner: Arc<StubInventory>,
}

impl StubVirtualizationClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a VM to the inventory. A second VM with the same UUID makes
    /// lookups ambiguous.
    pub fn add_vm(&self, vm: VirtualMachine) {
        self.inner
            .vms
            .write()
            .entry(vm.uuid.clone())
            .or_default()
            .push(vm);
    }

    pub fn remove_vm(&self, uuid: &NodeUuid) {
        self.inner.vms.write().remove(uuid);
    }

    /// Make discovery of `uuid` fail with a connection error
    pub fn fail_discovery(&self, uuid: &NodeUuid) {
        self.inner.unreachable.write().insert(uuid.clone());
    }

    /// Make renewal of `uuid` fail with a connection error
    pub fn fail_renewal(&self, uuid: &NodeUuid) {
        self.inner.failing_renewals.write().insert(uuid.clone());
    }

    /// Let `successes` more renewals through, then fail every renewal
    pub fn fail_renewals_after(&self, successes: usize) {
        *self.inner.renewal_budget.write() = Some(successes);
    }

    pub fn clear_failures(&self) {
        self.inner.unreachable.write().clear();
        self.inner.failing_renewals.write().clear();
        *self.inner.renewal_budget.write() = None;
    }

    pub fn find_calls(&self) -> usize {
        self.inner.find_calls.load(Ordering::SeqCst)
    }

    pub fn datacenter_find_calls(&self) -> usize {
        self.inner.datacenter_find_calls.load(Ordering::SeqCst)
    }

    /// Renewals that forced a new connection
    pub fn reconnect_renewals(&self) -> usize {
        self.inner.reconnect_renewals.load(Ordering::SeqCst)
    }

    /// Renewals that reused the live connection
    pub fn reused_renewals(&self) -> usize {
        self.inner.reused_renewals.load(Ordering::SeqCst)
    }

    pub fn reconnects_for(&self, vcenter_host: &str) -> usize {
        self.inner
            .reconnects_by_host
            .read()
            .get(vcenter_host)
            .copied()
            .unwrap_or_default()
    }

    fn current_connection(&self, vcenter_host: &str) -> u64 {
        *self
            .inner
            .connections
            .write()
            .entry(vcenter_host.to_string())
            .or_insert(1)
    }

    fn reconnect(&self, vcenter_host: &str) -> u64 {
        *self
            .inner
            .reconnects_by_host
            .write()
            .entry(vcenter_host.to_string())
            .or_default() += 1;
        let mut connections = self.inner.connections.write();
        let id = connections.entry(vcenter_host.to_string()).or_insert(0);
        *id += 1;
        *id
    }

    fn lookup<F>(
        &self,
        uuid: &NodeUuid,
        allow_multiple: bool,
        filter: F,
    ) -> Result<VirtualMachine, VirtualizationError>
    where
        F: Fn(&VirtualMachine) -> bool,
    {
        if let Some(host) = self.unreachable_host(uuid) {
            return Err(VirtualizationError::Connection {
                host,
                reason: "connection refused".to_string(),
            });
        }

        let matches: Vec<VirtualMachine> = self
            .inner
            .vms
            .read()
            .get(uuid)
            .map(|vms| vms.iter().filter(|vm| filter(*vm)).cloned().collect())
            .unwrap_or_default();

        if matches.len() > 1 && !allow_multiple {
            return Err(VirtualizationError::MultipleVmsFound { uuid: uuid.clone() });
        }

        let mut vm = matches
            .into_iter()
            .next()
            .ok_or_else(|| VirtualizationError::VmNotFound { uuid: uuid.clone() })?;
        vm.session = SessionState::connected(self.current_connection(&vm.vcenter_host));
        Ok(vm)
    }

    fn unreachable_host(&self, uuid: &NodeUuid) -> Option<String> {
        if !self.inner.unreachable.read().contains(uuid) {
            return None;
        }
        let host = self
            .inner
            .vms
            .read()
            .get(uuid)
            .and_then(|vms| vms.first().map(|vm| vm.vcenter_host.clone()))
            .unwrap_or_else(|| "unknown".to_string());
        Some(host)
    }
}

#[async_trait]
impl VirtualizationClient for StubVirtualizationClient {
    async fn find_vm_by_uuid(
        &self,
        uuid: &NodeUuid,
        allow_multiple: bool,
    ) -> Result<VirtualMachine, VirtualizationError> {
        self.inner.find_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup(uuid, allow_multiple, |_| true)
    }

    async fn find_vm_by_uuid_in_datacenter(
        &self,
        uuid: &NodeUuid,
        datacenter: &Datacenter,
        allow_multiple: bool,
    ) -> Result<VirtualMachine, VirtualizationError> {
        self.inner.datacenter_find_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup(uuid, allow_multiple, |vm| vm.is_in(datacenter))
    }

    async fn renew(
        &self,
        vm: &mut VirtualMachine,
        reconnect: bool,
    ) -> Result<(), VirtualizationError> {
        if reconnect {
            self.inner.reconnect_renewals.fetch_add(1, Ordering::SeqCst);
        } else {
            self.inner.reused_renewals.fetch_add(1, Ordering::SeqCst);
        }

        if self.inner.failing_renewals.read().contains(&vm.uuid) {
            return Err(VirtualizationError::Connection {
                host: vm.vcenter_host.clone(),
                reason: "session expired".to_string(),
            });
        }

        if let Some(left) = self.inner.renewal_budget.write().as_mut() {
            if *left == 0 {
                return Err(anyhow!("vCenter {} rejected the session", vm.vcenter_host).into());
            }
            *left -= 1;
        }

        let current = self
            .inner
            .vms
            .read()
            .get(&vm.uuid)
            .and_then(|vms| vms.first().cloned())
            .ok_or_else(|| VirtualizationError::VmNotFound {
                uuid: vm.uuid.clone(),
            })?;

        let connection_id = if reconnect {
            self.reconnect(&current.vcenter_host)
        } else {
            self.current_connection(&current.vcenter_host)
        };

        vm.vcenter_host = current.vcenter_host;
        vm.datacenter = current.datacenter;
        vm.moref = current.moref;
        vm.session.renewed(connection_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(uuid: &str, host: &str) -> VirtualMachine {
        VirtualMachine::new(NodeUuid::new(uuid), host, "dc-1", format!("vm-{uuid}"))
    }

    #[tokio::test]
    async fn stub_finds_and_scopes() {
        let stub = StubVirtualizationClient::new();
        stub.add_vm(vm("u1", "vc-a"));

        let found = stub
            .find_vm_by_uuid(&NodeUuid::new("u1"), false)
            .await
            .expect("vm present");
        assert_eq!(found.moref, "vm-u1");
        assert_eq!(found.session.connection_id, 1);

        let wrong_dc = Datacenter::new("dc-2", "vc-a");
        let err = stub
            .find_vm_by_uuid_in_datacenter(&NodeUuid::new("u1"), &wrong_dc, false)
            .await
            .unwrap_err();
        assert!(matches!(err, VirtualizationError::VmNotFound { .. }));
        assert_eq!(stub.find_calls(), 1);
        assert_eq!(stub.datacenter_find_calls(), 1);
    }

    #[tokio::test]
    async fn duplicate_uuid_is_ambiguous_unless_allowed() {
        let stub = StubVirtualizationClient::new();
        stub.add_vm(vm("dup", "vc-a"));
        stub.add_vm(vm("dup", "vc-b"));

        let uuid = NodeUuid::new("dup");
        assert!(matches!(
            stub.find_vm_by_uuid(&uuid, false).await,
            Err(VirtualizationError::MultipleVmsFound { .. })
        ));
        assert!(stub.find_vm_by_uuid(&uuid, true).await.is_ok());
    }

    #[tokio::test]
    async fn reconnect_opens_new_connection() {
        let stub = StubVirtualizationClient::new();
        stub.add_vm(vm("u1", "vc-a"));
        let mut handle = stub
            .find_vm_by_uuid(&NodeUuid::new("u1"), false)
            .await
            .unwrap();

        stub.renew(&mut handle, true).await.unwrap();
        assert_eq!(handle.session.connection_id, 2);
        stub.renew(&mut handle, false).await.unwrap();
        assert_eq!(handle.session.connection_id, 2);
        assert_eq!(handle.session.renewals, 2);
        assert_eq!(stub.reconnects_for("vc-a"), 1);
    }

    #[tokio::test]
    async fn injected_renewal_failure() {
        let stub = StubVirtualizationClient::new();
        stub.add_vm(vm("u1", "vc-a"));
        let mut handle = stub
            .find_vm_by_uuid(&NodeUuid::new("u1"), false)
            .await
            .unwrap();
        stub.fail_renewal(&NodeUuid::new("u1"));

        let err = stub.renew(&mut handle, true).await.unwrap_err();
        assert!(matches!(err, VirtualizationError::Connection { .. }));
        assert_eq!(handle.session.renewals, 0);
    }

    #[tokio::test]
    async fn renewal_budget_runs_out() {
        let stub = StubVirtualizationClient::new();
        stub.add_vm(vm("u1", "vc-a"));
        let mut handle = stub
            .find_vm_by_uuid(&NodeUuid::new("u1"), false)
            .await
            .unwrap();
        stub.fail_renewals_after(1);

        stub.renew(&mut handle, false).await.unwrap();
        let err = stub.renew(&mut handle, false).await.unwrap_err();
        assert!(matches!(err, VirtualizationError::Backend(_)));
        assert_eq!(handle.session.renewals, 1);

        stub.clear_failures();
        stub.renew(&mut handle, false).await.unwrap();
        assert_eq!(handle.session.renewals, 2);
    }

    #[tokio::test]
    async fn renewal_of_deleted_vm_fails() {
        let stub = StubVirtualizationClient::new();
        stub.add_vm(vm("u1", "vc-a"));
        let mut handle = stub
            .find_vm_by_uuid(&NodeUuid::new("u1"), false)
            .await
            .unwrap();
        stub.remove_vm(&NodeUuid::new("u1"));

        let err = stub.renew(&mut handle, false).await.unwrap_err();
        assert!(matches!(err, VirtualizationError::VmNotFound { .. }));
    }
}
