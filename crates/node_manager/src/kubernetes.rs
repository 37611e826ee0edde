//! Orchestration platform contract used to resolve node UUIDs.

use crate::types::{NodeName, NodeUuid, NodeUuidSource};
use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("{object} object for node {name} not found")]
    NodeNotFound {
        name: NodeName,
        object: NodeUuidSource,
    },

    #[error("kubernetes API error: {0}")]
    Api(String),
}

impl From<anyhow::Error> for KubernetesError {
    fn from(value: anyhow::Error) -> Self {
        Self::Api(value.to_string())
    }
}

/// Resolves node UUIDs from the orchestration platform.
#[async_trait]
pub trait KubernetesClient: Send + Sync {
    /// Read the UUID of node `name` from the object selected by `source`.
    /// An object without a UUID yet yields the placeholder UUID.
    async fn get_node_uuid(
        &self,
        name: &NodeName,
        source: NodeUuidSource,
    ) -> Result<NodeUuid, KubernetesError>;
}

#[derive(Default)]
struct StubObjects {
    node_uuids: RwLock<HashMap<NodeName, NodeUuid>>,
    csinode_uuids: RwLock<HashMap<NodeName, NodeUuid>>,
    failing: RwLock<HashSet<NodeName>>,
    calls: AtomicUsize,
}

/// Stub implementation backed by in-memory Node and CSINode objects.
#[derive(Clone, Default)]
pub struct StubKubernetesClient {
    inner: Arc<StubObjects>,
}

impl StubKubernetesClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `uuid` on the object selected by `source` for node `name`
    pub fn set_node_uuid(&self, name: NodeName, source: NodeUuidSource, uuid: NodeUuid) {
        let objects = match source {
            NodeUuidSource::Node => &self.inner.node_uuids,
            NodeUuidSource::CsiNode => &self.inner.csinode_uuids,
        };
        objects.write().insert(name, uuid);
    }

    pub fn fail_node(&self, name: &NodeName) {
        self.inner.failing.write().insert(name.clone());
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KubernetesClient for StubKubernetesClient {
    async fn get_node_uuid(
        &self,
        name: &NodeName,
        source: NodeUuidSource,
    ) -> Result<NodeUuid, KubernetesError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.failing.read().contains(name) {
            return Err(anyhow!(
                "the server is currently unable to handle the request (get {source} {name})"
            )
            .into());
        }

        let objects = match source {
            NodeUuidSource::Node => &self.inner.node_uuids,
            NodeUuidSource::CsiNode => &self.inner.csinode_uuids,
        };
        objects
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| KubernetesError::NodeNotFound {
                name: name.clone(),
                object: source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn resolves_from_selected_object() {
        let stub = StubKubernetesClient::new();
        let name = NodeName::new("worker-1");
        stub.set_node_uuid(name.clone(), NodeUuidSource::CsiNode, NodeUuid::new("csi-uuid"));

        let uuid = assert_ok!(stub.get_node_uuid(&name, NodeUuidSource::CsiNode).await);
        assert_eq!(uuid, NodeUuid::new("csi-uuid"));

        let err = assert_err!(stub.get_node_uuid(&name, NodeUuidSource::Node).await);
        assert!(matches!(err, KubernetesError::NodeNotFound { .. }));
        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test]
    async fn api_failure_is_reported() {
        let stub = StubKubernetesClient::new();
        let name = NodeName::new("worker-2");
        stub.set_node_uuid(name.clone(), NodeUuidSource::Node, NodeUuid::new("u2"));
        stub.fail_node(&name);

        let err = assert_err!(stub.get_node_uuid(&name, NodeUuidSource::Node).await);
        assert!(matches!(err, KubernetesError::Api(_)));
    }
}
