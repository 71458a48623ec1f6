//! Cluster registry.
//!
//! A cluster ("nodes group") is a named deployment target. A Swarm-backed
//! cluster is fronted by one aggregate orchestrator endpoint; a plain
//! group has no endpoint of its own, so discovery synthesizes one that
//! fans out over the member nodes. Cluster configurations persist under
//! `<prefix>/clusters/<name>` and survive restarts.

mod group;

pub use group::{GroupDockerService, NODE_CONSTRAINT_PREFIX};

use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::docker::{
    service_topic, ClusterConfig, DockerEndpoint, DockerError, DockerService, DockerServiceEvent,
    DockerServiceEventKind,
};
use crate::kv::{self, KvStore};
use crate::nodes::{NodeError, NodeRegistry};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Cluster '{0}' not found")]
    ClusterNotFound(String),

    #[error("Cluster '{0}' does not allow addition of nodes")]
    NodeAdditionForbidden(String),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error(transparent)]
    Kv(#[from] crate::kv::KvError),
}

/// Capabilities and restrictions of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Feature {
    /// The cluster is fronted by an orchestrator endpoint.
    Swarm,
    /// Nodes cannot be attached by operators.
    ForbidNodeAddition,
}

/// Persisted configuration of one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesGroupConfig {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Operator expression restricting which images the group runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_filter: Option<String>,

    #[serde(default)]
    pub features: HashSet<Feature>,

    #[serde(default)]
    pub config: ClusterConfig,

    /// Child group names; non-empty only for logical aggregates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

impl NodesGroupConfig {
    /// Config of a Swarm-fronted cluster.
    pub fn swarm(name: impl Into<String>, config: ClusterConfig) -> Self {
        let mut features = HashSet::new();
        features.insert(Feature::Swarm);
        Self {
            name: name.into(),
            title: None,
            description: None,
            image_filter: None,
            features,
            config,
            groups: Vec::new(),
        }
    }

    /// Config of a plain group over directly attached nodes.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            description: None,
            image_filter: None,
            features: HashSet::new(),
            config: ClusterConfig::default(),
            groups: Vec::new(),
        }
    }
}

/// A live group: its configuration plus the endpoint client fronting it.
pub struct NodesGroup {
    config: RwLock<NodesGroupConfig>,
    docker: RwLock<Arc<dyn DockerService>>,
    kv: Arc<dyn KvStore>,
    key: String,
}

impl NodesGroup {
    pub fn name(&self) -> String {
        self.read_config().name.clone()
    }

    pub fn config(&self) -> NodesGroupConfig {
        self.read_config().clone()
    }

    pub fn features(&self) -> HashSet<Feature> {
        self.read_config().features.clone()
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.read_config().features.contains(&feature)
    }

    /// The endpoint client for this group.
    pub fn docker(&self) -> Arc<dyn DockerService> {
        self.docker
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Mutate the configuration in memory; call [`NodesGroup::flush`] to
    /// persist.
    pub fn update_config<F: FnOnce(&mut NodesGroupConfig)>(&self, mutate: F) {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        mutate(&mut config);
    }

    /// Write the configuration through to the KV store.
    pub async fn flush(&self) {
        let snapshot = self.config();
        if let Err(e) = kv::put_json(self.kv.as_ref(), &self.key, &snapshot).await {
            warn!("Can not persist cluster '{}': {}", snapshot.name, e);
        }
    }

    fn read_config(&self) -> RwLockReadGuard<'_, NodesGroupConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_docker(&self, docker: Arc<dyn DockerService>) {
        *self.docker.write().unwrap_or_else(|e| e.into_inner()) = docker;
    }
}

/// Owns cluster lifecycle and the mapping from cluster names to endpoint
/// clients.
pub struct DiscoveryStorage {
    groups: DashMap<String, Arc<NodesGroup>>,
    kv: Arc<dyn KvStore>,
    prefix: String,
    events: Arc<EventBus<DockerServiceEvent>>,
    nodes: Arc<NodeRegistry>,
    endpoints: Arc<group::EndpointCache>,
}

impl DiscoveryStorage {
    pub fn new(
        kv: Arc<dyn KvStore>,
        prefix: &str,
        events: Arc<EventBus<DockerServiceEvent>>,
        nodes: Arc<NodeRegistry>,
    ) -> Arc<Self> {
        let endpoints = Arc::new(group::EndpointCache::new(nodes.clone(), events.clone()));
        Arc::new(Self {
            groups: DashMap::new(),
            kv,
            prefix: kv::join(prefix, "clusters"),
            events,
            nodes,
            endpoints,
        })
    }

    /// Rebuild groups from persisted configurations.
    pub async fn load(&self) -> Result<(), DiscoveryError> {
        for key in self.kv.list(&self.prefix).await? {
            if let Some(config) = kv::get_json::<NodesGroupConfig>(self.kv.as_ref(), &key).await? {
                let name = config.name.clone();
                match self.materialize(config) {
                    Ok(group) => {
                        self.groups.insert(name, group);
                    }
                    Err(e) => warn!("Skipping cluster '{}' from KV: {}", name, e),
                }
            }
        }
        info!("Loaded {} cluster(s)", self.groups.len());
        Ok(())
    }

    pub fn list(&self) -> Vec<Arc<NodesGroup>> {
        self.groups.iter().map(|r| r.clone()).collect()
    }

    pub fn get_cluster(&self, name: &str) -> Option<Arc<NodesGroup>> {
        self.groups.get(name).map(|r| r.clone())
    }

    /// The endpoint client for a cluster, when the cluster exists.
    pub fn get_service(&self, name: &str) -> Option<Arc<dyn DockerService>> {
        self.get_cluster(name).map(|g| g.docker())
    }

    /// Per-node endpoint client, for operations bound to one machine.
    pub fn node_service(&self, node: &str) -> Option<Arc<dyn DockerService>> {
        let record = self.nodes.get(node)?;
        self.endpoints.node_service(&record).ok()
    }

    /// Fetch or create a Swarm cluster with the given (or default) config.
    pub async fn get_or_create_cluster(
        &self,
        name: &str,
        config: Option<ClusterConfig>,
    ) -> Result<Arc<NodesGroup>, DiscoveryError> {
        if let Some(existing) = self.get_cluster(name) {
            return Ok(existing);
        }
        let group_config = NodesGroupConfig::swarm(name, config.unwrap_or_default());
        self.get_or_create_group(group_config).await
    }

    /// Fetch or create a group from a full configuration.
    pub async fn get_or_create_group(
        &self,
        config: NodesGroupConfig,
    ) -> Result<Arc<NodesGroup>, DiscoveryError> {
        let name = config.name.clone();
        if let Some(existing) = self.get_cluster(&name) {
            return Ok(existing);
        }
        let group = self.materialize(config)?;
        group.flush().await;
        self.groups.insert(name.clone(), group.clone());
        info!("Cluster created: {}", name);
        self.emit(&name, DockerServiceEventKind::ClusterCreated);
        Ok(group)
    }

    pub async fn delete_cluster(&self, name: &str) -> Option<Arc<NodesGroup>> {
        let removed = self.groups.remove(name).map(|(_, g)| g);
        if removed.is_some() {
            let key = kv::join(&self.prefix, name);
            if let Err(e) = self.kv.delete(&key).await {
                warn!("Can not delete cluster config '{}': {}", name, e);
            }
            // Detach members so they do not point at a ghost cluster.
            for node in self.nodes.list_by_cluster(name) {
                let _ = self.nodes.set_cluster(&node.name, None).await;
            }
            info!("Cluster deleted: {}", name);
            self.emit(name, DockerServiceEventKind::ClusterDeleted);
        }
        removed
    }

    /// Attach a node to a cluster (or detach with None). Respects
    /// [`Feature::ForbidNodeAddition`].
    pub async fn set_node_cluster(
        &self,
        node: &str,
        cluster: Option<&str>,
    ) -> Result<(), DiscoveryError> {
        if let Some(cluster) = cluster {
            let group = self
                .get_cluster(cluster)
                .ok_or_else(|| DiscoveryError::ClusterNotFound(cluster.to_string()))?;
            if group.has_feature(Feature::ForbidNodeAddition) {
                return Err(DiscoveryError::NodeAdditionForbidden(cluster.to_string()));
            }
            self.nodes.set_cluster(node, Some(cluster.to_string())).await?;
            // Membership changed; a synthesized endpoint must see the new
            // node set.
            self.rematerialize(&group)?;
        } else {
            self.nodes.set_cluster(node, None).await?;
        }
        Ok(())
    }

    /// Names of the nodes a group speaks for, child groups included.
    pub fn member_nodes(&self, group: &NodesGroup) -> Vec<String> {
        let config = group.config();
        let mut names: Vec<String> = self
            .nodes
            .list_by_cluster(&config.name)
            .into_iter()
            .map(|n| n.name)
            .collect();
        for child in &config.groups {
            if let Some(child_group) = self.get_cluster(child) {
                names.extend(self.member_nodes(&child_group));
            }
        }
        names.sort();
        names.dedup();
        names
    }

    fn materialize(&self, config: NodesGroupConfig) -> Result<Arc<NodesGroup>, DiscoveryError> {
        let docker = self.build_service(&config)?;
        let key = kv::join(&self.prefix, &config.name);
        Ok(Arc::new(NodesGroup {
            config: RwLock::new(config),
            docker: RwLock::new(docker),
            kv: self.kv.clone(),
            key,
        }))
    }

    fn rematerialize(&self, group: &Arc<NodesGroup>) -> Result<(), DiscoveryError> {
        let docker = self.build_service(&group.config())?;
        group.set_docker(docker);
        Ok(())
    }

    fn build_service(
        &self,
        config: &NodesGroupConfig,
    ) -> Result<Arc<dyn DockerService>, DiscoveryError> {
        if config.features.contains(&Feature::Swarm) && !config.config.hosts.is_empty() {
            let endpoint = DockerEndpoint::builder()
                .cluster(&config.name)
                .config(config.config.clone())
                .events(self.events.clone())
                .node_info(self.nodes.clone())
                .build()?;
            Ok(endpoint)
        } else {
            Ok(GroupDockerService::new(
                &config.name,
                config.config.clone(),
                self.endpoints.clone(),
                self.nodes.clone(),
            ))
        }
    }

    fn emit(&self, cluster: &str, kind: DockerServiceEventKind) {
        let service_id = format!("cluster:{cluster}");
        self.events.publish(
            &service_topic(&service_id),
            DockerServiceEvent { service_id, kind },
        );
    }
}

impl crate::jobs::ServiceResolver for DiscoveryStorage {
    fn resolve(&self, cluster: &str) -> Option<Arc<dyn DockerService>> {
        self.get_service(cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use crate::nodes::NodeRecord;

    async fn storage() -> (Arc<DiscoveryStorage>, Arc<NodeRegistry>, Arc<dyn KvStore>) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let nodes = NodeRegistry::new(kv.clone(), "fleet", Arc::new(EventBus::new()));
        let storage = DiscoveryStorage::new(kv.clone(), "fleet", Arc::new(EventBus::new()), nodes.clone());
        (storage, nodes, kv)
    }

    fn swarm_config(name: &str) -> NodesGroupConfig {
        NodesGroupConfig::swarm(
            name,
            ClusterConfig {
                hosts: vec!["localhost:4000".to_string()],
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_create_and_get_cluster() {
        let (storage, _, kv) = storage().await;
        storage.get_or_create_group(swarm_config("prod")).await.unwrap();

        let cluster = storage.get_cluster("prod").unwrap();
        assert!(cluster.has_feature(Feature::Swarm));
        assert_eq!(storage.get_service("prod").unwrap().id(), "cluster:prod");
        assert!(kv.get("fleet/clusters/prod").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (storage, _, _) = storage().await;
        let first = storage.get_or_create_cluster("c", None).await.unwrap();
        let second = storage.get_or_create_cluster("c", None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_plain_group_gets_fanout_service() {
        let (storage, _, _) = storage().await;
        storage
            .get_or_create_group(NodesGroupConfig::plain("lab"))
            .await
            .unwrap();
        let service = storage.get_service("lab").unwrap();
        assert_eq!(service.cluster(), Some("lab"));
        assert!(service.node().is_none());
    }

    #[tokio::test]
    async fn test_delete_cluster_detaches_nodes() {
        let (storage, nodes, kv) = storage().await;
        storage.get_or_create_group(swarm_config("prod")).await.unwrap();
        nodes.register(NodeRecord::new("n1", "a:1")).await;
        storage.set_node_cluster("n1", Some("prod")).await.unwrap();

        storage.delete_cluster("prod").await;
        assert!(storage.get_cluster("prod").is_none());
        assert!(nodes.get("n1").unwrap().cluster.is_none());
        assert!(kv.get("fleet/clusters/prod").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_forbidden_node_addition() {
        let (storage, nodes, _) = storage().await;
        let mut config = swarm_config("locked");
        config.features.insert(Feature::ForbidNodeAddition);
        storage.get_or_create_group(config).await.unwrap();
        nodes.register(NodeRecord::new("n1", "a:1")).await;

        let res = storage.set_node_cluster("n1", Some("locked")).await;
        assert!(matches!(res, Err(DiscoveryError::NodeAdditionForbidden(_))));
        // The node record is untouched.
        assert!(nodes.get("n1").unwrap().cluster.is_none());
    }

    #[tokio::test]
    async fn test_attach_to_missing_cluster() {
        let (storage, nodes, _) = storage().await;
        nodes.register(NodeRecord::new("n1", "a:1")).await;
        let res = storage.set_node_cluster("n1", Some("ghost")).await;
        assert!(matches!(res, Err(DiscoveryError::ClusterNotFound(_))));
    }

    #[tokio::test]
    async fn test_load_from_kv() {
        let (storage, nodes, kv) = storage().await;
        storage.get_or_create_group(swarm_config("prod")).await.unwrap();
        drop(storage);

        let fresh = DiscoveryStorage::new(kv, "fleet", Arc::new(EventBus::new()), nodes);
        fresh.load().await.unwrap();
        assert!(fresh.get_cluster("prod").is_some());
    }

    #[tokio::test]
    async fn test_member_nodes_with_children() {
        let (storage, nodes, _) = storage().await;
        storage.get_or_create_group(swarm_config("a")).await.unwrap();
        let mut parent = NodesGroupConfig::plain("all");
        parent.groups = vec!["a".to_string()];
        storage.get_or_create_group(parent).await.unwrap();

        nodes.register(NodeRecord::new("n1", "x:1")).await;
        nodes.register(NodeRecord::new("n2", "x:2")).await;
        storage.set_node_cluster("n1", Some("a")).await.unwrap();

        let group = storage.get_cluster("all").unwrap();
        assert_eq!(storage.member_nodes(&group), vec!["n1".to_string()]);
    }
}
