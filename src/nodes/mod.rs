//! Registry of known nodes.
//!
//! A node is a machine running a daemon plus (optionally) an agent that
//! reports health over REST. Records live in memory, are written through
//! to the KV store under `<prefix>/nodes/<name>` and are rebuilt from
//! there on startup. Cluster membership is kept as a name only; the
//! endpoint client for a node's cluster is resolved through discovery at
//! use sites.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::docker::{NodeInfoProvider, ServiceNodeInfo};
use crate::kv::{self, KvStore};

/// Topic carrying [`NodeEvent`]s.
pub const NODE_EVENTS_TOPIC: &str = "node-events";

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Node '{0}' not found")]
    NotFound(String),
}

/// Health snapshot as last reported by the node's agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeHealth {
    /// When the report was taken.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    /// Cumulative system CPU jiffies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sys_cpu_jiffies: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_total: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_used: Option<u64>,

    /// Whether the agent could reach the local daemon.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
}

/// One node of the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Unique name, fleet-wide.
    pub name: String,

    /// Daemon address, `host:port`.
    pub address: String,

    /// Owning cluster, at most one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,

    #[serde(default)]
    pub health: NodeHealth,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            cluster: None,
            health: NodeHealth::default(),
        }
    }
}

/// What changed about a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEventKind {
    Registered,
    Health,
    Attached,
    Detached,
    Removed,
}

#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub node: String,
    pub kind: NodeEventKind,
}

/// Process-wide node registry.
pub struct NodeRegistry {
    nodes: DashMap<String, NodeRecord>,
    kv: Arc<dyn KvStore>,
    prefix: String,
    events: Arc<EventBus<NodeEvent>>,
}

impl NodeRegistry {
    pub fn new(
        kv: Arc<dyn KvStore>,
        prefix: &str,
        events: Arc<EventBus<NodeEvent>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            kv,
            prefix: kv::join(prefix, "nodes"),
            events,
        })
    }

    /// Rebuild the in-memory map from the KV tree.
    pub async fn load(&self) -> Result<(), crate::kv::KvError> {
        let keys = self.kv.list(&self.prefix).await?;
        for key in keys {
            if let Some(record) = kv::get_json::<NodeRecord>(self.kv.as_ref(), &key).await? {
                self.nodes.insert(record.name.clone(), record);
            }
        }
        info!("Loaded {} node(s)", self.nodes.len());
        Ok(())
    }

    pub fn list(&self) -> Vec<NodeRecord> {
        self.nodes.iter().map(|r| r.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<NodeRecord> {
        self.nodes.get(name).map(|r| r.clone())
    }

    pub fn list_by_cluster(&self, cluster: &str) -> Vec<NodeRecord> {
        self.nodes
            .iter()
            .filter(|r| r.cluster.as_deref() == Some(cluster))
            .map(|r| r.clone())
            .collect()
    }

    /// Create or update a node from a registration/health report.
    pub async fn register(&self, record: NodeRecord) -> NodeRecord {
        let name = record.name.clone();
        let known = self.nodes.contains_key(&name);
        let merged = {
            let mut entry = self.nodes.entry(name.clone()).or_insert_with(|| {
                NodeRecord::new(name.clone(), record.address.clone())
            });
            entry.address = record.address.clone();
            entry.health = record.health.clone();
            // Cluster assignment only changes through set_cluster.
            entry.clone()
        };
        self.flush(&merged).await;
        self.emit(
            &name,
            if known {
                NodeEventKind::Health
            } else {
                NodeEventKind::Registered
            },
        );
        merged
    }

    /// Point the node at a cluster (or detach with None). Feature
    /// validation happens in discovery, which owns cluster semantics.
    pub async fn set_cluster(
        &self,
        name: &str,
        cluster: Option<String>,
    ) -> Result<NodeRecord, NodeError> {
        let updated = {
            let mut entry = self
                .nodes
                .get_mut(name)
                .ok_or_else(|| NodeError::NotFound(name.to_string()))?;
            entry.cluster = cluster.clone();
            entry.clone()
        };
        self.flush(&updated).await;
        self.emit(
            name,
            if cluster.is_some() {
                NodeEventKind::Attached
            } else {
                NodeEventKind::Detached
            },
        );
        Ok(updated)
    }

    pub async fn remove(&self, name: &str) -> Option<NodeRecord> {
        let removed = self.nodes.remove(name).map(|(_, r)| r);
        if removed.is_some() {
            let key = kv::join(&self.prefix, name);
            if let Err(e) = self.kv.delete(&key).await {
                warn!("Can not delete node record '{}': {}", name, e);
            }
            self.emit(name, NodeEventKind::Removed);
        }
        removed
    }

    async fn flush(&self, record: &NodeRecord) {
        let key = kv::join(&self.prefix, &record.name);
        if let Err(e) = kv::put_json(self.kv.as_ref(), &key, record).await {
            // Keep the in-memory change; reconciliation re-flushes later.
            warn!("Can not persist node record '{}': {}", record.name, e);
        }
    }

    fn emit(&self, node: &str, kind: NodeEventKind) {
        self.events.publish(
            NODE_EVENTS_TOPIC,
            NodeEvent {
                node: node.to_string(),
                kind,
            },
        );
    }
}

impl NodeInfoProvider for NodeRegistry {
    fn node_info(&self, name: &str) -> Option<ServiceNodeInfo> {
        let record = self.nodes.get(name)?;
        Some(ServiceNodeInfo {
            name: record.name.clone(),
            address: Some(record.address.clone()),
            healthy: record.health.healthy,
            sys_cpu_jiffies: record.health.sys_cpu_jiffies,
            memory_total: record.health.memory_total,
            memory_used: record.health.memory_used,
            labels: Default::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn registry() -> (Arc<NodeRegistry>, Arc<dyn KvStore>) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let reg = NodeRegistry::new(kv.clone(), "fleet", Arc::new(EventBus::new()));
        (reg, kv)
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let (reg, kv) = registry();
        reg.register(NodeRecord::new("n1", "10.0.0.1:2375")).await;

        let rec = reg.get("n1").unwrap();
        assert_eq!(rec.address, "10.0.0.1:2375");
        assert!(kv.get("fleet/nodes/n1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_register_keeps_cluster() {
        let (reg, _) = registry();
        reg.register(NodeRecord::new("n1", "a:1")).await;
        reg.set_cluster("n1", Some("prod".to_string())).await.unwrap();

        // A later health report must not detach the node.
        reg.register(NodeRecord::new("n1", "a:1")).await;
        assert_eq!(reg.get("n1").unwrap().cluster.as_deref(), Some("prod"));
    }

    #[tokio::test]
    async fn test_set_cluster_unknown_node() {
        let (reg, _) = registry();
        let res = reg.set_cluster("ghost", Some("c".to_string())).await;
        assert!(matches!(res, Err(NodeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_by_cluster() {
        let (reg, _) = registry();
        reg.register(NodeRecord::new("n1", "a:1")).await;
        reg.register(NodeRecord::new("n2", "a:2")).await;
        reg.set_cluster("n1", Some("prod".to_string())).await.unwrap();

        let members = reg.list_by_cluster("prod");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "n1");
    }

    #[tokio::test]
    async fn test_load_from_kv() {
        let (reg, kv) = registry();
        reg.register(NodeRecord::new("n1", "a:1")).await;

        let fresh = NodeRegistry::new(kv, "fleet", Arc::new(EventBus::new()));
        fresh.load().await.unwrap();
        assert!(fresh.get("n1").is_some());
    }

    #[tokio::test]
    async fn test_events() {
        let bus = Arc::new(EventBus::new());
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let reg = NodeRegistry::new(kv, "fleet", bus.clone());
        let mut rx = bus.subscribe(NODE_EVENTS_TOPIC);

        reg.register(NodeRecord::new("n1", "a:1")).await;
        reg.remove("n1").await;

        assert_eq!(rx.recv().await.unwrap().kind, NodeEventKind::Registered);
        assert_eq!(rx.recv().await.unwrap().kind, NodeEventKind::Removed);
    }

    #[tokio::test]
    async fn test_node_info_provider() {
        let (reg, _) = registry();
        let mut rec = NodeRecord::new("n1", "a:1");
        rec.health.healthy = Some(true);
        rec.health.sys_cpu_jiffies = Some(100);
        reg.register(rec).await;

        let view = reg.node_info("n1").unwrap();
        assert_eq!(view.healthy, Some(true));
        assert_eq!(view.sys_cpu_jiffies, Some(100));
        assert!(reg.node_info("missing").is_none());
    }
}
