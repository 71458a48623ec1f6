//! Fleet-wide container index.
//!
//! Every container the control plane has ever observed, whether via a
//! create call, a listing or a daemon event, gets a [`ContainerRegistration`]
//! keyed by container id and mirrored into the KV store under
//! `<prefix>/containers/<id>`. The registry is eventually consistent with
//! the fleet: daemon events update it immediately and a periodic
//! reconciliation pass repairs whatever the events missed.

mod sync;

pub use sync::{spawn_event_pump, spawn_reconciler};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::docker::{Container, DockerEvent, DockerService, GetContainersArg, Port};
use crate::kv::{self, KvStore};

/// Topic carrying re-published daemon container events.
pub const CONTAINER_EVENTS_TOPIC: &str = "container-events";

/// Last-known attributes of one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerBase {
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub image: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,

    /// Owning node name, absent only until first resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,

    /// Raw status string as the daemon reports it ("Up 2 minutes").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl ContainerBase {
    /// Canonical fleet-wide unique name: `node-name/container-name`.
    pub fn qualified_name(&self) -> Option<String> {
        match (&self.node, &self.name) {
            (Some(node), Some(name)) => Some(format!("{node}/{name}")),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.contains("Up"))
            .unwrap_or(false)
    }

    /// Build from a listing row. Names come back as `/name` from a node
    /// engine and `/node/name` from an orchestrator; the first resolved
    /// name wins and `fallback_node` covers single-node endpoints.
    pub fn from_listing(c: &Container, fallback_node: Option<&str>) -> Self {
        let mut node = fallback_node.map(str::to_string);
        let mut name = None;
        for raw in &c.names {
            let trimmed = raw.trim_start_matches('/');
            let resolved = match trimmed.split_once('/') {
                Some((node_part, name_part)) => {
                    if node.is_none() {
                        node = Some(node_part.to_string());
                    }
                    name_part
                }
                None => trimmed,
            };
            if name.is_none() {
                name = Some(resolved.to_string());
            } else if name.as_deref() != Some(resolved) {
                debug!("Container {} has extra name '{}'", c.id, resolved);
            }
        }
        if c.image_id.is_none() {
            warn!(
                "'ImageID' for '{}' is null; old daemon version or an error",
                c.id
            );
        }
        Self {
            id: c.id.clone(),
            name,
            image: c.image.clone(),
            image_id: c.image_id.clone(),
            node,
            labels: c.labels.clone(),
            ports: c.ports.clone(),
            status: c.status.clone(),
            created: Utc.timestamp_opt(c.created, 0).single(),
        }
    }
}

/// One registered container: attributes plus write-through persistence.
/// The inner lock serializes mutations per container id.
pub struct ContainerRegistration {
    id: String,
    key: String,
    kv: Arc<dyn KvStore>,
    state: Mutex<ContainerBase>,
}

impl ContainerRegistration {
    fn new(prefix: &str, base: ContainerBase, kv: Arc<dyn KvStore>) -> Arc<Self> {
        let id = base.id.clone();
        Arc::new(Self {
            key: kv::join(prefix, &id),
            id,
            kv,
            state: Mutex::new(base),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn container(&self) -> ContainerBase {
        self.state.lock().await.clone()
    }

    pub async fn node(&self) -> Option<String> {
        self.state.lock().await.node.clone()
    }

    /// Apply a mutation and write it through. A failed KV write keeps the
    /// in-memory change and is retried by the next reconciliation pass.
    pub async fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut ContainerBase),
    {
        let mut state = self.state.lock().await;
        mutate(&mut state);
        self.flush_locked(&state).await;
    }

    pub async fn flush(&self) {
        let state = self.state.lock().await;
        self.flush_locked(&state).await;
    }

    async fn flush_locked(&self, state: &ContainerBase) {
        if let Err(e) = kv::put_json(self.kv.as_ref(), &self.key, state).await {
            warn!("Can not persist container '{}': {}", self.id, e);
        }
    }
}

/// Process-wide container registry.
pub struct ContainerRegistry {
    containers: DashMap<String, Arc<ContainerRegistration>>,
    kv: Arc<dyn KvStore>,
    prefix: String,
    events: Arc<EventBus<DockerEvent>>,
}

impl ContainerRegistry {
    pub fn new(
        kv: Arc<dyn KvStore>,
        prefix: &str,
        events: Arc<EventBus<DockerEvent>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            containers: DashMap::new(),
            kv,
            prefix: kv::join(prefix, "containers"),
            events,
        })
    }

    /// Rebuild from KV on startup; live endpoints reconcile afterwards.
    pub async fn load(&self) -> Result<(), crate::kv::KvError> {
        for key in self.kv.list(&self.prefix).await? {
            if let Some(base) = kv::get_json::<ContainerBase>(self.kv.as_ref(), &key).await? {
                let registration =
                    ContainerRegistration::new(&self.prefix, base, self.kv.clone());
                self.containers
                    .insert(registration.id().to_string(), registration);
            }
        }
        info!("Loaded {} container registration(s)", self.containers.len());
        Ok(())
    }

    pub fn list(&self) -> Vec<Arc<ContainerRegistration>> {
        self.containers.iter().map(|r| r.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<ContainerRegistration>> {
        self.containers.get(id).map(|r| r.clone())
    }

    /// Find by exact id, id prefix or name (bare or `node/name`).
    pub async fn find(&self, name_or_id: &str) -> Option<Arc<ContainerRegistration>> {
        if let Some(hit) = self.get(name_or_id) {
            return Some(hit);
        }
        // Snapshot first: shard locks must not be held across awaits.
        for registration in self.list() {
            if registration.id().starts_with(name_or_id) {
                return Some(registration);
            }
            let base = registration.container().await;
            if base.name.as_deref() == Some(name_or_id)
                || base.qualified_name().as_deref() == Some(name_or_id)
            {
                return Some(registration);
            }
        }
        None
    }

    pub async fn list_by_node(&self, node: &str) -> Vec<Arc<ContainerRegistration>> {
        let mut out = Vec::new();
        for registration in self.list() {
            if registration.node().await.as_deref() == Some(node) {
                out.push(registration);
            }
        }
        out
    }

    /// Get the registration for `base.id`, creating (and flushing) it when
    /// absent.
    pub async fn get_or_create(&self, base: ContainerBase) -> Arc<ContainerRegistration> {
        let id = base.id.clone();
        let (registration, created) = match self.containers.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(o) => (o.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let name = base.name.clone().unwrap_or_default();
                let image = base.image.clone();
                let registration =
                    ContainerRegistration::new(&self.prefix, base, self.kv.clone());
                v.insert(registration.clone());
                info!("Container create: {} '{}', of '{}'", id, name, image);
                (registration, true)
            }
        };
        if created {
            registration.flush().await;
        }
        registration
    }

    /// Drop a registration: its KV record first, then memory. KV failures
    /// are tolerated with a warning.
    pub async fn remove(&self, id: &str) -> Option<Arc<ContainerRegistration>> {
        let key = kv::join(&self.prefix, id);
        if let Err(e) = self.kv.delete(&key).await {
            warn!("Can not delete container record '{}': {}", id, e);
        }
        let removed = self.containers.remove(id).map(|(_, r)| r);
        if let Some(registration) = &removed {
            let base = registration.container().await;
            info!(
                "Container remove: {} '{}', of '{}'",
                id,
                base.name.as_deref().unwrap_or(""),
                base.image
            );
        }
        removed
    }

    /// Remove every registration owned by a node.
    pub async fn remove_node(&self, node: &str) {
        for registration in self.list_by_node(node).await {
            self.remove(registration.id()).await;
        }
    }

    /// Apply one daemon container event, re-publishing it on the
    /// container-events topic.
    pub async fn apply_event(&self, event: &DockerEvent) {
        if event.kind.as_deref() == Some("container") {
            if let (Some(id), Some(action)) = (event.subject_id(), event.action.as_deref()) {
                match action {
                    "destroy" => {
                        self.remove(id).await;
                    }
                    "create" | "start" | "stop" | "die" => {
                        let base = ContainerBase {
                            id: id.to_string(),
                            name: event.subject_name().map(str::to_string),
                            image: event.from.clone().unwrap_or_default(),
                            status: Some(status_for_action(action).to_string()),
                            ..Default::default()
                        };
                        let registration = self.get_or_create(base).await;
                        registration
                            .update(|c| {
                                c.status = Some(status_for_action(action).to_string());
                                if let Some(name) = event.subject_name() {
                                    c.name = Some(name.to_string());
                                }
                            })
                            .await;
                    }
                    _ => {}
                }
            }
        }
        self.events.publish(CONTAINER_EVENTS_TOPIC, event.clone());
    }

    /// Full repair against one endpoint's listing. `scope_nodes` names the
    /// nodes this endpoint speaks for; registrations on those nodes that
    /// the listing no longer contains are dropped.
    pub async fn reconcile(&self, service: &dyn DockerService, scope_nodes: &[String]) {
        let listing = match service.get_containers(&GetContainersArg::new(true)).await {
            Ok(listing) => listing,
            Err(e) => {
                debug!("Skipping reconciliation of {}: {}", service.id(), e);
                return;
            }
        };
        let mut seen = std::collections::HashSet::new();
        for row in &listing {
            seen.insert(row.id.clone());
            let base = ContainerBase::from_listing(row, service.node());
            let registration = self.get_or_create(base.clone()).await;
            registration
                .update(|c| {
                    c.name = base.name.clone();
                    c.image = base.image.clone();
                    c.image_id = base.image_id.clone();
                    c.node = base.node.clone().or_else(|| c.node.take());
                    c.labels = base.labels.clone();
                    c.ports = base.ports.clone();
                    c.status = base.status.clone();
                    c.created = base.created.or(c.created);
                })
                .await;
        }
        for registration in self.list() {
            if seen.contains(registration.id()) {
                continue;
            }
            let node = registration.node().await;
            let in_scope = match &node {
                Some(n) => scope_nodes.iter().any(|s| s == n),
                None => false,
            };
            if in_scope {
                self.remove(registration.id()).await;
            }
        }
    }
}

fn status_for_action(action: &str) -> &'static str {
    match action {
        "create" => "Created",
        "start" => "Up",
        "stop" => "Exited",
        "die" => "Exited",
        _ => "Unknown",
    }
}

/// Invents unique container names by probing the target endpoint.
pub struct ContainerNamesService;

impl ContainerNamesService {
    /// Pick `base` when free, otherwise `base-2`, `base-3`, ...
    pub async fn unique_name(service: &dyn DockerService, base: &str) -> String {
        let in_use: std::collections::HashSet<String> = match service
            .get_containers(&GetContainersArg::new(true))
            .await
        {
            Ok(listing) => listing
                .iter()
                .flat_map(|c| c.names.iter())
                .map(|n| {
                    let n = n.trim_start_matches('/');
                    n.rsplit('/').next().unwrap_or(n).to_string()
                })
                .collect(),
            Err(e) => {
                debug!("Name probe on {} failed: {}", service.id(), e);
                Default::default()
            }
        };
        if !in_use.contains(base) {
            return base.to_string();
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}-{n}");
            if !in_use.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn registry() -> (Arc<ContainerRegistry>, Arc<dyn KvStore>) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let reg = ContainerRegistry::new(kv.clone(), "fleet", Arc::new(EventBus::new()));
        (reg, kv)
    }

    fn base(id: &str, name: &str, node: &str, image: &str) -> ContainerBase {
        ContainerBase {
            id: id.to_string(),
            name: Some(name.to_string()),
            image: image.to_string(),
            node: Some(node.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (reg, kv) = registry();
        let first = reg.get_or_create(base("abc123", "web", "n1", "app:1")).await;
        let second = reg.get_or_create(base("abc123", "other", "n2", "app:2")).await;

        // Same registration; the second base is ignored.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.container().await.name.as_deref(), Some("web"));
        assert!(kv.get("fleet/containers/abc123").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_find_by_id_prefix_and_name() {
        let (reg, _) = registry();
        reg.get_or_create(base("abc123def", "web", "n1", "app:1")).await;

        assert!(reg.find("abc123def").await.is_some());
        assert!(reg.find("abc12").await.is_some());
        assert!(reg.find("web").await.is_some());
        assert!(reg.find("n1/web").await.is_some());
        assert!(reg.find("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_deletes_kv() {
        let (reg, kv) = registry();
        reg.get_or_create(base("abc", "web", "n1", "app:1")).await;
        reg.remove("abc").await;

        assert!(reg.get("abc").is_none());
        assert!(kv.get("fleet/containers/abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_node_bulk() {
        let (reg, _) = registry();
        reg.get_or_create(base("a", "one", "n1", "app:1")).await;
        reg.get_or_create(base("b", "two", "n1", "app:1")).await;
        reg.get_or_create(base("c", "three", "n2", "app:1")).await;

        reg.remove_node("n1").await;
        assert_eq!(reg.list().len(), 1);
        assert!(reg.get("c").is_some());
    }

    #[tokio::test]
    async fn test_apply_destroy_event() {
        let (reg, _) = registry();
        reg.get_or_create(base("abc", "web", "n1", "app:1")).await;

        let event: DockerEvent = serde_json::from_str(
            r#"{"Type":"container","Action":"destroy","id":"abc"}"#,
        )
        .unwrap();
        reg.apply_event(&event).await;
        assert!(reg.get("abc").is_none());
    }

    #[tokio::test]
    async fn test_apply_event_creates_unknown() {
        let (reg, _) = registry();
        let event: DockerEvent = serde_json::from_str(
            r#"{"Type":"container","Action":"start","id":"fresh1","from":"app:1",
                "Actor":{"ID":"fresh1","Attributes":{"name":"web"}}}"#,
        )
        .unwrap();
        reg.apply_event(&event).await;

        let c = reg.get("fresh1").unwrap().container().await;
        assert_eq!(c.name.as_deref(), Some("web"));
        assert_eq!(c.status.as_deref(), Some("Up"));
    }

    #[tokio::test]
    async fn test_load_roundtrip() {
        let (reg, kv) = registry();
        reg.get_or_create(base("abc", "web", "n1", "app:1")).await;

        let fresh = ContainerRegistry::new(kv, "fleet", Arc::new(EventBus::new()));
        fresh.load().await.unwrap();
        let c = fresh.get("abc").unwrap().container().await;
        assert_eq!(c.qualified_name().as_deref(), Some("n1/web"));
    }

    #[test]
    fn test_from_listing_name_forms() {
        let row: Container = serde_json::from_str(
            r#"{"Id":"x","Names":["/n2/web"],"Image":"app:1","Created":0}"#,
        )
        .unwrap();
        let base = ContainerBase::from_listing(&row, None);
        assert_eq!(base.node.as_deref(), Some("n2"));
        assert_eq!(base.name.as_deref(), Some("web"));

        let row: Container =
            serde_json::from_str(r#"{"Id":"y","Names":["/web"],"Image":"app:1","Created":0}"#)
                .unwrap();
        let base = ContainerBase::from_listing(&row, Some("n1"));
        assert_eq!(base.node.as_deref(), Some("n1"));
        assert_eq!(base.qualified_name().as_deref(), Some("n1/web"));
    }
}
