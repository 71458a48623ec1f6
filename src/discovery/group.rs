//! Synthesized endpoint for plain node groups.
//!
//! A group without an orchestrator still has to answer the same operation
//! set as a Swarm cluster, so [`GroupDockerService`] fans reads out over
//! the member nodes' endpoints and routes container operations to whichever
//! member owns the container. Listing rows get their names rewritten to the
//! orchestrator form (`/node/name`) so callers see one consistent shape.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::EventBus;
use crate::docker::{
    Container, ContainerDetails, CreateContainerResult, CreateContainerSpec, DeleteContainerArg,
    DockerEndpoint, DockerError, DockerService, DockerServiceEvent, GetContainersArg,
    GetEventsArg, GetImagesArg, GetLogsArg, GetStatisticsArg, ImageDescriptor, ImageItem,
    KillContainerArg, Network, ProcessEvent, RemoveImageArg, ResultCode, ServiceCallResult,
    ServiceInfo, ServiceNodeInfo, StopContainerArg, TagImageArg, UpdateContainerSpec,
};
use crate::docker::ClusterConfig;
use crate::nodes::{NodeRecord, NodeRegistry};

/// Env entry that pins a create to one member node, in the orchestrator's
/// own constraint syntax.
pub const NODE_CONSTRAINT_PREFIX: &str = "constraint:node==";

/// Lazily-built per-node endpoint clients, shared by every synthesized
/// group service.
pub struct EndpointCache {
    nodes: Arc<NodeRegistry>,
    events: Arc<EventBus<DockerServiceEvent>>,
    endpoints: DashMap<String, Arc<DockerEndpoint>>,
}

impl EndpointCache {
    pub fn new(nodes: Arc<NodeRegistry>, events: Arc<EventBus<DockerServiceEvent>>) -> Self {
        Self {
            nodes,
            events,
            endpoints: DashMap::new(),
        }
    }

    pub fn node_service(
        &self,
        record: &NodeRecord,
    ) -> Result<Arc<dyn DockerService>, DockerError> {
        if let Some(existing) = self.endpoints.get(&record.name) {
            if existing.config().hosts.first() == Some(&record.address) {
                return Ok(existing.clone());
            }
        }
        let endpoint = DockerEndpoint::builder()
            .node(&record.name)
            .config(ClusterConfig {
                hosts: vec![record.address.clone()],
                ..Default::default()
            })
            .events(self.events.clone())
            .node_info(self.nodes.clone())
            .build()?;
        self.endpoints.insert(record.name.clone(), endpoint.clone());
        Ok(endpoint)
    }
}

/// Fan-out [`DockerService`] over a group's member nodes.
pub struct GroupDockerService {
    id: String,
    cluster: String,
    config: ClusterConfig,
    endpoints: Arc<EndpointCache>,
    nodes: Arc<NodeRegistry>,
}

impl GroupDockerService {
    pub fn new(
        cluster: &str,
        config: ClusterConfig,
        endpoints: Arc<EndpointCache>,
        nodes: Arc<NodeRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: format!("cluster:{cluster}"),
            cluster: cluster.to_string(),
            config,
            endpoints,
            nodes,
        })
    }

    fn members(&self) -> Vec<(String, Arc<dyn DockerService>)> {
        self.nodes
            .list_by_cluster(&self.cluster)
            .into_iter()
            .filter_map(|record| {
                let name = record.name.clone();
                match self.endpoints.node_service(&record) {
                    Ok(service) => Some((name, service)),
                    Err(e) => {
                        debug!("No endpoint for member '{}': {}", name, e);
                        None
                    }
                }
            })
            .collect()
    }

    /// Run a container mutation against members until one of them knows
    /// the container.
    async fn route<F, Fut>(&self, op: F) -> ServiceCallResult
    where
        F: Fn(Arc<dyn DockerService>) -> Fut + Send,
        Fut: std::future::Future<Output = ServiceCallResult> + Send,
    {
        let members = self.members();
        if members.is_empty() {
            return ServiceCallResult::with_message(
                ResultCode::Error,
                format!("cluster {} has no nodes", self.cluster),
            );
        }
        let mut last = ServiceCallResult::with_message(ResultCode::NotFound, "no such container");
        for (_, service) in members {
            let res = op(service).await;
            if res.code != ResultCode::NotFound {
                return res;
            }
            last = res;
        }
        last
    }

    fn pinned_node(spec: &CreateContainerSpec) -> Option<String> {
        spec.env
            .iter()
            .find_map(|e| e.strip_prefix(NODE_CONSTRAINT_PREFIX))
            .map(str::to_string)
    }
}

#[async_trait]
impl DockerService for GroupDockerService {
    fn id(&self) -> &str {
        &self.id
    }

    fn cluster(&self) -> Option<&str> {
        Some(&self.cluster)
    }

    fn node(&self) -> Option<&str> {
        None
    }

    fn is_online(&self) -> bool {
        let members = self.members();
        members.is_empty() || members.iter().any(|(_, s)| s.is_online())
    }

    fn config(&self) -> &ClusterConfig {
        &self.config
    }

    async fn get_containers(&self, arg: &GetContainersArg) -> Result<Vec<Container>, DockerError> {
        let members = self.members();
        let results = join_all(
            members
                .iter()
                .map(|(_, service)| service.get_containers(arg)),
        )
        .await;
        let mut out = Vec::new();
        for ((node, _), result) in members.iter().zip(results) {
            match result {
                Ok(rows) => {
                    for mut row in rows {
                        // Rewrite to the aggregate name form.
                        row.names = row
                            .names
                            .iter()
                            .map(|n| format!("/{}/{}", node, n.trim_start_matches('/')))
                            .collect();
                        out.push(row);
                    }
                }
                Err(e) => debug!("Member '{}' listing failed: {}", node, e),
            }
        }
        Ok(out)
    }

    async fn get_container(&self, id: &str) -> Result<Option<ContainerDetails>, DockerError> {
        for (_, service) in self.members() {
            if let Some(details) = service.get_container(id).await? {
                return Ok(Some(details));
            }
        }
        Ok(None)
    }

    async fn create_container(&self, spec: &CreateContainerSpec) -> CreateContainerResult {
        let members = self.members();
        if members.is_empty() {
            return CreateContainerResult::failure(ServiceCallResult::with_message(
                ResultCode::Error,
                format!("cluster {} has no nodes", self.cluster),
            ));
        }
        let target = Self::pinned_node(spec);
        let chosen = match &target {
            Some(node) => members.iter().find(|(name, _)| name == node),
            // Placement is the orchestrator's business; without one the
            // first online member takes it.
            None => members
                .iter()
                .find(|(_, s)| s.is_online())
                .or_else(|| members.first()),
        };
        match chosen {
            Some((_, service)) => service.create_container(spec).await,
            None => CreateContainerResult::failure(ServiceCallResult::with_message(
                ResultCode::Error,
                format!(
                    "node '{}' is not a member of cluster {}",
                    target.unwrap_or_default(),
                    self.cluster
                ),
            )),
        }
    }

    async fn start_container(&self, id: &str) -> ServiceCallResult {
        self.route(|s| async move { s.start_container(id).await })
            .await
    }

    async fn stop_container(&self, arg: &StopContainerArg) -> ServiceCallResult {
        self.route(|s| async move { s.stop_container(arg).await })
            .await
    }

    async fn restart_container(&self, arg: &StopContainerArg) -> ServiceCallResult {
        self.route(|s| async move { s.restart_container(arg).await })
            .await
    }

    async fn kill_container(&self, arg: &KillContainerArg) -> ServiceCallResult {
        self.route(|s| async move { s.kill_container(arg).await })
            .await
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> ServiceCallResult {
        self.route(|s| async move { s.rename_container(id, new_name).await })
            .await
    }

    async fn update_container(&self, id: &str, spec: &UpdateContainerSpec) -> ServiceCallResult {
        self.route(|s| async move { s.update_container(id, spec).await })
            .await
    }

    async fn delete_container(&self, arg: &DeleteContainerArg) -> ServiceCallResult {
        self.route(|s| async move { s.delete_container(arg).await })
            .await
    }

    async fn get_images(&self, arg: &GetImagesArg) -> Result<Vec<ImageItem>, DockerError> {
        let mut out = Vec::new();
        for (node, service) in self.members() {
            match service.get_images(arg).await {
                Ok(items) => out.extend(items),
                Err(e) => debug!("Member '{}' image listing failed: {}", node, e),
            }
        }
        Ok(out)
    }

    async fn pull_image(
        &self,
        name: &str,
        watcher: mpsc::Sender<ProcessEvent>,
    ) -> Result<Option<ImageDescriptor>, DockerError> {
        // Without an orchestrator the image must land on every member.
        let mut descriptor = None;
        let mut last_err = None;
        for (node, service) in self.members() {
            match service.pull_image(name, watcher.clone()).await {
                Ok(Some(d)) => descriptor = Some(d),
                Ok(None) => {}
                Err(e) => {
                    debug!("Pull of '{}' on '{}' failed: {}", name, node, e);
                    last_err = Some(e);
                }
            }
        }
        match (descriptor, last_err) {
            (Some(d), _) => Ok(Some(d)),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(None),
        }
    }

    async fn get_image(&self, name: &str) -> Result<Option<ImageDescriptor>, DockerError> {
        for (_, service) in self.members() {
            if let Some(descriptor) = service.get_image(name).await? {
                return Ok(Some(descriptor));
            }
        }
        Ok(None)
    }

    async fn tag_image(&self, arg: &TagImageArg) -> ServiceCallResult {
        self.route(|s| async move { s.tag_image(arg).await }).await
    }

    async fn remove_image(&self, arg: &RemoveImageArg) -> ServiceCallResult {
        let mut last = ServiceCallResult::with_message(ResultCode::NotFound, "no such image");
        for (_, service) in self.members() {
            let res = service.remove_image(arg).await;
            if res.code != ResultCode::NotFound {
                last = res;
            }
        }
        last
    }

    async fn get_networks(&self) -> Result<Vec<Network>, DockerError> {
        let mut out = Vec::new();
        for (node, service) in self.members() {
            match service.get_networks().await {
                Ok(networks) => out.extend(networks),
                Err(e) => debug!("Member '{}' network listing failed: {}", node, e),
            }
        }
        Ok(out)
    }

    async fn create_network(&self, network: &Network) -> ServiceCallResult {
        let mut last = ServiceCallResult::with_message(
            ResultCode::Error,
            format!("cluster {} has no nodes", self.cluster),
        );
        for (_, service) in self.members() {
            last = service.create_network(network).await;
            if !last.is_ok() {
                return last;
            }
        }
        last
    }

    async fn get_info(&self) -> Result<ServiceInfo, DockerError> {
        let members = self.members();
        let mut info = ServiceInfo {
            name: Some(self.cluster.clone()),
            ..Default::default()
        };
        for (node, service) in &members {
            match service.get_info().await {
                Ok(member_info) => {
                    info.containers += member_info.containers;
                    info.images += member_info.images;
                    info.mem_total += member_info.mem_total;
                    if info.server_version.is_none() {
                        info.server_version = member_info.server_version;
                    }
                }
                Err(e) => {
                    debug!("Member '{}' info failed: {}", node, e);
                    info.off_node_count += 1;
                }
            }
            let row = self
                .nodes
                .get(node)
                .map(|record| ServiceNodeInfo {
                    name: record.name.clone(),
                    address: Some(record.address.clone()),
                    healthy: record.health.healthy,
                    sys_cpu_jiffies: record.health.sys_cpu_jiffies,
                    memory_total: record.health.memory_total,
                    memory_used: record.health.memory_used,
                    labels: Default::default(),
                })
                .unwrap_or_else(|| ServiceNodeInfo {
                    name: node.clone(),
                    ..Default::default()
                });
            info.nodes.push(row);
        }
        info.node_count = members.len() as u32;
        Ok(info)
    }

    async fn subscribe_events(&self, arg: GetEventsArg) -> ServiceCallResult {
        let members = self.members();
        if members.is_empty() {
            return ServiceCallResult::ok();
        }
        let streams = members.into_iter().map(|(_, service)| {
            let member_arg = GetEventsArg {
                since: arg.since,
                until: arg.until,
                sink: arg.sink.clone(),
                cancel: arg.cancel.clone(),
            };
            async move { service.subscribe_events(member_arg).await }
        });
        let results = join_all(streams).await;
        results
            .into_iter()
            .find(|r| !r.is_ok())
            .unwrap_or_else(ServiceCallResult::ok)
    }

    async fn get_container_log(&self, arg: GetLogsArg) -> ServiceCallResult {
        for (_, service) in self.members() {
            match service.get_container(&arg.id).await {
                Ok(Some(_)) => {
                    return service
                        .get_container_log(GetLogsArg {
                            id: arg.id.clone(),
                            stdout: arg.stdout,
                            stderr: arg.stderr,
                            follow: arg.follow,
                            timestamps: arg.timestamps,
                            since: arg.since,
                            tail: arg.tail,
                            sink: arg.sink,
                            cancel: arg.cancel,
                        })
                        .await
                }
                _ => continue,
            }
        }
        ServiceCallResult::with_message(ResultCode::NotFound, format!("no such container {}", arg.id))
    }

    async fn get_statistics(&self, arg: GetStatisticsArg) -> ServiceCallResult {
        for (_, service) in self.members() {
            match service.get_container(&arg.id).await {
                Ok(Some(_)) => {
                    return service
                        .get_statistics(GetStatisticsArg {
                            id: arg.id.clone(),
                            stream: arg.stream,
                            sink: arg.sink,
                            cancel: arg.cancel,
                        })
                        .await
                }
                _ => continue,
            }
        }
        ServiceCallResult::with_message(ResultCode::NotFound, format!("no such container {}", arg.id))
    }
}
