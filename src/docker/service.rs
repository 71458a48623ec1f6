//! The daemon service seam.
//!
//! Everything that talks to a daemon goes through the [`DockerService`]
//! trait: the HTTP endpoint client implements it, the discovery layer
//! synthesizes fan-out implementations for plain node groups, and tests
//! substitute an in-memory daemon.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::args::{
    DeleteContainerArg, GetContainersArg, GetEventsArg, GetImagesArg, GetLogsArg,
    GetStatisticsArg, KillContainerArg, RemoveImageArg, StopContainerArg, TagImageArg,
};
use super::model::{
    Container, ContainerDetails, CreateContainerSpec, ImageDescriptor, ImageItem, Network,
    UpdateContainerSpec,
};
use super::result::{ResultCode, ServiceCallResult};
use super::stream::ProcessEvent;
use tokio::sync::mpsc;

/// Errors from the endpoint client.
#[derive(Error, Debug)]
pub enum DockerError {
    /// The endpoint is in its offline cooldown; no network call was made.
    #[error("OFFLINE {id}: {message}")]
    Offline { id: String, message: String },

    #[error("Timeout talking to {id} after {millis} ms")]
    Timeout { id: String, millis: u64 },

    #[error("Transport failure on {id}: {message}")]
    Transport { id: String, message: String },

    /// The daemon answered with a non-success status.
    #[error("{message}")]
    Api { code: ResultCode, message: String },

    #[error("Undecodable daemon response: {0}")]
    Decode(String),

    #[error("Invalid endpoint configuration: {0}")]
    InvalidConfig(String),
}

impl DockerError {
    /// Whether the failure was a connectivity problem (and so toggles the
    /// offline slot) rather than a protocol-level answer.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            DockerError::Timeout { .. } | DockerError::Transport { .. }
        )
    }
}

/// Per-cluster endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Daemon addresses (`host:port`). Only the first is used.
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Registries containers of this cluster may pull from.
    #[serde(default)]
    pub registries: Vec<String>,

    /// Upper bound for slow (mutating) daemon calls, seconds.
    #[serde(default = "default_docker_timeout")]
    pub docker_timeout_s: u64,

    /// Info cache time-to-live, seconds.
    #[serde(default = "default_cache_after_write")]
    pub cache_after_write_s: u64,
}

fn default_docker_timeout() -> u64 {
    300
}

fn default_cache_after_write() -> u64 {
    60
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            registries: Vec::new(),
            docker_timeout_s: default_docker_timeout(),
            cache_after_write_s: default_cache_after_write(),
        }
    }
}

/// A node row inside [`ServiceInfo`], merged from the daemon report and
/// the agent-side registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceNodeInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    /// Cumulative system CPU jiffies reported by the agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sys_cpu_jiffies: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_used: Option<u64>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl ServiceNodeInfo {
    /// Overlay agent-side values onto this daemon-side row; non-null agent
    /// fields win.
    pub fn merge_from(&mut self, agent: &ServiceNodeInfo) {
        if agent.address.is_some() {
            self.address = agent.address.clone();
        }
        if agent.healthy.is_some() {
            self.healthy = agent.healthy;
        }
        if agent.sys_cpu_jiffies.is_some() {
            self.sys_cpu_jiffies = agent.sys_cpu_jiffies;
        }
        if agent.memory_total.is_some() {
            self.memory_total = agent.memory_total;
        }
        if agent.memory_used.is_some() {
            self.memory_used = agent.memory_used;
        }
    }
}

/// Digested `/info` answer, stable across daemon versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub containers: u32,
    pub off_containers: u32,
    pub images: u32,
    pub node_count: u32,
    pub off_node_count: u32,
    pub mem_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(default)]
    pub nodes: Vec<ServiceNodeInfo>,
}

/// Source of agent-side node knowledge, implemented by the node registry.
/// The client only keeps names; health is resolved at merge time.
pub trait NodeInfoProvider: Send + Sync {
    fn node_info(&self, name: &str) -> Option<ServiceNodeInfo>;
}

/// What happened to a daemon endpoint. Published on the
/// `docker-service.<id>` topic.
#[derive(Debug, Clone)]
pub struct DockerServiceEvent {
    pub service_id: String,
    pub kind: DockerServiceEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DockerServiceEventKind {
    Online,
    Offline,
    InfoChanged(ServiceInfo),
    ClusterCreated,
    ClusterDeleted,
}

/// Topic name for a service's events.
pub fn service_topic(service_id: &str) -> String {
    format!("docker-service.{service_id}")
}

/// Result of `create_container`, a [`ServiceCallResult`] plus the created
/// id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContainerResult {
    pub code: ResultCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl CreateContainerResult {
    pub fn is_ok(&self) -> bool {
        self.code == ResultCode::Ok
    }

    pub fn failure(result: ServiceCallResult) -> Self {
        Self {
            code: result.code,
            message: result.message,
            id: None,
        }
    }
}

/// Uniform operation set over one daemon endpoint: a single node or a
/// cluster-level orchestrator, never both.
#[async_trait]
pub trait DockerService: Send + Sync {
    /// Stable identity, `cluster:<name>` or `node:<name>`.
    fn id(&self) -> &str;

    fn cluster(&self) -> Option<&str>;

    fn node(&self) -> Option<&str>;

    /// False while the offline cooldown is active.
    fn is_online(&self) -> bool;

    fn config(&self) -> &ClusterConfig;

    async fn get_containers(&self, arg: &GetContainersArg) -> Result<Vec<Container>, DockerError>;

    /// None when the daemon says 404, or answers 200 with a body that no
    /// longer parses, which happens while a removal is racing us.
    async fn get_container(&self, id: &str) -> Result<Option<ContainerDetails>, DockerError>;

    async fn create_container(&self, spec: &CreateContainerSpec) -> CreateContainerResult;

    async fn start_container(&self, id: &str) -> ServiceCallResult;

    async fn stop_container(&self, arg: &StopContainerArg) -> ServiceCallResult;

    async fn restart_container(&self, arg: &StopContainerArg) -> ServiceCallResult;

    async fn kill_container(&self, arg: &KillContainerArg) -> ServiceCallResult;

    async fn rename_container(&self, id: &str, new_name: &str) -> ServiceCallResult;

    async fn update_container(&self, id: &str, spec: &UpdateContainerSpec) -> ServiceCallResult;

    async fn delete_container(&self, arg: &DeleteContainerArg) -> ServiceCallResult;

    async fn get_images(&self, arg: &GetImagesArg) -> Result<Vec<ImageItem>, DockerError>;

    /// Pull an image, streaming daemon progress into `watcher`, then fetch
    /// its descriptor.
    async fn pull_image(
        &self,
        name: &str,
        watcher: mpsc::Sender<ProcessEvent>,
    ) -> Result<Option<ImageDescriptor>, DockerError>;

    /// None on 404.
    async fn get_image(&self, name: &str) -> Result<Option<ImageDescriptor>, DockerError>;

    async fn tag_image(&self, arg: &TagImageArg) -> ServiceCallResult;

    async fn remove_image(&self, arg: &RemoveImageArg) -> ServiceCallResult;

    async fn get_networks(&self) -> Result<Vec<Network>, DockerError>;

    async fn create_network(&self, network: &Network) -> ServiceCallResult;

    async fn get_info(&self) -> Result<ServiceInfo, DockerError>;

    /// Follow the daemon event stream until it closes or the token fires.
    async fn subscribe_events(&self, arg: GetEventsArg) -> ServiceCallResult;

    async fn get_container_log(&self, arg: GetLogsArg) -> ServiceCallResult;

    async fn get_statistics(&self, arg: GetStatisticsArg) -> ServiceCallResult;
}
