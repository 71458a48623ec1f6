//! Wire model of the Docker remote API (v1.24 era).
//!
//! Field names follow the daemon's JSON casing via serde renames. Only the
//! fields the control plane consumes are modeled; unknown fields are
//! ignored on deserialization.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of `GET /containers/json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    #[serde(rename = "Id")]
    pub id: String,

    /// All names the daemon knows, each starting with '/'. Swarm endpoints
    /// prefix the owning node: `/node-1/app`.
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,

    #[serde(rename = "Image")]
    pub image: String,

    #[serde(rename = "ImageID", default)]
    pub image_id: Option<String>,

    #[serde(rename = "Command", default)]
    pub command: Option<String>,

    /// Creation time, unix seconds.
    #[serde(rename = "Created", default)]
    pub created: i64,

    #[serde(rename = "Ports", default)]
    pub ports: Vec<Port>,

    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,

    #[serde(rename = "Status", default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    #[serde(rename = "IP", default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    #[serde(rename = "PrivatePort")]
    pub private_port: u16,

    #[serde(rename = "PublicPort", default, skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,

    #[serde(rename = "Type", default)]
    pub kind: String,
}

/// `GET /containers/{id}/json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerDetails {
    #[serde(rename = "Id")]
    pub id: String,

    #[serde(rename = "Name", default)]
    pub name: Option<String>,

    #[serde(rename = "Created", default)]
    pub created: Option<DateTime<Utc>>,

    #[serde(rename = "Image", default)]
    pub image_id: Option<String>,

    #[serde(rename = "Config", default)]
    pub config: Option<ContainerConfig>,

    #[serde(rename = "HostConfig", default)]
    pub host_config: Option<HostConfig>,

    #[serde(rename = "State", default)]
    pub state: Option<ContainerState>,

    #[serde(rename = "Node", default)]
    pub node: Option<SwarmNode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerState {
    #[serde(rename = "Running", default)]
    pub running: bool,

    #[serde(rename = "Paused", default)]
    pub paused: bool,

    #[serde(rename = "Restarting", default)]
    pub restarting: bool,

    #[serde(rename = "ExitCode", default)]
    pub exit_code: i32,

    #[serde(rename = "Status", default)]
    pub status: Option<String>,
}

/// Node block a swarm endpoint attaches to inspections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmNode {
    #[serde(rename = "Name", default)]
    pub name: Option<String>,

    #[serde(rename = "Addr", default)]
    pub addr: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Image", default)]
    pub image: Option<String>,

    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(rename = "Labels", default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    #[serde(
        rename = "ExposedPorts",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub exposed_ports: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(rename = "Binds", default, skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<String>,

    #[serde(rename = "Memory", default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,

    #[serde(rename = "CpuShares", default, skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<i64>,

    #[serde(rename = "CpuQuota", default, skip_serializing_if = "Option::is_none")]
    pub cpu_quota: Option<i64>,

    #[serde(rename = "CpuPeriod", default, skip_serializing_if = "Option::is_none")]
    pub cpu_period: Option<i64>,

    #[serde(rename = "BlkioWeight", default, skip_serializing_if = "Option::is_none")]
    pub blkio_weight: Option<u16>,

    #[serde(rename = "CpusetCpus", default, skip_serializing_if = "Option::is_none")]
    pub cpuset_cpus: Option<String>,

    #[serde(rename = "CpusetMems", default, skip_serializing_if = "Option::is_none")]
    pub cpuset_mems: Option<String>,

    #[serde(rename = "NetworkMode", default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,

    #[serde(
        rename = "PortBindings",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub port_bindings: HashMap<String, Vec<PortBinding>>,

    #[serde(
        rename = "RestartPolicy",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub restart_policy: Option<RestartPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortBinding {
    #[serde(rename = "HostIp", default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,

    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicy {
    #[serde(rename = "Name", default)]
    pub name: String,

    #[serde(rename = "MaximumRetryCount", default)]
    pub maximum_retry_count: u32,
}

/// Body of `POST /containers/create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateContainerSpec {
    /// Requested name; goes into the `name` query parameter, not the body.
    #[serde(skip)]
    pub name: Option<String>,

    #[serde(rename = "Image")]
    pub image: String,

    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(rename = "Labels", default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    #[serde(rename = "HostConfig", default, skip_serializing_if = "Option::is_none")]
    pub host_config: Option<HostConfig>,
}

/// Response of `POST /containers/create`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateContainerResponse {
    #[serde(rename = "Id", default)]
    pub id: Option<String>,

    #[serde(rename = "Warnings", default)]
    pub warnings: Option<Vec<String>>,
}

/// Body of `POST /containers/{id}/update`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateContainerSpec {
    #[serde(rename = "Memory", skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,

    #[serde(rename = "CpuShares", skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<i64>,

    #[serde(rename = "CpuQuota", skip_serializing_if = "Option::is_none")]
    pub cpu_quota: Option<i64>,

    #[serde(rename = "BlkioWeight", skip_serializing_if = "Option::is_none")]
    pub blkio_weight: Option<u16>,

    #[serde(rename = "RestartPolicy", skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateContainerResponse {
    #[serde(rename = "Warnings", default)]
    pub warnings: Option<Vec<String>>,
}

/// One row of `GET /images/json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageItem {
    #[serde(rename = "Id")]
    pub id: String,

    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Vec<String>,

    #[serde(rename = "Created", default)]
    pub created: i64,

    #[serde(rename = "Size", default)]
    pub size: i64,

    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
}

/// `GET /images/{name}/json`.
#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    #[serde(rename = "Id")]
    pub id: String,

    #[serde(rename = "Created", default)]
    pub created: Option<DateTime<Utc>>,

    #[serde(rename = "ContainerConfig", default)]
    pub container_config: Option<ContainerConfig>,
}

/// Stable descriptor of an image, independent of the daemon DTO, which the
/// daemon authors reshape between releases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl From<Image> for ImageDescriptor {
    fn from(image: Image) -> Self {
        let labels = image
            .container_config
            .as_ref()
            .map(|c| c.labels.clone())
            .unwrap_or_default();
        Self {
            id: image.id,
            created: image.created,
            labels,
        }
    }
}

/// `GET /networks` row and `POST /networks/create` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    #[serde(rename = "Id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Driver", default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,

    #[serde(rename = "Scope", default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// `GET /info`, reduced to the fields the control plane reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Info {
    #[serde(rename = "Name", default)]
    pub name: Option<String>,

    #[serde(rename = "Containers", default)]
    pub containers: u32,

    #[serde(rename = "Images", default)]
    pub images: u32,

    #[serde(rename = "NCPU", default)]
    pub ncpu: u32,

    #[serde(rename = "MemTotal", default)]
    pub mem_total: u64,

    /// Swarm managers flatten node details into SystemStatus rows.
    #[serde(rename = "SystemStatus", default)]
    pub system_status: Option<Vec<Vec<String>>>,

    #[serde(rename = "ServerVersion", default)]
    pub server_version: Option<String>,
}

/// One event from `GET /events` (newline-delimited JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerEvent {
    /// Event kind: container, image, network...
    #[serde(rename = "Type", default)]
    pub kind: Option<String>,

    #[serde(rename = "Action", default)]
    pub action: Option<String>,

    /// Subject id; old daemons use `id`, newer `Actor.ID`.
    #[serde(rename = "id", default)]
    pub id: Option<String>,

    #[serde(rename = "from", default)]
    pub from: Option<String>,

    #[serde(rename = "Actor", default)]
    pub actor: Option<EventActor>,

    #[serde(rename = "time", default)]
    pub time: Option<i64>,

    /// Event source endpoint, attached by the pump, never by the daemon.
    #[serde(skip)]
    pub service_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventActor {
    #[serde(rename = "ID", default)]
    pub id: Option<String>,

    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

impl DockerEvent {
    /// Subject container id regardless of daemon vintage.
    pub fn subject_id(&self) -> Option<&str> {
        self.id
            .as_deref()
            .or_else(|| self.actor.as_ref().and_then(|a| a.id.as_deref()))
    }

    /// Container name from actor attributes, when present.
    pub fn subject_name(&self) -> Option<&str> {
        self.actor
            .as_ref()
            .and_then(|a| a.attributes.get("name"))
            .map(String::as_str)
    }
}

/// One snapshot from `GET /containers/{id}/stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    #[serde(default)]
    pub read: Option<DateTime<Utc>>,

    #[serde(rename = "cpu_stats", default)]
    pub cpu_stats: Option<CpuStats>,

    #[serde(rename = "precpu_stats", default)]
    pub precpu_stats: Option<CpuStats>,

    #[serde(rename = "memory_stats", default)]
    pub memory_stats: Option<MemoryStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuStats {
    #[serde(rename = "cpu_usage", default)]
    pub cpu_usage: CpuUsage,

    #[serde(rename = "system_cpu_usage", default)]
    pub system_cpu_usage: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuUsage {
    #[serde(rename = "total_usage", default)]
    pub total_usage: u64,

    #[serde(rename = "percpu_usage", default)]
    pub percpu_usage: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    #[serde(default)]
    pub usage: Option<u64>,

    #[serde(default)]
    pub limit: Option<u64>,
}

/// CPU share of the host between two stats snapshots, as a percentage.
pub fn cpu_percent(stats: &Statistics) -> Option<f64> {
    let cpu = stats.cpu_stats.as_ref()?;
    let pre = stats.precpu_stats.as_ref()?;
    let cpu_delta = cpu.cpu_usage.total_usage as f64 - pre.cpu_usage.total_usage as f64;
    let system_delta =
        cpu.system_cpu_usage? as f64 - pre.system_cpu_usage.unwrap_or_default() as f64;
    if system_delta > 0.0 && cpu_delta > 0.0 {
        let cores = cpu
            .cpu_usage
            .percpu_usage
            .as_ref()
            .map(|v| v.len())
            .unwrap_or(1) as f64;
        Some((cpu_delta / system_delta) * cores * 100.0)
    } else {
        Some(0.0)
    }
}
