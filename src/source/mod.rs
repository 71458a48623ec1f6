//! Declarative cluster state ("root source").
//!
//! The root source is a document describing clusters, their nodes and the
//! full create-specs of their containers. Operators export it for backup
//! or review and import it to converge the fleet onto the described
//! state; the import runs as a job so it is observable and cancellable
//! like any other long operation.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::containers::{ContainerBase, ContainerRegistry};
use crate::discovery::{DiscoveryStorage, NodesGroup, NODE_CONSTRAINT_PREFIX};
use crate::docker::{
    ClusterConfig, ContainerDetails, CreateContainerSpec, DeleteContainerArg, HostConfig,
    StopContainerArg,
};
use crate::jobs::{
    JobContext, JobDefinition, JobError, JobHandler, JobInstance, JobParamDef, JobParameters,
    JobsManager, ParamKind,
};
use crate::nodes::NodeRegistry;

/// Job type applying an imported root source.
pub const DEPLOY_SOURCE_JOB: &str = "job.deploySource";

const JP_SOURCE: &str = "source";
const JP_UPDATE_EXISTING: &str = "update_existing";

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("No clusters in source")]
    Empty,

    #[error("Too many clusters in source, accept only one")]
    TooManyClusters,

    #[error("Undecodable source document: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Job(#[from] JobError),
}

/// Create-spec of one container, the way the source document carries it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSource {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    pub image: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_config: Option<HostConfig>,
}

impl ContainerSource {
    pub fn to_create_spec(&self) -> CreateContainerSpec {
        let mut spec = CreateContainerSpec {
            name: Some(self.name.clone()),
            image: self.image.clone(),
            env: self.environment.clone(),
            cmd: self.command.clone(),
            entrypoint: self.entrypoint.clone(),
            labels: self.labels.clone(),
            host_config: self.host_config.clone(),
        };
        if let Some(node) = &self.node {
            let entry = format!("{NODE_CONSTRAINT_PREFIX}{node}");
            if !spec.env.contains(&entry) {
                spec.env.push(entry);
            }
        }
        spec
    }
}

/// One cluster in the document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSource {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ClusterConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<ContainerSource>,
}

/// The whole control plane's desired state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default)]
    pub clusters: Vec<ClusterSource>,
}

/// Import options.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeployOptions {
    /// Replace containers whose spec in the document differs from what
    /// runs; without this only missing containers are created.
    #[serde(default)]
    pub update_existing: bool,
}

/// Turns live containers into source entries. Volatile attributes (id,
/// observed status, timestamps) never enter the document.
pub struct ContainerSourceFactory;

impl ContainerSourceFactory {
    pub fn source_from(base: &ContainerBase, details: Option<&ContainerDetails>) -> ContainerSource {
        let config = details.and_then(|d| d.config.clone()).unwrap_or_default();
        let environment = config
            .env
            .into_iter()
            // Placement is carried by the node field, not the raw hint.
            .filter(|e| !e.starts_with("constraint:"))
            .collect();
        ContainerSource {
            name: base.name.clone().unwrap_or_default(),
            node: base.node.clone(),
            image: base.image.clone(),
            labels: if config.labels.is_empty() {
                base.labels.clone()
            } else {
                config.labels
            },
            environment,
            command: config.cmd,
            entrypoint: config.entrypoint,
            host_config: details.and_then(|d| d.host_config.clone()),
        }
    }
}

/// Serialize and apply root sources.
pub struct SourceService {
    discovery: Arc<DiscoveryStorage>,
    nodes: Arc<NodeRegistry>,
    containers: Arc<ContainerRegistry>,
    manager: Weak<JobsManager>,
}

impl SourceService {
    pub fn new(
        discovery: Arc<DiscoveryStorage>,
        nodes: Arc<NodeRegistry>,
        containers: Arc<ContainerRegistry>,
        manager: Weak<JobsManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            discovery,
            nodes,
            containers,
            manager,
        })
    }

    /// Export the whole control plane.
    pub async fn get_root_source(&self) -> RootSource {
        let mut clusters = Vec::new();
        for group in self.discovery.list() {
            clusters.push(self.cluster_source(&group).await);
        }
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        RootSource {
            version: Some("1".to_string()),
            clusters,
        }
    }

    /// Export one cluster, when it exists.
    pub async fn get_cluster_source(&self, name: &str) -> Option<RootSource> {
        let group = self.discovery.get_cluster(name)?;
        Some(RootSource {
            version: Some("1".to_string()),
            clusters: vec![self.cluster_source(&group).await],
        })
    }

    async fn cluster_source(&self, group: &Arc<NodesGroup>) -> ClusterSource {
        let config = group.config();
        let members = self.discovery.member_nodes(group);
        let service = group.docker();

        let mut containers = Vec::new();
        for registration in self.containers.list() {
            let base = registration.container().await;
            let owned = base
                .node
                .as_ref()
                .map(|n| members.contains(n))
                .unwrap_or(false);
            if !owned {
                continue;
            }
            let details = service.get_container(&base.id).await.ok().flatten();
            containers.push(ContainerSourceFactory::source_from(&base, details.as_ref()));
        }
        containers.sort_by(|a, b| a.name.cmp(&b.name));

        ClusterSource {
            name: config.name.clone(),
            title: config.title.clone(),
            description: config.description.clone(),
            config: Some(config.config.clone()),
            nodes: members,
            containers,
        }
    }

    /// Validate a document and submit the deploy job applying it.
    pub fn set_root_source(
        &self,
        root: &RootSource,
        options: DeployOptions,
    ) -> Result<Arc<JobInstance>, SourceError> {
        if root.clusters.is_empty() {
            return Err(SourceError::Empty);
        }
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| JobError::Failed("job engine is shutting down".to_string()))?;
        let params = JobParameters::builder(DEPLOY_SOURCE_JOB)
            .parameter(JP_SOURCE, serde_json::to_string(root)?)
            .parameter(JP_UPDATE_EXISTING, options.update_existing)
            .build();
        Ok(manager.submit(params)?)
    }

    async fn apply(&self, ctx: &JobContext, root: &RootSource, options: DeployOptions) {
        for cluster in &root.clusters {
            ctx.fire(format!("Applying cluster \"{}\"", cluster.name));
            let group = match self
                .discovery
                .get_or_create_cluster(&cluster.name, cluster.config.clone())
                .await
            {
                Ok(group) => group,
                Err(e) => {
                    ctx.fire(format!("Can not create cluster \"{}\": {}", cluster.name, e));
                    continue;
                }
            };
            if cluster.title.is_some() || cluster.description.is_some() {
                group.update_config(|c| {
                    if cluster.title.is_some() {
                        c.title = cluster.title.clone();
                    }
                    if cluster.description.is_some() {
                        c.description = cluster.description.clone();
                    }
                });
                group.flush().await;
            }

            for node in &cluster.nodes {
                if self.nodes.get(node).map(|n| n.cluster.clone()).flatten()
                    == Some(cluster.name.clone())
                {
                    continue;
                }
                if let Err(e) = self
                    .discovery
                    .set_node_cluster(node, Some(&cluster.name))
                    .await
                {
                    ctx.fire(format!(
                        "Can not attach node \"{}\" to \"{}\": {}",
                        node, cluster.name, e
                    ));
                }
            }

            let service = group.docker();
            for source in &cluster.containers {
                if ctx.is_cancelled() {
                    return;
                }
                let qualified = match &source.node {
                    Some(node) => format!("{}/{}", node, source.name),
                    None => source.name.clone(),
                };
                let existing = self.containers.find(&qualified).await;
                if let Some(existing) = existing {
                    if !options.update_existing {
                        debug!("Container '{}' already present, keeping", qualified);
                        continue;
                    }
                    let old = existing.container().await;
                    ctx.fire(format!("Replacing \"{}\"", qualified));
                    let _ = service
                        .stop_container(&StopContainerArg::new(&old.id).with_timeout(10))
                        .await;
                    let _ = service
                        .delete_container(&DeleteContainerArg::new(&old.id))
                        .await;
                }
                let res = service.create_container(&source.to_create_spec()).await;
                match res.id {
                    Some(id) if res.is_ok() => {
                        let start = service.start_container(&id).await;
                        if start.is_ok() {
                            ctx.fire(format!("Created and started \"{}\"", qualified));
                        } else {
                            ctx.fire(format!(
                                "Created \"{}\" but start failed: {}",
                                qualified,
                                start.message.unwrap_or_default()
                            ));
                        }
                    }
                    _ => ctx.fire(format!(
                        "Can not create \"{}\": {}",
                        qualified,
                        res.message.unwrap_or_default()
                    )),
                }
            }
        }
    }
}

struct DeploySourceJob {
    service: Arc<SourceService>,
}

#[async_trait]
impl JobHandler for DeploySourceJob {
    async fn run(&self, ctx: Arc<JobContext>) -> Result<(), JobError> {
        let raw = ctx
            .parameters()
            .get_str(JP_SOURCE)?
            .ok_or_else(|| JobError::MissingParameter {
                ty: DEPLOY_SOURCE_JOB.to_string(),
                name: JP_SOURCE.to_string(),
            })?;
        let root: RootSource = serde_json::from_str(&raw)
            .map_err(|e| JobError::Failed(format!("undecodable source document: {e}")))?;
        let options = DeployOptions {
            update_existing: ctx
                .parameters()
                .get_bool(JP_UPDATE_EXISTING)?
                .unwrap_or(false),
        };
        self.service.apply(&ctx, &root, options).await;
        if ctx.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Register the deploy job with the engine.
pub fn register_jobs(manager: &Arc<JobsManager>, service: Arc<SourceService>) {
    let mut schema = HashMap::new();
    schema.insert(JP_SOURCE.to_string(), JobParamDef::required(ParamKind::Str));
    schema.insert(
        JP_UPDATE_EXISTING.to_string(),
        JobParamDef::optional(ParamKind::Bool),
    );
    manager.register(JobDefinition {
        ty: DEPLOY_SOURCE_JOB.to_string(),
        parameters: schema,
        repeatable: false,
        handler: Arc::new(DeploySourceJob { service }),
    });
}

/// Single-cluster rule of the per-cluster import endpoint: the path name
/// wins over whatever the document says.
pub fn bind_single_cluster(root: &mut RootSource, cluster: &str) -> Result<(), SourceError> {
    match root.clusters.len() {
        0 => Err(SourceError::Empty),
        1 => {
            root.clusters[0].name = cluster.to_string();
            Ok(())
        }
        _ => Err(SourceError::TooManyClusters),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_source_roundtrips_spec() {
        let source = ContainerSource {
            name: "web".to_string(),
            node: Some("n1".to_string()),
            image: "app:1".to_string(),
            environment: vec!["A=1".to_string()],
            ..Default::default()
        };
        let spec = source.to_create_spec();
        assert_eq!(spec.name.as_deref(), Some("web"));
        assert_eq!(spec.image, "app:1");
        assert!(spec.env.contains(&"constraint:node==n1".to_string()));
    }

    #[test]
    fn test_factory_drops_volatile_and_constraints() {
        let base = ContainerBase {
            id: "abc".to_string(),
            name: Some("web".to_string()),
            image: "app:1".to_string(),
            node: Some("n1".to_string()),
            status: Some("Up 2 minutes".to_string()),
            ..Default::default()
        };
        let details: ContainerDetails = serde_json::from_str(
            r#"{"Id":"abc","Config":{"Env":["A=1","constraint:node==n1"],"Image":"app:1"}}"#,
        )
        .unwrap();
        let source = ContainerSourceFactory::source_from(&base, Some(&details));

        assert_eq!(source.environment, vec!["A=1"]);
        assert_eq!(source.node.as_deref(), Some("n1"));
        // Nothing volatile makes it into the document.
        let json = serde_json::to_string(&source).unwrap();
        assert!(!json.contains("abc"));
        assert!(!json.contains("Up 2 minutes"));
    }

    #[test]
    fn test_bind_single_cluster() {
        let mut root = RootSource {
            version: None,
            clusters: vec![ClusterSource {
                name: "from-doc".to_string(),
                ..Default::default()
            }],
        };
        bind_single_cluster(&mut root, "from-path").unwrap();
        assert_eq!(root.clusters[0].name, "from-path");

        let mut empty = RootSource::default();
        assert!(matches!(
            bind_single_cluster(&mut empty, "x"),
            Err(SourceError::Empty)
        ));

        let mut many = RootSource {
            version: None,
            clusters: vec![ClusterSource::default(), ClusterSource::default()],
        };
        assert!(matches!(
            bind_single_cluster(&mut many, "x"),
            Err(SourceError::TooManyClusters)
        ));
    }

    #[test]
    fn test_root_source_document_shape() {
        let root = RootSource {
            version: Some("1".to_string()),
            clusters: vec![ClusterSource {
                name: "prod".to_string(),
                nodes: vec!["n1".to_string()],
                containers: vec![ContainerSource {
                    name: "web".to_string(),
                    image: "app:1".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
        };
        let json = serde_json::to_string(&root).unwrap();
        let back: RootSource = serde_json::from_str(&json).unwrap();
        assert_eq!(back.clusters.len(), 1);
        assert_eq!(back.clusters[0].containers[0].image, "app:1");
    }
}
