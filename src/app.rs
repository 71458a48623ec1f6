//! Application assembly.
//!
//! One root value owns every subsystem; nothing reaches for globals.
//! Construction order follows the dependency edges: KV and buses first,
//! then registries, then the job engine and the services registering
//! into it, and finally the background loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::batch::{self, DockerHealthCheck, TagReconcileConfig};
use crate::bus::EventBus;
use crate::config::AppConfig;
use crate::containers::{spawn_event_pump, spawn_reconciler, ContainerRegistry};
use crate::discovery::DiscoveryStorage;
use crate::jobs::{JobParameters, JobsManager, PARAM_CLUSTER};
use crate::kv::KvStore;
use crate::nodes::NodeRegistry;
use crate::registry::RegistryRepository;
use crate::source::{self, SourceService};

/// The assembled control plane.
pub struct App {
    pub config: AppConfig,
    pub kv: Arc<dyn KvStore>,
    pub nodes: Arc<NodeRegistry>,
    pub discovery: Arc<DiscoveryStorage>,
    pub containers: Arc<ContainerRegistry>,
    pub jobs: Arc<JobsManager>,
    pub source: Arc<SourceService>,
    pub registries: Arc<RegistryRepository>,
    shutdown: Vec<watch::Sender<bool>>,
}

impl App {
    /// Wire every subsystem and rebuild state from the KV store.
    pub async fn build(config: AppConfig, kv: Arc<dyn KvStore>) -> Arc<Self> {
        let prefix = config.kv_prefix.clone();

        let node_bus = Arc::new(EventBus::new());
        let docker_bus = Arc::new(EventBus::new());
        let container_bus = Arc::new(EventBus::new());
        let job_bus = Arc::new(EventBus::new());

        let nodes = NodeRegistry::new(kv.clone(), &prefix, node_bus);
        let discovery = DiscoveryStorage::new(kv.clone(), &prefix, docker_bus, nodes.clone());
        let containers = ContainerRegistry::new(kv.clone(), &prefix, container_bus);
        let jobs = JobsManager::new(job_bus, discovery.clone());
        let registries = RegistryRepository::new(config.registries.clone());
        let source = SourceService::new(
            discovery.clone(),
            nodes.clone(),
            containers.clone(),
            Arc::downgrade(&jobs),
        );

        batch::register_jobs(
            &jobs,
            registries.clone(),
            DockerHealthCheck::shared(),
            TagReconcileConfig {
                latest_aliases: config.update.latest_aliases.clone(),
                suffixes: config.update.suffixes.clone(),
                strategy: config.update.strategy.clone(),
            },
        );
        source::register_jobs(&jobs, source.clone());

        // KV is the source of truth across restarts; live endpoints
        // reconcile the rest.
        if let Err(e) = nodes.load().await {
            tracing::warn!("Node registry load failed: {}", e);
        }
        if let Err(e) = discovery.load().await {
            tracing::warn!("Discovery load failed: {}", e);
        }
        if let Err(e) = containers.load().await {
            tracing::warn!("Container registry load failed: {}", e);
        }

        let mut shutdown = Vec::new();
        shutdown.push(spawn_event_pump(discovery.clone(), containers.clone()));
        shutdown.push(spawn_reconciler(
            discovery.clone(),
            containers.clone(),
            Duration::from_secs(config.reconcile_interval_s),
        ));

        if let Some(cluster) = &config.update.reconcile_cluster {
            let params = JobParameters::builder(batch::UPDATE_TO_TAG_JOB)
                .parameter(PARAM_CLUSTER, cluster.clone())
                .build();
            shutdown.push(jobs.schedule_periodic(
                params,
                Duration::from_secs(config.update.reconcile_interval_s),
            ));
        }

        info!(
            "Control plane assembled: {} cluster(s), {} node(s), {} container(s)",
            discovery.list().len(),
            nodes.list().len(),
            containers.list().len()
        );

        Arc::new(Self {
            config,
            kv,
            nodes,
            discovery,
            containers,
            jobs,
            source,
            registries,
            shutdown,
        })
    }

    /// Stop the background loops.
    pub fn shutdown(&self) {
        for tx in &self.shutdown {
            let _ = tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    #[tokio::test]
    async fn test_build_registers_job_types() {
        let app = App::build(AppConfig::default(), Arc::new(MemoryKvStore::new())).await;
        let types = app.jobs.definitions();
        assert!(types.contains(&"job.updateContainers.stopThenStartEach".to_string()));
        assert!(types.contains(&"job.updateContainers.startThenStopEach".to_string()));
        assert!(types.contains(&"job.updateContainers.stopThenStartAll".to_string()));
        assert!(types.contains(&"job.updateToTag".to_string()));
        assert!(types.contains(&"job.deploySource".to_string()));
        app.shutdown();
    }
}
