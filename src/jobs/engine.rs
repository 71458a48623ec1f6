//! Job type registry, instance store and scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::docker::DockerService;

use super::context::JobContext;
use super::instance::{JobEvent, JobInstance, JobStatus};
use super::params::{JobParamDef, JobParameters};
use super::{JobError, PARAM_CLUSTER};

/// The work behind a job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: Arc<JobContext>) -> Result<(), JobError>;
}

/// Resolves a cluster name to its endpoint client when a job starts.
/// Implemented by discovery; tests substitute their own daemons.
pub trait ServiceResolver: Send + Sync {
    fn resolve(&self, cluster: &str) -> Option<Arc<dyn DockerService>>;
}

/// A registered job type: schema, gating and handler. Selection is a
/// table lookup by type name.
pub struct JobDefinition {
    pub ty: String,
    pub parameters: HashMap<String, JobParamDef>,
    /// Non-repeatable types reject a new instance while another instance
    /// of the same type and cluster is non-terminal.
    pub repeatable: bool,
    pub handler: Arc<dyn JobHandler>,
}

/// Process-wide job engine.
pub struct JobsManager {
    definitions: DashMap<String, Arc<JobDefinition>>,
    instances: DashMap<String, Arc<JobInstance>>,
    bus: Arc<EventBus<JobEvent>>,
    resolver: Arc<dyn ServiceResolver>,
}

impl JobsManager {
    pub fn new(bus: Arc<EventBus<JobEvent>>, resolver: Arc<dyn ServiceResolver>) -> Arc<Self> {
        Arc::new(Self {
            definitions: DashMap::new(),
            instances: DashMap::new(),
            bus,
            resolver,
        })
    }

    pub fn register(&self, definition: JobDefinition) {
        debug!("Registered job type '{}'", definition.ty);
        self.definitions
            .insert(definition.ty.clone(), Arc::new(definition));
    }

    pub fn definitions(&self) -> Vec<String> {
        self.definitions.iter().map(|d| d.key().clone()).collect()
    }

    pub fn list(&self) -> Vec<Arc<JobInstance>> {
        self.instances.iter().map(|r| r.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<JobInstance>> {
        self.instances.get(id).map(|r| r.clone())
    }

    /// Create an instance in CREATED. Non-repeatable gating happens here;
    /// parameter validation is deferred to start, where it fails the
    /// instance rather than the call.
    pub fn create(&self, parameters: JobParameters) -> Result<Arc<JobInstance>, JobError> {
        let definition = self
            .definitions
            .get(&parameters.ty)
            .map(|d| d.clone())
            .ok_or_else(|| JobError::UnknownType(parameters.ty.clone()))?;

        if !definition.repeatable {
            let scope = parameters
                .get_str(PARAM_CLUSTER)
                .unwrap_or(None)
                .unwrap_or_default();
            let clash = self.instances.iter().any(|entry| {
                let other = entry.value();
                other.ty() == parameters.ty
                    && !other.status().is_terminal()
                    && other
                        .parameters()
                        .get_str(PARAM_CLUSTER)
                        .unwrap_or(None)
                        .unwrap_or_default()
                        == scope
            });
            if clash {
                return Err(JobError::AlreadyRunning {
                    ty: parameters.ty.clone(),
                    scope,
                });
            }
        }

        let id = parameters
            .get_str("id")
            .unwrap_or(None)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let instance = JobInstance::new(id.clone(), parameters, self.bus.clone());
        self.instances.insert(id, instance.clone());
        Ok(instance)
    }

    /// Start an instance: spawn its task, resolve the scope, run the
    /// handler and settle the terminal status.
    pub fn start(&self, instance: &Arc<JobInstance>) {
        let Some(definition) = self.definitions.get(instance.ty()).map(|d| d.clone()) else {
            instance.transition(
                JobStatus::Failed,
                Some(format!("unknown job type '{}'", instance.ty())),
            );
            return;
        };
        if !instance.transition(JobStatus::Started, None) {
            return;
        }

        let instance = instance.clone();
        let resolver = self.resolver.clone();
        tokio::spawn(async move {
            // Unbound required parameters and conversion failures are
            // fatal before the handler ever runs.
            if let Err(e) = instance.parameters().validate(&definition.parameters) {
                instance.transition(JobStatus::Failed, Some(e.to_string()));
                return;
            }

            let cluster = instance
                .parameters()
                .get_str(PARAM_CLUSTER)
                .unwrap_or(None);
            let docker = match &cluster {
                Some(name) => match resolver.resolve(name) {
                    Some(service) => Some(service),
                    None => {
                        instance.transition(
                            JobStatus::Failed,
                            Some(format!("can not resolve service for cluster: {name}")),
                        );
                        return;
                    }
                },
                None => None,
            };

            instance.transition(JobStatus::Running, None);
            let ctx = JobContext::new(instance.clone(), docker);
            let result = definition.handler.run(ctx).await;

            match result {
                Ok(()) if instance.cancel_token().is_cancelled() => {
                    instance.transition(JobStatus::Cancelled, None);
                }
                Ok(()) => {
                    instance.transition(JobStatus::Completed, None);
                }
                Err(JobError::Cancelled) => {
                    instance.transition(JobStatus::Cancelled, None);
                }
                Err(e) => {
                    instance.fire(format!("job failed: {e}"));
                    instance.transition(JobStatus::Failed, Some(e.to_string()));
                }
            }
        });
    }

    /// Create and start in one step.
    pub fn submit(&self, parameters: JobParameters) -> Result<Arc<JobInstance>, JobError> {
        let instance = self.create(parameters)?;
        self.start(&instance);
        Ok(instance)
    }

    pub fn cancel(&self, id: &str) -> Result<Arc<JobInstance>, JobError> {
        let instance = self
            .get(id)
            .ok_or_else(|| JobError::InstanceNotFound(id.to_string()))?;
        instance.cancel();
        Ok(instance)
    }

    /// Drive a job type on a fixed interval. Overlapping runs of the same
    /// periodic job are suppressed. The returned sender stops the ticker.
    pub fn schedule_periodic(
        self: &Arc<Self>,
        parameters: JobParameters,
        every: Duration,
    ) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = self.clone();
        let ty = parameters.ty.clone();

        tokio::spawn(async move {
            let mut ticker = interval(every);
            info!("Scheduled periodic job '{}' every {:?}", ty, every);
            let mut last: Option<Arc<JobInstance>> = None;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(prior) = &last {
                            if !prior.status().is_terminal() {
                                debug!("Skipping tick of '{}': prior run still active", ty);
                                continue;
                            }
                        }
                        let mut params = parameters.clone();
                        // Each run is a fresh instance.
                        params.parameters.remove("id");
                        match manager.submit(params) {
                            Ok(instance) => last = Some(instance),
                            Err(e) => warn!("Can not start periodic job '{}': {}", ty, e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Stopping periodic job '{}'", ty);
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }
}
