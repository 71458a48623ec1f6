//! Rolling container updates.
//!
//! The update jobs walk a filtered set of containers and move each one to
//! a target image version through a shared per-container pipeline
//! (pull, pre-check, stop, create, start, post-check), composed into three
//! strategies that trade speed against capacity and service continuity.
//! `update_to_tag` is the periodic reconciler that discovers new tags in
//! registries and emits update jobs.

mod health;
mod strategies;
mod tasklets;
mod update_to_tag;

pub use health::{DockerHealthCheck, HealthCheckResult, HealthCheckService};
pub use strategies::UpdateStrategy;
pub use update_to_tag::TagReconcileConfig;

use std::collections::HashMap;
use std::sync::Arc;

use crate::docker::CreateContainerSpec;
use crate::image::ImageRef;
use crate::jobs::{
    JobDefinition, JobParamDef, JobsManager, ParamKind, PARAM_CLUSTER,
};
use crate::registry::RegistryRepository;

/// Job type prefix of the update strategies.
pub const UPDATE_JOB_PREFIX: &str = "job.updateContainers.";

/// Job type of the tag reconciler.
pub const UPDATE_TO_TAG_JOB: &str = "job.updateToTag";

// Parameter names shared by the update jobs.
pub const JP_IMAGE: &str = "image";
pub const JP_TARGET_VERSION: &str = "target_version";
pub const JP_HEALTH_CHECK_ENABLED: &str = "health_check_enabled";
pub const JP_ROLLBACK_ENABLED: &str = "rollback_enabled";
pub const JP_TIME_BEFORE_KILL: &str = "time_before_kill";
/// Accepted and surfaced but deliberately unused; upstream semantics for
/// it were never fixed.
pub const JP_PERCENTAGE: &str = "percentage";
pub const JP_FILTER: &str = "filter";

/// Where a container stands in the update pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Loaded,
    ImagePulled,
    Stopped,
    Created,
    Started,
    Verified,
}

/// A container snapshot enriched with its create spec and pipeline stage.
#[derive(Debug, Clone)]
pub struct ProcessedContainer {
    pub id: String,
    pub name: String,
    pub node: Option<String>,
    pub image: ImageRef,
    pub image_id: Option<String>,
    /// Create spec reconstructed from the running container; the update
    /// replays it with a new image reference.
    pub spec: CreateContainerSpec,
    pub stage: Stage,
}

impl ProcessedContainer {
    /// The spec of the replacement container at the target version.
    pub fn target_spec(&self, target_image: &ImageRef) -> CreateContainerSpec {
        let mut spec = self.spec.clone();
        spec.image = target_image.to_string();
        spec
    }
}

fn update_schema() -> HashMap<String, JobParamDef> {
    let mut schema = HashMap::new();
    schema.insert(
        PARAM_CLUSTER.to_string(),
        JobParamDef::required(ParamKind::Str),
    );
    schema.insert(JP_IMAGE.to_string(), JobParamDef::required(ParamKind::Str));
    schema.insert(
        JP_TARGET_VERSION.to_string(),
        JobParamDef::required(ParamKind::Str),
    );
    schema.insert(
        JP_HEALTH_CHECK_ENABLED.to_string(),
        JobParamDef::optional(ParamKind::Bool),
    );
    schema.insert(
        JP_ROLLBACK_ENABLED.to_string(),
        JobParamDef::optional(ParamKind::Bool),
    );
    schema.insert(
        JP_TIME_BEFORE_KILL.to_string(),
        JobParamDef::optional(ParamKind::Int),
    );
    schema.insert(
        JP_PERCENTAGE.to_string(),
        JobParamDef::optional(ParamKind::Int),
    );
    schema.insert("id".to_string(), JobParamDef::optional(ParamKind::Str));
    schema
}

/// Register every batch job type with the engine.
pub fn register_jobs(
    manager: &Arc<JobsManager>,
    registries: Arc<RegistryRepository>,
    health: Arc<dyn HealthCheckService>,
    reconcile: TagReconcileConfig,
) {
    for strategy in [
        UpdateStrategy::StopThenStartEach,
        UpdateStrategy::StartThenStopEach,
        UpdateStrategy::StopThenStartAll,
    ] {
        manager.register(JobDefinition {
            ty: format!("{UPDATE_JOB_PREFIX}{}", strategy.name()),
            parameters: update_schema(),
            repeatable: false,
            handler: Arc::new(strategies::UpdateContainersJob {
                strategy,
                health: health.clone(),
            }),
        });
    }

    let mut tag_schema = HashMap::new();
    tag_schema.insert(
        PARAM_CLUSTER.to_string(),
        JobParamDef::required(ParamKind::Str),
    );
    tag_schema.insert(JP_FILTER.to_string(), JobParamDef::optional(ParamKind::Str));
    manager.register(JobDefinition {
        ty: UPDATE_TO_TAG_JOB.to_string(),
        parameters: tag_schema,
        repeatable: true,
        handler: Arc::new(update_to_tag::UpdateToTagJob::new(
            registries,
            Arc::downgrade(manager),
            reconcile,
        )),
    });
}
