//! The per-container steps of an update.
//!
//! Each tasklet owns its own cancellation check and error reporting and
//! returns a typed outcome: `Skip` aborts this container but lets the job
//! continue, `Fail` aborts the job (after rollback, where enabled).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::containers::ContainerNamesService;
use crate::discovery::NODE_CONSTRAINT_PREFIX;
use crate::docker::{
    ContainerDetails, CreateContainerSpec, DeleteContainerArg, DockerService, GetContainersArg,
    StopContainerArg,
};
use crate::image::{ImagePattern, ImageRef};
use crate::jobs::{JobContext, JobError};

use super::health::{wait_healthy, HealthCheckService};
use super::{ProcessedContainer, Stage};
use super::{
    JP_HEALTH_CHECK_ENABLED, JP_IMAGE, JP_PERCENTAGE, JP_ROLLBACK_ENABLED, JP_TARGET_VERSION,
    JP_TIME_BEFORE_KILL,
};

/// How long the post-start health gate polls before rolling back.
const POST_CHECK_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of a tasklet that aborts its container.
pub enum TaskletError {
    /// This container is skipped; the batch continues.
    Skip(String),
    /// The batch must stop (rollback already happened when enabled).
    Fail(String),
}

impl TaskletError {
    pub fn into_job_error(self, container: &str) -> JobError {
        match self {
            TaskletError::Skip(m) | TaskletError::Fail(m) => {
                JobError::Failed(format!("container '{container}': {m}"))
            }
        }
    }
}

/// Parameters and collaborators shared by every tasklet of one update run.
pub struct UpdateBatch {
    pub docker: Arc<dyn DockerService>,
    pub pattern: ImagePattern,
    pub target_version: String,
    pub health_check_enabled: bool,
    pub rollback_enabled: bool,
    pub time_before_kill: u32,
    pub health: Arc<dyn HealthCheckService>,
}

impl UpdateBatch {
    /// Resolve parameters and the scoped endpoint from a job context.
    pub fn from_context(
        ctx: &JobContext,
        health: Arc<dyn HealthCheckService>,
    ) -> Result<Self, JobError> {
        let docker = ctx
            .docker()
            .ok_or_else(|| JobError::Failed("job has no cluster scope".to_string()))?;
        let params = ctx.parameters();
        let pattern = ImagePattern::new(
            &params
                .get_str(JP_IMAGE)?
                .unwrap_or_else(|| "*".to_string()),
        );
        let target_version = params.get_str(JP_TARGET_VERSION)?.ok_or_else(|| {
            JobError::MissingParameter {
                ty: params.ty.clone(),
                name: JP_TARGET_VERSION.to_string(),
            }
        })?;
        // Reserved parameter: read for validation, intentionally unused.
        let _percentage = params.get_i64(JP_PERCENTAGE)?;
        Ok(Self {
            docker,
            pattern,
            target_version,
            health_check_enabled: params.get_bool(JP_HEALTH_CHECK_ENABLED)?.unwrap_or(false),
            rollback_enabled: params.get_bool(JP_ROLLBACK_ENABLED)?.unwrap_or(false),
            time_before_kill: params.get_i64(JP_TIME_BEFORE_KILL)?.unwrap_or(10) as u32,
            health,
        })
    }

    /// Load the working set: list everything on the cluster, keep what the
    /// filter accepts, and rebuild each survivor's create spec from its
    /// inspection.
    pub async fn load(&self, ctx: &JobContext) -> Result<Vec<ProcessedContainer>, JobError> {
        let listing = self
            .docker
            .get_containers(&GetContainersArg::new(true))
            .await
            .map_err(|e| JobError::Failed(format!("can not list containers: {e}")))?;

        let mut out = Vec::new();
        for row in listing {
            let image = ImageRef::parse(&row.image);
            if !self.accepts(&image, row.image_id.as_deref()) {
                continue;
            }
            let details = match self.docker.get_container(&row.id).await {
                Ok(Some(details)) => details,
                Ok(None) => {
                    ctx.fire(format!("Container {} vanished before update, skip.", row.id));
                    continue;
                }
                Err(e) => {
                    ctx.fire(format!("Can not inspect {}: {}, skip.", row.id, e));
                    continue;
                }
            };
            let base = crate::containers::ContainerBase::from_listing(&row, self.docker.node());
            let name = match base.name.clone() {
                Some(name) => name,
                None => {
                    ctx.fire(format!("Container {} has no name, skip.", row.id));
                    continue;
                }
            };
            let mut spec = spec_from_details(&details, &name, &row.image);
            if let Some(node) = &base.node {
                pin_to_node(&mut spec, node);
            }
            out.push(ProcessedContainer {
                id: row.id.clone(),
                name,
                node: base.node,
                image,
                image_id: row.image_id.clone(),
                spec,
                stage: Stage::Loaded,
            });
        }
        ctx.fire(format!("Loaded {} container(s) for update", out.len()));
        Ok(out)
    }

    /// The update filter: operator pattern plus "actually outdated".
    /// Digest-pinned references carry no tag to move and are excluded.
    pub fn accepts(&self, image: &ImageRef, image_id: Option<&str>) -> bool {
        if image.is_digest() {
            return false;
        }
        if !self.pattern.matches(&image.to_string()) && !self.pattern.matches(&image.repository())
        {
            return false;
        }
        match &image.tag {
            Some(tag) => tag != &self.target_version,
            // An untagged (implicit latest) reference may still point at a
            // stale id; without the target id on hand it stays included.
            None => image_id.is_some(),
        }
    }

    /// Pull the target image on the owning node.
    pub async fn load_image(
        &self,
        ctx: &JobContext,
        pc: &ProcessedContainer,
        target: &ImageRef,
    ) -> Result<(), TaskletError> {
        self.ensure_not_cancelled(ctx)?;
        ctx.fire(format!("Pulling {} for '{}'", target, pc.name));
        let (tx, mut rx) = mpsc::channel(16);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let res = self.docker.pull_image(&target.to_string(), tx).await;
        let _ = drain.await;
        match res {
            Ok(_) => Ok(()),
            Err(e) => Err(TaskletError::Skip(format!("image pull failed: {e}"))),
        }
    }

    /// Verify the current container before touching it.
    pub async fn pre_check(
        &self,
        ctx: &JobContext,
        pc: &ProcessedContainer,
    ) -> Result<(), TaskletError> {
        if !self.health_check_enabled {
            return Ok(());
        }
        self.ensure_not_cancelled(ctx)?;
        let probe = self
            .health
            .check_container(self.docker.as_ref(), &pc.id)
            .await;
        if probe.healthy {
            Ok(())
        } else {
            Err(TaskletError::Skip(format!(
                "pre-check unhealthy: {}",
                probe.message.unwrap_or_default()
            )))
        }
    }

    /// Stop and remove the old container so its name frees up.
    pub async fn stop_old(
        &self,
        ctx: &JobContext,
        pc: &ProcessedContainer,
    ) -> Result<(), TaskletError> {
        self.ensure_not_cancelled(ctx)?;
        ctx.fire(format!("Stopping '{}' ({})", pc.name, pc.id));
        let res = self
            .docker
            .stop_container(&StopContainerArg::new(&pc.id).with_timeout(self.time_before_kill))
            .await;
        if !res.is_ok() {
            return Err(TaskletError::Fail(format!(
                "stop failed: {}",
                res.message.unwrap_or_default()
            )));
        }
        let res = self
            .docker
            .delete_container(&DeleteContainerArg::new(&pc.id))
            .await;
        if !res.is_ok() {
            return Err(TaskletError::Fail(format!(
                "remove failed: {}",
                res.message.unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Create the replacement container. `name` may differ from the old
    /// one while both exist side by side.
    pub async fn create_new(
        &self,
        ctx: &JobContext,
        pc: &ProcessedContainer,
        target: &ImageRef,
        name: &str,
    ) -> Result<String, TaskletError> {
        self.ensure_not_cancelled(ctx)?;
        let mut spec = pc.target_spec(target);
        spec.name = Some(name.to_string());
        ctx.fire(format!("Creating '{}' from {}", name, target));
        let res = self.docker.create_container(&spec).await;
        if !res.is_ok() {
            return Err(TaskletError::Fail(format!(
                "create failed: {}",
                res.message.unwrap_or_default()
            )));
        }
        res.id
            .ok_or_else(|| TaskletError::Fail("daemon returned no container id".to_string()))
    }

    pub async fn start(&self, ctx: &JobContext, id: &str) -> Result<(), TaskletError> {
        self.ensure_not_cancelled(ctx)?;
        let res = self.docker.start_container(id).await;
        if res.is_ok() {
            Ok(())
        } else {
            Err(TaskletError::Fail(format!(
                "start failed: {}",
                res.message.unwrap_or_default()
            )))
        }
    }

    /// Poll the new container until healthy; a timeout is a failure that
    /// triggers rollback in the caller.
    pub async fn post_check(&self, ctx: &JobContext, id: &str) -> Result<(), TaskletError> {
        if !self.health_check_enabled {
            return Ok(());
        }
        let probe = wait_healthy(
            self.health.as_ref(),
            self.docker.as_ref(),
            id,
            POST_CHECK_TIMEOUT,
            ctx.cancel_token(),
        )
        .await;
        if probe.healthy {
            Ok(())
        } else {
            Err(TaskletError::Fail(format!(
                "post-check unhealthy: {}",
                probe.message.unwrap_or_default()
            )))
        }
    }

    /// Undo a partial update: drop the replacement (when it exists) and
    /// bring the original container back.
    pub async fn rollback(
        &self,
        ctx: &JobContext,
        pc: &ProcessedContainer,
        new_id: Option<&str>,
    ) {
        ctx.fire(format!("Rolling back '{}'", pc.name));
        if let Some(id) = new_id {
            let _ = self
                .docker
                .stop_container(&StopContainerArg::new(id).with_timeout(self.time_before_kill))
                .await;
            let _ = self
                .docker
                .delete_container(&DeleteContainerArg::new(id).with_kill(true))
                .await;
        }
        // The original may still exist (pre-remove failure) or need a
        // rebuild from its spec.
        match self.docker.get_container(&pc.id).await {
            Ok(Some(_)) => {
                let _ = self.docker.start_container(&pc.id).await;
            }
            _ => {
                let mut spec = pc.spec.clone();
                spec.name = Some(pc.name.clone());
                let res = self.docker.create_container(&spec).await;
                match res.id {
                    Some(id) if res.is_ok() => {
                        let _ = self.docker.start_container(&id).await;
                    }
                    _ => debug!(
                        "Rollback recreate of '{}' failed: {:?}",
                        pc.name, res.message
                    ),
                }
            }
        }
    }

    /// A free temporary name for the side-by-side replacement.
    pub async fn temp_name(&self, base: &str) -> String {
        ContainerNamesService::unique_name(self.docker.as_ref(), base).await
    }

    pub fn target_image(&self, pc: &ProcessedContainer) -> ImageRef {
        pc.image.with_tag(&self.target_version)
    }

    fn ensure_not_cancelled(&self, ctx: &JobContext) -> Result<(), TaskletError> {
        if ctx.is_cancelled() {
            Err(TaskletError::Fail("cancelled".to_string()))
        } else {
            Ok(())
        }
    }
}

fn pin_to_node(spec: &mut CreateContainerSpec, node: &str) {
    let entry = format!("{NODE_CONSTRAINT_PREFIX}{node}");
    if !spec.env.contains(&entry) {
        spec.env.push(entry);
    }
}

/// Rebuild a create spec from a live container's inspection.
fn spec_from_details(details: &ContainerDetails, name: &str, image: &str) -> CreateContainerSpec {
    let config = details.config.clone().unwrap_or_default();
    CreateContainerSpec {
        name: Some(name.to_string()),
        image: config.image.unwrap_or_else(|| image.to_string()),
        env: config.env,
        cmd: config.cmd,
        entrypoint: config.entrypoint,
        labels: config.labels,
        host_config: details.host_config.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(pattern: &str, target: &str) -> UpdateBatch {
        // A filter-only batch; the docker handle is never touched here.
        UpdateBatch {
            docker: unreachable_docker(),
            pattern: ImagePattern::new(pattern),
            target_version: target.to_string(),
            health_check_enabled: false,
            rollback_enabled: false,
            time_before_kill: 10,
            health: super::super::DockerHealthCheck::shared(),
        }
    }

    fn unreachable_docker() -> Arc<dyn DockerService> {
        use crate::bus::EventBus;
        use crate::docker::{ClusterConfig, DockerEndpoint, ServiceNodeInfo};

        struct NoNodes;
        impl crate::docker::NodeInfoProvider for NoNodes {
            fn node_info(&self, _name: &str) -> Option<ServiceNodeInfo> {
                None
            }
        }
        DockerEndpoint::builder()
            .node("test")
            .config(ClusterConfig {
                hosts: vec!["localhost:1".to_string()],
                ..Default::default()
            })
            .events(Arc::new(EventBus::new()))
            .node_info(Arc::new(NoNodes))
            .build()
            .unwrap()
    }

    #[test]
    fn test_filter_excludes_digest_refs() {
        let b = batch("*", "2");
        let digest = ImageRef::parse(
            "sha256:4355a46b19d348dc2f57c046f8ef63d4538ebb936000f3c9ee954a27460dd865",
        );
        assert!(!b.accepts(&digest, Some("sha256:4355")));
    }

    #[test]
    fn test_filter_includes_outdated_tag() {
        let b = batch("*", "2");
        assert!(b.accepts(&ImageRef::parse("testimage:1"), Some("sha256:aaa")));
        // Already at target.
        assert!(!b.accepts(&ImageRef::parse("testimage:2"), Some("sha256:aaa")));
    }

    #[test]
    fn test_filter_respects_pattern() {
        let b = batch("testimage*", "2");
        assert!(b.accepts(&ImageRef::parse("testimage:1"), None));
        assert!(!b.accepts(&ImageRef::parse("otherimage:1"), None));
    }

    #[test]
    fn test_pin_to_node_once() {
        let mut spec = CreateContainerSpec {
            image: "a:1".to_string(),
            ..Default::default()
        };
        pin_to_node(&mut spec, "n1");
        pin_to_node(&mut spec, "n1");
        assert_eq!(
            spec.env,
            vec!["constraint:node==n1".to_string()]
        );
    }
}
