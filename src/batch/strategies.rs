//! The three rolling-update orders.

use std::sync::Arc;

use async_trait::async_trait;

use crate::jobs::{JobContext, JobError, JobHandler};

use super::health::HealthCheckService;
use super::tasklets::{TaskletError, UpdateBatch};
use super::{ProcessedContainer, Stage};

/// Which order an update walks its containers in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Per container: stop old, create, start new, verify. Cheapest; a
    /// short gap per container.
    StopThenStartEach,
    /// Per container: create and start the new one next to the old, verify,
    /// then retire the old. Needs spare capacity, keeps the service up.
    StartThenStopEach,
    /// Stop everything, then bring everything up, then verify. Fastest
    /// wall-clock, with a full service gap.
    StopThenStartAll,
}

impl UpdateStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateStrategy::StopThenStartEach => "stopThenStartEach",
            UpdateStrategy::StartThenStopEach => "startThenStopEach",
            UpdateStrategy::StopThenStartAll => "stopThenStartAll",
        }
    }
}

/// Handler behind every `job.updateContainers.*` type.
pub struct UpdateContainersJob {
    pub strategy: UpdateStrategy,
    pub health: Arc<dyn HealthCheckService>,
}

#[async_trait]
impl JobHandler for UpdateContainersJob {
    async fn run(&self, ctx: Arc<JobContext>) -> Result<(), JobError> {
        let batch = UpdateBatch::from_context(&ctx, self.health.clone())?;
        let containers = batch.load(&ctx).await?;
        if containers.is_empty() {
            ctx.fire("Nothing to update.");
            return Ok(());
        }
        match self.strategy {
            UpdateStrategy::StopThenStartEach => stop_then_start_each(&batch, &ctx, containers).await,
            UpdateStrategy::StartThenStopEach => start_then_stop_each(&batch, &ctx, containers).await,
            UpdateStrategy::StopThenStartAll => stop_then_start_all(&batch, &ctx, containers).await,
        }
    }
}

/// Handle a pre-stop tasklet outcome: `Skip` drops the container from the
/// batch, `Fail` aborts the job. No state was touched yet, so no rollback.
fn pre_stop(ctx: &JobContext, pc: &ProcessedContainer, err: TaskletError) -> Result<bool, JobError> {
    match err {
        TaskletError::Skip(msg) => {
            ctx.fire(format!("Skipping '{}': {}", pc.name, msg));
            Ok(false)
        }
        fail => Err(fail.into_job_error(&pc.name)),
    }
}

async fn stop_then_start_each(
    batch: &UpdateBatch,
    ctx: &JobContext,
    containers: Vec<ProcessedContainer>,
) -> Result<(), JobError> {
    for mut pc in containers {
        let target = batch.target_image(&pc);

        if let Err(e) = batch.load_image(ctx, &pc, &target).await {
            if !pre_stop(ctx, &pc, e)? {
                continue;
            }
        }
        pc.stage = Stage::ImagePulled;
        if let Err(e) = batch.pre_check(ctx, &pc).await {
            if !pre_stop(ctx, &pc, e)? {
                continue;
            }
        }

        if let Err(e) = batch.stop_old(ctx, &pc).await {
            return Err(e.into_job_error(&pc.name));
        }
        pc.stage = Stage::Stopped;

        let new_id = match batch.create_new(ctx, &pc, &target, &pc.name).await {
            Ok(id) => id,
            Err(e) => return fail_with_rollback(batch, ctx, &pc, None, e).await,
        };
        pc.stage = Stage::Created;

        if let Err(e) = batch.start(ctx, &new_id).await {
            return fail_with_rollback(batch, ctx, &pc, Some(&new_id), e).await;
        }
        pc.stage = Stage::Started;

        if let Err(e) = batch.post_check(ctx, &new_id).await {
            return fail_with_rollback(batch, ctx, &pc, Some(&new_id), e).await;
        }
        pc.stage = Stage::Verified;
        ctx.fire(format!("'{}' now runs {}", pc.name, target));
    }
    Ok(())
}

async fn start_then_stop_each(
    batch: &UpdateBatch,
    ctx: &JobContext,
    containers: Vec<ProcessedContainer>,
) -> Result<(), JobError> {
    for mut pc in containers {
        let target = batch.target_image(&pc);

        if let Err(e) = batch.load_image(ctx, &pc, &target).await {
            if !pre_stop(ctx, &pc, e)? {
                continue;
            }
        }
        pc.stage = Stage::ImagePulled;
        if let Err(e) = batch.pre_check(ctx, &pc).await {
            if !pre_stop(ctx, &pc, e)? {
                continue;
            }
        }

        // The replacement runs side by side under a free name until it
        // proves healthy; the service never loses its last instance.
        let temp = batch.temp_name(&pc.name).await;
        let new_id = match batch.create_new(ctx, &pc, &target, &temp).await {
            Ok(id) => id,
            Err(e) => return Err(e.into_job_error(&pc.name)),
        };
        pc.stage = Stage::Created;

        if let Err(e) = batch.start(ctx, &new_id).await {
            return fail_with_rollback(batch, ctx, &pc, Some(&new_id), e).await;
        }
        pc.stage = Stage::Started;

        if let Err(e) = batch.post_check(ctx, &new_id).await {
            return fail_with_rollback(batch, ctx, &pc, Some(&new_id), e).await;
        }

        if let Err(e) = batch.stop_old(ctx, &pc).await {
            return fail_with_rollback(batch, ctx, &pc, Some(&new_id), e).await;
        }
        pc.stage = Stage::Stopped;

        if temp != pc.name {
            let res = batch.docker.rename_container(&new_id, &pc.name).await;
            if !res.is_ok() {
                ctx.fire(format!(
                    "Replacement of '{}' keeps name '{}': {}",
                    pc.name,
                    temp,
                    res.message.unwrap_or_default()
                ));
            }
        }
        pc.stage = Stage::Verified;
        ctx.fire(format!("'{}' now runs {}", pc.name, target));
    }
    Ok(())
}

async fn stop_then_start_all(
    batch: &UpdateBatch,
    ctx: &JobContext,
    containers: Vec<ProcessedContainer>,
) -> Result<(), JobError> {
    let mut batch_set = Vec::new();

    // Phase 1: pull images and gate, dropping skippable containers.
    for mut pc in containers {
        let target = batch.target_image(&pc);
        if let Err(e) = batch.load_image(ctx, &pc, &target).await {
            if !pre_stop(ctx, &pc, e)? {
                continue;
            }
        }
        pc.stage = Stage::ImagePulled;
        if let Err(e) = batch.pre_check(ctx, &pc).await {
            if !pre_stop(ctx, &pc, e)? {
                continue;
            }
        }
        batch_set.push((pc, target));
    }

    // Phase 2: stop the world.
    for (pc, _) in &mut batch_set {
        if let Err(e) = batch.stop_old(ctx, pc).await {
            return Err(e.into_job_error(&pc.name));
        }
        pc.stage = Stage::Stopped;
    }

    // Phase 3: bring the new world up, then verify it.
    let mut started = Vec::new();
    for (pc, target) in &mut batch_set {
        let new_id = match batch.create_new(ctx, pc, target, &pc.name).await {
            Ok(id) => id,
            Err(e) => return fail_with_rollback(batch, ctx, pc, None, e).await,
        };
        pc.stage = Stage::Created;
        if let Err(e) = batch.start(ctx, &new_id).await {
            return fail_with_rollback(batch, ctx, pc, Some(&new_id), e).await;
        }
        pc.stage = Stage::Started;
        started.push((pc.clone(), new_id));
    }
    for (pc, new_id) in &started {
        if let Err(e) = batch.post_check(ctx, new_id).await {
            return fail_with_rollback(batch, ctx, pc, Some(new_id), e).await;
        }
    }
    for (pc, target) in &mut batch_set {
        pc.stage = Stage::Verified;
        ctx.fire(format!("'{}' now runs {}", pc.name, target));
    }
    Ok(())
}

/// Terminal failure past the stop step: roll the container back when the
/// job asked for it, then fail the job.
async fn fail_with_rollback(
    batch: &UpdateBatch,
    ctx: &JobContext,
    pc: &ProcessedContainer,
    new_id: Option<&str>,
    err: TaskletError,
) -> Result<(), JobError> {
    if batch.rollback_enabled {
        batch.rollback(ctx, pc, new_id).await;
    }
    Err(err.into_job_error(&pc.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_names() {
        assert_eq!(UpdateStrategy::StopThenStartEach.name(), "stopThenStartEach");
        assert_eq!(UpdateStrategy::StartThenStopEach.name(), "startThenStopEach");
        assert_eq!(UpdateStrategy::StopThenStartAll.name(), "stopThenStartAll");
    }
}
