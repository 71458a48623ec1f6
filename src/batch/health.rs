//! Health gate for update pipelines.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::docker::{CancelToken, DockerService};

/// Answer of one health probe.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub message: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
        }
    }
}

/// Decides whether a container is healthy. The default implementation
/// asks the daemon; deployments with an external health system plug in
/// their own.
#[async_trait]
pub trait HealthCheckService: Send + Sync {
    async fn check_container(
        &self,
        docker: &dyn DockerService,
        container_id: &str,
    ) -> HealthCheckResult;
}

/// Daemon-backed health: a container is healthy when its state says
/// running (and not restarting).
pub struct DockerHealthCheck;

impl DockerHealthCheck {
    pub fn shared() -> Arc<dyn HealthCheckService> {
        Arc::new(Self)
    }
}

#[async_trait]
impl HealthCheckService for DockerHealthCheck {
    async fn check_container(
        &self,
        docker: &dyn DockerService,
        container_id: &str,
    ) -> HealthCheckResult {
        match docker.get_container(container_id).await {
            Ok(Some(details)) => match details.state {
                Some(state) if state.running && !state.restarting => {
                    HealthCheckResult::healthy()
                }
                Some(state) => HealthCheckResult::unhealthy(format!(
                    "state {}, exit code {}",
                    state.status.as_deref().unwrap_or("unknown"),
                    state.exit_code
                )),
                None => HealthCheckResult::unhealthy("no state reported"),
            },
            Ok(None) => HealthCheckResult::unhealthy("container is gone"),
            Err(e) => HealthCheckResult::unhealthy(e.to_string()),
        }
    }
}

/// Poll until the container reports healthy, the timeout elapses or the
/// token fires. Returns the last probe.
pub async fn wait_healthy(
    service: &dyn HealthCheckService,
    docker: &dyn DockerService,
    container_id: &str,
    timeout: Duration,
    cancel: &CancelToken,
) -> HealthCheckResult {
    const PROBE_INTERVAL: Duration = Duration::from_secs(1);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let probe = service.check_container(docker, container_id).await;
        if probe.healthy || cancel.is_cancelled() {
            return probe;
        }
        if tokio::time::Instant::now() + PROBE_INTERVAL > deadline {
            debug!("Health wait for {} timed out", container_id);
            return probe;
        }
        tokio::select! {
            _ = tokio::time::sleep(PROBE_INTERVAL) => {}
            _ = cancel.cancelled() => return probe,
        }
    }
}
