//! Execution context handed to job handlers.

use std::sync::Arc;

use crate::docker::{CancelToken, DockerService};

use super::instance::JobInstance;
use super::params::JobParameters;

/// Everything a handler may touch while running: its parameters, the
/// progress feed, the cancellation token and the scope-bound endpoint
/// client resolved from the `cluster` parameter at start.
pub struct JobContext {
    instance: Arc<JobInstance>,
    docker: Option<Arc<dyn DockerService>>,
}

impl JobContext {
    pub fn new(instance: Arc<JobInstance>, docker: Option<Arc<dyn DockerService>>) -> Arc<Self> {
        Arc::new(Self { instance, docker })
    }

    pub fn job_id(&self) -> &str {
        self.instance.id()
    }

    pub fn parameters(&self) -> &JobParameters {
        self.instance.parameters()
    }

    /// Endpoint client of the job's cluster. Absent when the job was
    /// created without a `cluster` parameter; tasklets needing it must
    /// fail themselves, not the engine.
    pub fn docker(&self) -> Option<Arc<dyn DockerService>> {
        self.docker.clone()
    }

    /// Report a human-readable progress line.
    pub fn fire(&self, line: impl Into<String>) {
        self.instance.fire(line);
    }

    pub fn cancel_token(&self) -> &CancelToken {
        self.instance.cancel_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.instance.cancel_token().is_cancelled()
    }
}
