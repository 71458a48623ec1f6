//! Typed background jobs.
//!
//! Work that outlives a request (rolling updates, source deploys, tag
//! reconciliation) runs as a job. A job type is registered once with a
//! parameter schema and a handler; operators create instances bound to
//! concrete parameters, watch progress on the `job.<id>` topic and cancel
//! cooperatively. Lifecycle:
//!
//! ```text
//! CREATED ──start()──▶ STARTED ──▶ RUNNING ──┬──▶ COMPLETED
//!                                            ├──▶ FAILED
//!                                            └──▶ CANCELLED   (cancel())
//! ```
//!
//! Terminal states are absorbing and fire exactly one end event.

mod context;
mod engine;
mod instance;
mod params;

pub use context::JobContext;
pub use engine::{JobDefinition, JobHandler, JobsManager, ServiceResolver};
pub use instance::{job_topic, JobEvent, JobEventKind, JobInfo, JobInstance, JobStatus};
pub use params::{JobParamDef, JobParameters, ParamKind, ParametersBuilder};

use thiserror::Error;

/// Name of the parameter binding a job to a cluster; the job scope
/// resolves it to an endpoint client at start.
pub const PARAM_CLUSTER: &str = "cluster";

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Unknown job type '{0}'")]
    UnknownType(String),

    #[error("Job '{ty}' is already running for '{scope}'")]
    AlreadyRunning { ty: String, scope: String },

    #[error("Required parameter '{name}' of job '{ty}' is not bound")]
    MissingParameter { ty: String, name: String },

    #[error("Parameter '{name}' is not a valid {expected}")]
    InvalidParameter { name: String, expected: String },

    #[error("Job instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("{0}")]
    Failed(String),

    #[error("Cancelled")]
    Cancelled,
}
