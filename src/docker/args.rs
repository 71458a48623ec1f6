//! Argument structs for daemon operations.

use tokio::sync::mpsc;

use super::model::{DockerEvent, Statistics};
use super::stream::{CancelToken, ProcessEvent};

/// `GET /containers/json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetContainersArg {
    /// Include stopped containers.
    pub all: bool,
}

impl GetContainersArg {
    pub fn new(all: bool) -> Self {
        Self { all }
    }
}

/// `GET /images/json`.
#[derive(Debug, Clone, Default)]
pub struct GetImagesArg {
    pub all: bool,
    /// Full image name with repository; the daemon does not accept masks
    /// here.
    pub name: Option<String>,
}

/// `POST /containers/{id}/stop` and `/restart`.
#[derive(Debug, Clone, Default)]
pub struct StopContainerArg {
    pub id: String,
    /// Seconds to wait before the daemon kills the process. 0 means the
    /// daemon default.
    pub time_before_kill: u32,
}

impl StopContainerArg {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            time_before_kill: 0,
        }
    }

    pub fn with_timeout(mut self, seconds: u32) -> Self {
        self.time_before_kill = seconds;
        self
    }
}

/// `POST /containers/{id}/kill`.
#[derive(Debug, Clone, Default)]
pub struct KillContainerArg {
    pub id: String,
    pub signal: Option<String>,
}

/// `DELETE /containers/{id}`.
#[derive(Debug, Clone, Default)]
pub struct DeleteContainerArg {
    pub id: String,
    pub delete_volumes: bool,
    /// Force removal of a running container.
    pub kill: bool,
}

impl DeleteContainerArg {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            delete_volumes: false,
            kill: false,
        }
    }

    pub fn with_kill(mut self, kill: bool) -> Self {
        self.kill = kill;
        self
    }
}

/// `DELETE /images/{id}`.
#[derive(Debug, Clone, Default)]
pub struct RemoveImageArg {
    pub image_id: String,
    pub force: bool,
    pub no_prune: bool,
}

/// `POST /images/{name}/tag` (+ optional push).
#[derive(Debug, Clone, Default)]
pub struct TagImageArg {
    pub repository: String,
    pub image_name: String,
    pub current_tag: String,
    pub new_tag: String,
    pub force: bool,
    /// Also push the new tag to the remote registry.
    pub remote: bool,
}

/// `GET /events`.
pub struct GetEventsArg {
    /// Unix seconds; only events after this instant.
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub sink: mpsc::Sender<DockerEvent>,
    pub cancel: CancelToken,
}

/// `GET /containers/{id}/logs`.
pub struct GetLogsArg {
    pub id: String,
    pub stdout: bool,
    pub stderr: bool,
    pub follow: bool,
    pub timestamps: bool,
    pub since: Option<i64>,
    pub tail: Option<u32>,
    pub sink: mpsc::Sender<ProcessEvent>,
    pub cancel: CancelToken,
}

impl GetLogsArg {
    pub fn new(id: impl Into<String>, sink: mpsc::Sender<ProcessEvent>) -> Self {
        Self {
            id: id.into(),
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            since: None,
            tail: None,
            sink,
            cancel: CancelToken::new(),
        }
    }
}

/// `GET /containers/{id}/stats`.
pub struct GetStatisticsArg {
    pub id: String,
    /// Stream snapshots until cancelled, or fetch a single one.
    pub stream: bool,
    pub sink: mpsc::Sender<Statistics>,
    pub cancel: CancelToken,
}
