//! One running (or finished) job.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::bus::EventBus;
use crate::docker::CancelToken;

use super::params::JobParameters;

/// Progress lines kept for late subscribers.
const TAIL_LIMIT: usize = 100;

/// Status of a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Started,
    Running,
    Failed,
    Cancelled,
    Completed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::Cancelled | JobStatus::Completed
        )
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Created => 0,
            JobStatus::Started => 1,
            JobStatus::Running => 2,
            JobStatus::Failed | JobStatus::Cancelled | JobStatus::Completed => 3,
        }
    }
}

/// Serializable snapshot of an instance, as the REST surface reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub parameters: JobParameters,
}

/// Event on the `job.<id>` topic.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: String,
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEventKind {
    Status(JobStatus),
    Progress(String),
}

pub fn job_topic(id: &str) -> String {
    format!("job.{id}")
}

struct InstanceState {
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    message: Option<String>,
}

/// A job instance. Status transitions are totally ordered and monotone;
/// terminal states are absorbing and fire exactly one end event.
pub struct JobInstance {
    id: String,
    parameters: JobParameters,
    status_tx: watch::Sender<JobStatus>,
    state: Mutex<InstanceState>,
    tail: Mutex<VecDeque<String>>,
    cancel: CancelToken,
    bus: Arc<EventBus<JobEvent>>,
}

impl JobInstance {
    pub fn new(id: String, parameters: JobParameters, bus: Arc<EventBus<JobEvent>>) -> Arc<Self> {
        let (status_tx, _) = watch::channel(JobStatus::Created);
        Arc::new(Self {
            id,
            parameters,
            status_tx,
            state: Mutex::new(InstanceState {
                created_at: Utc::now(),
                started_at: None,
                ended_at: None,
                message: None,
            }),
            tail: Mutex::new(VecDeque::new()),
            cancel: CancelToken::new(),
            bus,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ty(&self) -> &str {
        &self.parameters.ty
    }

    pub fn parameters(&self) -> &JobParameters {
        &self.parameters
    }

    pub fn status(&self) -> JobStatus {
        *self.status_tx.borrow()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Move the instance forward. Backward or terminal-escaping moves are
    /// ignored; returns whether the transition happened.
    pub fn transition(&self, to: JobStatus, message: Option<String>) -> bool {
        let mut changed = false;
        self.status_tx.send_if_modified(|current| {
            if current.rank() >= to.rank() || current.is_terminal() {
                return false;
            }
            *current = to;
            changed = true;
            true
        });
        if !changed {
            return false;
        }
        {
            let mut state = self.lock_state();
            match to {
                JobStatus::Started => state.started_at = Some(Utc::now()),
                _ if to.is_terminal() => {
                    state.ended_at = Some(Utc::now());
                    if message.is_some() {
                        state.message = message.clone();
                    }
                }
                _ => {}
            }
        }
        info!("Job {} [{}] -> {:?}", self.id, self.ty(), to);
        self.bus.publish(
            &job_topic(&self.id),
            JobEvent {
                job_id: self.id.clone(),
                kind: JobEventKind::Status(to),
            },
        );
        true
    }

    /// Request cooperative cancellation. An instance that never started is
    /// cancelled on the spot; a running one winds down when its tasklets
    /// observe the token.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if self.status() == JobStatus::Created {
            self.transition(JobStatus::Cancelled, None);
        }
    }

    /// Append a progress line and broadcast it.
    pub fn fire(&self, line: impl Into<String>) {
        let line = line.into();
        {
            let mut tail = self.lock_tail();
            if tail.len() == TAIL_LIMIT {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }
        info!("Job {}: {}", self.id, line);
        self.bus.publish(
            &job_topic(&self.id),
            JobEvent {
                job_id: self.id.clone(),
                kind: JobEventKind::Progress(line),
            },
        );
    }

    /// The bounded backlog of progress lines.
    pub fn progress_tail(&self) -> Vec<String> {
        self.lock_tail().iter().cloned().collect()
    }

    /// Resolve once the instance reaches a terminal status.
    pub async fn at_end(&self) -> JobStatus {
        let mut rx = self.status_tx.subscribe();
        loop {
            let status = *rx.borrow();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    pub fn info(&self) -> JobInfo {
        let state = self.lock_state();
        JobInfo {
            id: self.id.clone(),
            ty: self.parameters.ty.clone(),
            status: self.status(),
            created_at: state.created_at,
            started_at: state.started_at,
            ended_at: state.ended_at,
            message: state.message.clone(),
            parameters: self.parameters.clone(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tail(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.tail.lock().unwrap_or_else(|e| e.into_inner())
    }
}
