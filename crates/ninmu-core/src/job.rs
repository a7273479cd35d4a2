//! Job records and the state machine they walk.
//!
//! `queued → processing → {completed, failed, canceled}`, plus
//! `processing → queued` when a job is retried or reclaimed and
//! `queued → canceled` when a queued job is canceled. Terminal states are
//! never left.
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::stats::Stats;

/// Identity of a job. Assigned by the store, monotonically increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of the thing a job operates on (a repository, a search, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Entity reference carried by a job. The name is what free-text list
/// queries match against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: EntityId,
    pub name: String,
}

impl EntityRef {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id: EntityId(id),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Whether an edge `self → next` exists in the state graph.
    pub const fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Processing)
                | (Self::Queued, Self::Canceled)
                | (Self::Processing, Self::Queued)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
                | (Self::Processing, Self::Canceled)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownState(pub String);

impl std::fmt::Display for UnknownState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown job state `{}`", self.0)
    }
}

impl std::error::Error for UnknownState {}

impl std::str::FromStr for JobState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(UnknownState(other.to_owned())),
        }
    }
}

/// Category of the last failure recorded on a job.
///
/// Kept on the record so operators can tell crash-recovery exhaustion apart
/// from handler logic failures without correlating logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient handler error; the job was requeued.
    Retryable,
    /// Handler reported a non-retryable error.
    Permanent,
    /// Retryable errors used up the attempt budget.
    RetriesExhausted,
    /// Heartbeat went stale after the reset budget was spent.
    LostWorker,
}

impl FailureKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Permanent => "permanent",
            Self::RetriesExhausted => "retries_exhausted",
            Self::LostWorker => "lost_worker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retryable" => Some(Self::Retryable),
            "permanent" => Some(Self::Permanent),
            "retries_exhausted" => Some(Self::RetriesExhausted),
            "lost_worker" => Some(Self::LostWorker),
            _ => None,
        }
    }
}

/// Message recorded when the reaper gives up on a job.
pub const LOST_WORKER_MESSAGE: &str = "job lost its worker: reset budget exhausted";

/// A job as stored, with its payload decoded to `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord<T> {
    pub id: JobId,
    pub kind: String,
    pub entity: EntityRef,
    pub revision: String,
    pub payload: T,
    pub state: JobState,
    pub cancel_requested: bool,
    pub created_at: SystemTime,
    pub queued_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub last_heartbeat_at: Option<SystemTime>,
    pub failure_count: u32,
    pub reset_count: u32,
    pub max_attempts: u32,
    pub failure_message: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub worker_id: Option<String>,
    pub stats: Stats,
}

impl<T> JobRecord<T> {
    /// Timestamp the recurrence policy measures the minimum interval from.
    pub fn last_activity_at(&self) -> SystemTime {
        match self.started_at {
            Some(started) if started > self.queued_at => started,
            _ => self.queued_at,
        }
    }

    pub fn map_payload<U>(self, f: impl FnOnce(T) -> U) -> JobRecord<U> {
        JobRecord {
            id: self.id,
            kind: self.kind,
            entity: self.entity,
            revision: self.revision,
            payload: f(self.payload),
            state: self.state,
            cancel_requested: self.cancel_requested,
            created_at: self.created_at,
            queued_at: self.queued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            last_heartbeat_at: self.last_heartbeat_at,
            failure_count: self.failure_count,
            reset_count: self.reset_count,
            max_attempts: self.max_attempts,
            failure_message: self.failure_message,
            failure_kind: self.failure_kind,
            worker_id: self.worker_id,
            stats: self.stats,
        }
    }
}

/// Configuration for inserting a job into the queue.
///
/// Duplicates are not rejected here; the recurrence scheduler checks for
/// active jobs before enqueueing, other callers dedup on their own.
#[derive(Debug, Clone)]
pub struct InsertJob<T> {
    pub(crate) entity: EntityRef,
    pub(crate) revision: String,
    pub(crate) data: T,
    pub(crate) max_attempts: u32,
    /// Delay before the job becomes eligible for a claim. Zero by default.
    pub(crate) delay: Duration,
}

impl<T> InsertJob<T> {
    /// Default maximum number of attempts before a retryable failure
    /// becomes terminal.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 25;

    pub fn new(entity: EntityRef, revision: impl Into<String>, data: T) -> Self {
        Self {
            entity,
            revision: revision.into(),
            data,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            delay: Duration::ZERO,
        }
    }

    /// Set how many attempts the job gets. Clamped to at least one.
    pub fn max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    pub fn delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_duration(&self) -> Duration {
        self.delay
    }

    pub fn into_inner(self) -> T {
        self.data
    }
}

/// Filters and keyset pagination for listing jobs.
///
/// Pagination is driven by the caller: pass the last seen id as `after`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub state: Option<JobState>,
    /// Case-insensitive substring over entity name and revision.
    pub query: Option<String>,
    pub after: Option<JobId>,
    pub first: Option<usize>,
    pub descending: bool,
}

impl ListOptions {
    pub fn state(self, state: JobState) -> Self {
        Self {
            state: Some(state),
            ..self
        }
    }

    pub fn query(self, query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..self
        }
    }

    pub fn after(self, after: JobId) -> Self {
        Self {
            after: Some(after),
            ..self
        }
    }

    pub fn first(self, first: usize) -> Self {
        Self {
            first: Some(first),
            ..self
        }
    }

    pub fn descending(self) -> Self {
        Self {
            descending: true,
            ..self
        }
    }

    /// Whether a record passes the state and text filters. Pagination is
    /// not considered.
    pub fn matches<T>(&self, job: &JobRecord<T>) -> bool {
        if self.state.is_some_and(|state| state != job.state) {
            return false;
        }
        match self.query.as_deref() {
            None | Some("") => true,
            Some(query) => {
                let query = query.to_lowercase();
                job.entity.name.to_lowercase().contains(&query)
                    || job.revision.to_lowercase().contains(&query)
            }
        }
    }
}

/// What the recurrence scheduler needs to know about one entity's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityActivity {
    pub entity: EntityId,
    /// Queued/started time of the entity's most recent job.
    pub last_queued_at: Option<SystemTime>,
    /// A queued or processing job exists for the entity.
    pub has_active_job: bool,
}
