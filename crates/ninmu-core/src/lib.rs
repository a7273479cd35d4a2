//! Core contract between workers, reapers, schedulers and storage.
//!
//! - Handlers state intent; no hidden retries or implicit success.
//! - Worker enforces pacing (ticks, concurrency) and liveness (heartbeat).
//! - Reaper recovers jobs whose worker went silent.
//! - Scheduler enqueues recurring work under a policy's interval and cap.
//! - Backend persists state transitions atomically; storage policy stays
//!   behind the trait boundary.
pub mod backend;
pub mod cancel;
pub mod clock;
pub mod job;
pub mod listing;
pub mod memory;
pub mod policy;
pub mod reaper;
pub mod scheduler;
pub mod stats;
pub mod utils;
pub mod worker;

#[cfg(feature = "rt-tokio")]
mod tokio_spawner;
#[cfg(feature = "rt-tokio")]
pub use tokio_spawner::TokioSpawner;

pub use backend::{
    BackEndContext, BackEndDriver, BackEndPoller, Heartbeat, Job, JobStore, Reap, ReapReport,
};
pub use cancel::Cancel;
pub use clock::{Clock, ManualClock, SystemClock};
pub use job::{
    EntityActivity, EntityId, EntityRef, FailureKind, InsertJob, JobId, JobRecord, JobState,
    ListOptions,
};
pub use listing::JobListing;
pub use memory::MemoryBackEnd;
pub use policy::{MatchLimit, Policy, PolicyConfig, PolicyError, PolicyScope, RecurrenceSettings};
pub use reaper::{Reaper, ReaperBuilder};
pub use scheduler::{
    Candidate, EntitySource, EvaluateError, PolicyOutcome, Scheduler, SchedulerBuilder,
};
pub use stats::Stats;
pub use worker::{DEFAULT_SLOTS, InlineSpawner, JobSpawner, Worker, WorkerBuilder};

/// Heartbeat cadence backends use unless configured otherwise.
pub const DEFAULT_HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// Outcome a handler wants to persist.
///
/// Choose the smallest honest outcome instead of masking failures.
/// - `Complete`: finished and durable.
/// - `Retry`: transient failure; requeue while the attempt budget lasts.
/// - `Fail`: permanent failure; do not waste capacity.
/// - `Canceled`: the handler saw its [`Cancel`] and stopped early.
pub enum JobResult {
    Complete,
    Retry(String),
    Fail(String),
    Canceled,
}

impl JobResult {
    pub fn retry(message: impl std::fmt::Display) -> Self {
        Self::Retry(message.to_string())
    }

    pub fn fail(message: impl std::fmt::Display) -> Self {
        Self::Fail(message.to_string())
    }
}

/// Any error is transient unless the handler says otherwise with
/// [`JobResult::Fail`].
impl<E> From<Result<(), E>> for JobResult
where
    E: std::fmt::Display,
{
    fn from(value: Result<(), E>) -> Self {
        match value {
            Ok(()) => Self::Complete,
            Err(error) => Self::retry(error),
        }
    }
}

/// Trait implemented by functions that process a job.
///
/// The `M` type parameter determines which combination of [`JobData`],
/// [`WorkerContext`] and [`Cancel`] the handler expects. The associated
/// [`Data`](JobHandler::Data) type is the payload the job carries.
pub trait JobHandler<M>: Send + Sync + Clone + 'static {
    /// The job payload type handled by this function.
    type Data: Send + 'static;
    /// Type of the shared context provided to the handler.
    type Context: Send + 'static;

    /// Future returned by the handler.
    type Future: Future<Output = JobResult> + Send;

    /// Invoke the handler with the claimed job, worker context and the
    /// job's cancellation signal.
    fn call(self, job: JobRecord<Self::Data>, context: Self::Context, cancel: Cancel)
    -> Self::Future;
}

/// Explicitly opt-in to receive the claimed job: payload plus entity,
/// revision and bookkeeping fields.
pub struct JobData<T>(pub JobRecord<T>);

/// Explicitly opt-in to receive shared context (e.g., pools, config).
///
/// Context is cloned per job to avoid shared mutable state.
pub struct WorkerContext<S>(pub S);

impl<F, Fut> JobHandler<()> for F
where
    F: FnOnce() -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send,
{
    type Data = ();
    type Context = ();
    type Future = Fut;

    fn call(
        self,
        _job: JobRecord<Self::Data>,
        _context: Self::Context,
        _cancel: Cancel,
    ) -> Self::Future {
        self()
    }
}

impl<F, Fut, T> JobHandler<JobData<T>> for F
where
    T: Send + 'static,
    F: FnOnce(JobData<T>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send,
{
    type Data = T;
    type Context = ();
    type Future = Fut;

    fn call(
        self,
        job: JobRecord<Self::Data>,
        _context: Self::Context,
        _cancel: Cancel,
    ) -> Self::Future {
        self(JobData(job))
    }
}

impl<F, Fut, S> JobHandler<WorkerContext<S>> for F
where
    S: Send + 'static,
    F: FnOnce(WorkerContext<S>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send,
{
    type Data = ();
    type Context = S;
    type Future = Fut;

    fn call(
        self,
        _job: JobRecord<Self::Data>,
        context: Self::Context,
        _cancel: Cancel,
    ) -> Self::Future {
        self(WorkerContext(context))
    }
}

impl<F, Fut, T, S> JobHandler<(JobData<T>, WorkerContext<S>)> for F
where
    T: Send + 'static,
    S: Send + 'static,
    F: FnOnce(JobData<T>, WorkerContext<S>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send,
{
    type Data = T;
    type Context = S;
    type Future = Fut;

    fn call(
        self,
        job: JobRecord<Self::Data>,
        context: Self::Context,
        _cancel: Cancel,
    ) -> Self::Future {
        self(JobData(job), WorkerContext(context))
    }
}

impl<F, Fut, T> JobHandler<(JobData<T>, Cancel)> for F
where
    T: Send + 'static,
    F: FnOnce(JobData<T>, Cancel) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send,
{
    type Data = T;
    type Context = ();
    type Future = Fut;

    fn call(
        self,
        job: JobRecord<Self::Data>,
        _context: Self::Context,
        cancel: Cancel,
    ) -> Self::Future {
        self(JobData(job), cancel)
    }
}

impl<F, Fut, T, S> JobHandler<(JobData<T>, WorkerContext<S>, Cancel)> for F
where
    T: Send + 'static,
    S: Send + 'static,
    F: FnOnce(JobData<T>, WorkerContext<S>, Cancel) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send,
{
    type Data = T;
    type Context = S;
    type Future = Fut;

    fn call(
        self,
        job: JobRecord<Self::Data>,
        context: Self::Context,
        cancel: Cancel,
    ) -> Self::Future {
        self(JobData(job), WorkerContext(context), cancel)
    }
}
