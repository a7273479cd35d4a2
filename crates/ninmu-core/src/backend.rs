//! Backend-facing traits: claim jobs, heartbeat, persist outcomes, reap.
//!
//! Small surface, strong separation: the worker drives; the backend stores.
//!
//! - Backend owns lease semantics and heartbeat cadence (storage knows best).
//! - Finalization methods consume `self` to forbid double-commit by type.
//! - Polling yields per-job results to avoid head-of-line blocking on errors.
//! - Every state transition is a single atomic store operation; nothing here
//!   reads a row and then decides in a second call.
mod tmp {
    use crate::job::{EntityActivity, EntityId, InsertJob, JobId, JobRecord, JobState, ListOptions};
    use crate::stats::Stats;

    /// Backend marker carrying the backend-specific error type.
    pub trait BackEndDriver: Send {
        type Error: std::error::Error + Send;
    }

    /// What a heartbeat learned about the job it refreshed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub enum Heartbeat {
        /// Still ours, keep going.
        Continue,
        /// Still ours, but someone asked for cancellation.
        CancelRequested,
        /// No longer ours (reclaimed or finalized elsewhere). Stop without
        /// finalization.
        Lost,
    }

    /// Per-job context for heartbeats and finalization.
    ///
    /// Scopes the authority to update a job to a single handle holding the
    /// lease token minted by the claim.
    #[trait_variant::make(BackEndContext: Send)]
    pub trait LocalBackEndContext {
        type Driver: BackEndDriver;
        fn job_id(&self) -> JobId;
        #[allow(unused)]
        fn heartbeat_interval(&mut self) -> std::time::Duration;
        #[allow(unused)]
        async fn heartbeat(&mut self) -> Result<Heartbeat, <Self::Driver as BackEndDriver>::Error>;
        #[allow(unused)]
        async fn complete(self) -> Result<(), <Self::Driver as BackEndDriver>::Error>;
        /// Requeue when `retryable` and the attempt budget allows, otherwise
        /// fail terminally. Returns the state the job landed in.
        #[allow(unused)]
        async fn fail(
            self,
            message: String,
            retryable: bool,
        ) -> Result<JobState, <Self::Driver as BackEndDriver>::Error>;
        /// The handler observed cancellation and stopped.
        #[allow(unused)]
        async fn cancel(self) -> Result<(), <Self::Driver as BackEndDriver>::Error>;
    }

    /// Pair of job payload and backend context.
    pub struct Job<Data, Context> {
        data: Data,
        context: Context,
    }

    impl<Data, Context> Job<Data, Context> {
        /// Separate payload and context for handler and bookkeeping.
        pub fn split_parts(self) -> (Data, Context) {
            (self.data, self.context)
        }

        /// Build a job from payload and context.
        pub fn from_parts(data: Data, context: Context) -> Self {
            Self { data, context }
        }
    }

    /// Atomic claim. At most one caller wins a given row; a lost race is
    /// simply absent from the result.
    #[trait_variant::make(BackEndPoller: Send)]
    pub trait LocalBackEndPoller {
        type Driver: BackEndDriver;
        type Data: Send + 'static;
        type Context: BackEndContext + Send + 'static;

        #[allow(unused)]
        async fn poll_job(
            &mut self,
            batch_size: usize,
        ) -> Vec<
            Result<
                Job<JobRecord<Self::Data>, Self::Context>,
                <Self::Driver as BackEndDriver>::Error,
            >,
        >;
    }

    /// Operations the API layer and the scheduler use on the job table.
    #[trait_variant::make(JobStore: Send)]
    pub trait LocalJobStore {
        type Driver: BackEndDriver;
        type Data: Send + 'static;

        async fn enqueue(
            &self,
            job: &InsertJob<Self::Data>,
        ) -> Result<JobId, <Self::Driver as BackEndDriver>::Error>;

        /// Fails with a not-found error for an unknown id.
        async fn job(
            &self,
            id: JobId,
        ) -> Result<JobRecord<Self::Data>, <Self::Driver as BackEndDriver>::Error>;

        /// Queued jobs are canceled immediately; processing jobs get the
        /// cancel flag; terminal jobs are rejected untouched.
        async fn cancel(
            &self,
            id: JobId,
        ) -> Result<JobState, <Self::Driver as BackEndDriver>::Error>;

        async fn list(
            &self,
            options: &ListOptions,
        ) -> Result<Vec<JobRecord<Self::Data>>, <Self::Driver as BackEndDriver>::Error>;

        /// Number of jobs passing the filters; `after`/`first` are ignored.
        async fn count(
            &self,
            options: &ListOptions,
        ) -> Result<usize, <Self::Driver as BackEndDriver>::Error>;

        async fn last_job_for_revision(
            &self,
            entity: EntityId,
            revision: &str,
        ) -> Result<Option<JobRecord<Self::Data>>, <Self::Driver as BackEndDriver>::Error>;

        async fn last_completed_job(
            &self,
            entity: EntityId,
        ) -> Result<Option<JobRecord<Self::Data>>, <Self::Driver as BackEndDriver>::Error>;

        async fn stats(&self, id: JobId) -> Result<Stats, <Self::Driver as BackEndDriver>::Error>;

        /// Merge a partial report and return the stored result.
        async fn merge_stats(
            &self,
            id: JobId,
            partial: &Stats,
        ) -> Result<Stats, <Self::Driver as BackEndDriver>::Error>;

        /// One entry per requested entity, in the order given.
        async fn activity(
            &self,
            entities: &[EntityId],
        ) -> Result<Vec<EntityActivity>, <Self::Driver as BackEndDriver>::Error>;
    }

    /// Jobs touched by one reaper pass.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct ReapReport {
        pub requeued: Vec<JobId>,
        pub failed: Vec<JobId>,
        /// Stale jobs that already had cancellation requested.
        pub canceled: Vec<JobId>,
    }

    impl ReapReport {
        pub fn is_empty(&self) -> bool {
            self.requeued.is_empty() && self.failed.is_empty() && self.canceled.is_empty()
        }
    }

    /// Recover processing jobs whose heartbeat went stale.
    #[trait_variant::make(Reap: Send)]
    pub trait LocalReap {
        type Driver: BackEndDriver;

        /// Requeue stale jobs whose reset count is below `max_resets`
        /// (incrementing it) and fail the rest as lost-worker. A stale job
        /// with cancellation requested is canceled instead.
        async fn reap_stale(
            &self,
            stale_after: std::time::Duration,
            max_resets: u32,
        ) -> Result<ReapReport, <Self::Driver as BackEndDriver>::Error>;
    }
}

pub use tmp::{
    BackEndContext, BackEndDriver, BackEndPoller, Heartbeat, Job, JobStore, Reap, ReapReport,
};
