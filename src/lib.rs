pub use ninmu_core::{
    BackEndContext, BackEndPoller, Candidate, Cancel, Clock, EntityActivity, EntityId, EntityRef,
    EntitySource, FailureKind, Heartbeat, InlineSpawner, InsertJob, JobData, JobHandler, JobId,
    JobListing, JobRecord, JobResult, JobState, JobStore, ListOptions, ManualClock, MatchLimit,
    MemoryBackEnd, Policy, PolicyConfig, PolicyError, PolicyScope, Reap, ReapReport, Reaper,
    ReaperBuilder, RecurrenceSettings, Scheduler, SchedulerBuilder, Stats, SystemClock, Worker,
    WorkerBuilder, WorkerContext,
};
pub use ninmu_core::{backend, utils, worker};

#[cfg(feature = "rt-tokio")]
pub use ninmu_core::TokioSpawner;

#[cfg(feature = "postgres")]
pub use ninmu_sqlx::{Client, Listener, PgBackEnd, PgPool, WorkerWithListenerExt, migrate};
