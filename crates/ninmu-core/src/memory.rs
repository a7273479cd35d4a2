//! In-process store implementing every backend trait.
//!
//! One mutex owns the whole table, so each operation is a single critical
//! section: the claim, the heartbeat and every finalization check the lease
//! and mutate under the same lock, which makes them atomic without a
//! check-then-act pair. Clones share the table; give each clone its own
//! [`worker_id`](MemoryBackEnd::worker_id) to model separate workers.
//!
//! Suitable for tests, demos and single-process deployments. Jobs do not
//! survive a restart.
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use crate::backend::{
    BackEndContext, BackEndDriver, BackEndPoller, Heartbeat, Job, JobStore, Reap, ReapReport,
};
use crate::clock::{Clock, SystemClock};
use crate::job::{
    EntityActivity, EntityId, FailureKind, InsertJob, JobId, JobRecord, JobState, ListOptions,
    LOST_WORKER_MESSAGE,
};
use crate::stats::Stats;

const DEFAULT_KIND: &str = "default";

pub struct MemoryDriver;
impl BackEndDriver for MemoryDriver {
    type Error = Error;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorKind {
    /// No job with the given id (for this kind).
    NotFound,
    /// The job's state does not allow the operation.
    InvalidState,
    /// The caller no longer owns the job.
    LostLease,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    id: JobId,
    state: Option<JobState>,
}

impl Error {
    fn not_found(id: JobId) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            id,
            state: None,
        }
    }

    fn invalid_state(id: JobId, state: JobState) -> Self {
        Self {
            kind: ErrorKind::InvalidState,
            id,
            state: Some(state),
        }
    }

    fn lost_lease(id: JobId) -> Self {
        Self {
            kind: ErrorKind::LostLease,
            id,
            state: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.kind, self.state) {
            (ErrorKind::NotFound, _) => write!(f, "job {} not found", self.id),
            (ErrorKind::InvalidState, Some(state)) => {
                write!(f, "job {} is already {state}", self.id)
            }
            (ErrorKind::InvalidState, None) => write!(f, "job {} is in an invalid state", self.id),
            (ErrorKind::LostLease, _) => write!(f, "lost lease for job {}", self.id),
        }
    }
}

impl std::error::Error for Error {}

struct Row<T> {
    record: JobRecord<T>,
    process_after: SystemTime,
    lease: Option<uuid::Uuid>,
}

impl<T> Row<T> {
    fn owned_by(&self, lease: uuid::Uuid) -> bool {
        self.record.state == JobState::Processing && self.lease == Some(lease)
    }

    fn requeue(&mut self, now: SystemTime, process_after: SystemTime) {
        let record = &mut self.record;
        record.state = JobState::Queued;
        record.queued_at = now;
        record.started_at = None;
        record.last_heartbeat_at = None;
        record.worker_id = None;
        self.process_after = process_after;
        self.lease = None;
    }

    fn finish(&mut self, state: JobState, now: SystemTime) {
        self.record.state = state;
        self.record.finished_at = Some(now);
        self.lease = None;
    }
}

struct Table<T> {
    last_id: i64,
    rows: BTreeMap<JobId, Row<T>>,
}

type Shared<T> = Arc<Mutex<Table<T>>>;

fn lock<T>(table: &Shared<T>) -> MutexGuard<'_, Table<T>> {
    // Every critical section leaves the table consistent, so a poisoned lock
    // still guards valid data.
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Backend keeping jobs in memory.
pub struct MemoryBackEnd<T> {
    table: Shared<T>,
    kind: Cow<'static, str>,
    worker_id: String,
    heartbeat_interval: Duration,
    retry_delay: Duration,
    clock: Arc<dyn Clock>,
}

impl<T> Clone for MemoryBackEnd<T> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            kind: self.kind.clone(),
            worker_id: self.worker_id.clone(),
            heartbeat_interval: self.heartbeat_interval,
            retry_delay: self.retry_delay,
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<T> std::fmt::Debug for MemoryBackEnd<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackEnd")
            .field("kind", &self.kind)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl<T> Default for MemoryBackEnd<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MemoryBackEnd<T> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                last_id: 0,
                rows: BTreeMap::new(),
            })),
            kind: Cow::Borrowed(DEFAULT_KIND),
            worker_id: uuid::Uuid::new_v4().to_string(),
            heartbeat_interval: crate::DEFAULT_HEARTBEAT_INTERVAL,
            retry_delay: Duration::ZERO,
            clock: Arc::new(clock),
        }
    }

    /// Handle on the same table scoped to another job kind.
    pub fn kind<S>(&self, kind: S) -> Self
    where
        S: Into<Cow<'static, str>>,
    {
        Self {
            kind: kind.into(),
            ..self.clone()
        }
    }

    /// Handle on the same table claiming under another worker id.
    pub fn worker_id(&self, worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..self.clone()
        }
    }

    pub fn heartbeat_interval(self, interval: Duration) -> Self {
        Self {
            heartbeat_interval: interval,
            ..self
        }
    }

    /// How long a retried job waits before it can be claimed again.
    pub fn retry_delay(self, delay: Duration) -> Self {
        Self {
            retry_delay: delay,
            ..self
        }
    }

    fn rows_of_kind<'t>(
        &self,
        table: &'t Table<T>,
    ) -> impl DoubleEndedIterator<Item = &'t Row<T>> + use<'t, T> {
        let kind = self.kind.clone();
        table.rows.values().filter(move |row| row.record.kind == kind)
    }

    fn row_mut<'t>(&self, table: &'t mut Table<T>, id: JobId) -> Result<&'t mut Row<T>, Error> {
        table
            .rows
            .get_mut(&id)
            .filter(|row| row.record.kind == self.kind)
            .ok_or_else(|| Error::not_found(id))
    }
}

pub struct MemoryContext<T> {
    id: JobId,
    lease: uuid::Uuid,
    table: Shared<T>,
    interval: Duration,
    retry_delay: Duration,
    clock: Arc<dyn Clock>,
}

impl<T> MemoryContext<T> {
    fn owned_row<'t>(&self, table: &'t mut Table<T>) -> Result<&'t mut Row<T>, Error> {
        table
            .rows
            .get_mut(&self.id)
            .filter(|row| row.owned_by(self.lease))
            .ok_or_else(|| Error::lost_lease(self.id))
    }
}

impl<T> BackEndContext for MemoryContext<T>
where
    T: Send + 'static,
{
    type Driver = MemoryDriver;

    fn job_id(&self) -> JobId {
        self.id
    }

    fn heartbeat_interval(&mut self) -> Duration {
        self.interval
    }

    async fn heartbeat(&mut self) -> Result<Heartbeat, Error> {
        let now = self.clock.now();
        let mut table = lock(&self.table);
        let Ok(row) = self.owned_row(&mut table) else {
            return Ok(Heartbeat::Lost);
        };
        row.record.last_heartbeat_at = Some(now);
        if row.record.cancel_requested {
            Ok(Heartbeat::CancelRequested)
        } else {
            Ok(Heartbeat::Continue)
        }
    }

    async fn complete(self) -> Result<(), Error> {
        let now = self.clock.now();
        let mut table = lock(&self.table);
        self.owned_row(&mut table)?.finish(JobState::Completed, now);
        Ok(())
    }

    async fn fail(self, message: String, retryable: bool) -> Result<JobState, Error> {
        let now = self.clock.now();
        let mut table = lock(&self.table);
        let row = self.owned_row(&mut table)?;

        let record = &mut row.record;
        record.failure_count += 1;
        record.failure_message = Some(message);
        let budget_left = record.failure_count < record.max_attempts;
        record.failure_kind = Some(match (retryable, budget_left) {
            (false, _) => FailureKind::Permanent,
            (true, true) => FailureKind::Retryable,
            (true, false) => FailureKind::RetriesExhausted,
        });

        let state = if record.cancel_requested {
            row.finish(JobState::Canceled, now);
            JobState::Canceled
        } else if retryable && budget_left {
            row.requeue(now, now + self.retry_delay);
            JobState::Queued
        } else {
            row.finish(JobState::Failed, now);
            JobState::Failed
        };
        Ok(state)
    }

    async fn cancel(self) -> Result<(), Error> {
        let now = self.clock.now();
        let mut table = lock(&self.table);
        self.owned_row(&mut table)?.finish(JobState::Canceled, now);
        Ok(())
    }
}

impl<T> BackEndPoller for MemoryBackEnd<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Driver = MemoryDriver;
    type Data = T;
    type Context = MemoryContext<T>;

    async fn poll_job(
        &mut self,
        batch_size: usize,
    ) -> Vec<Result<Job<JobRecord<T>, MemoryContext<T>>, Error>> {
        let now = self.clock.now();
        let mut table = lock(&self.table);

        let mut claimable = self
            .rows_of_kind(&table)
            .filter(|row| row.record.state == JobState::Queued && row.process_after <= now)
            .map(|row| (row.record.queued_at, row.record.id))
            .collect::<Vec<_>>();
        claimable.sort();
        claimable.truncate(batch_size);

        let mut jobs = Vec::with_capacity(claimable.len());
        for (_, id) in claimable {
            let Some(row) = table.rows.get_mut(&id) else {
                continue;
            };
            let lease = uuid::Uuid::new_v4();
            row.lease = Some(lease);
            row.record.state = JobState::Processing;
            row.record.started_at = Some(now);
            row.record.last_heartbeat_at = Some(now);
            row.record.worker_id = Some(self.worker_id.clone());

            let context = MemoryContext {
                id,
                lease,
                table: Arc::clone(&self.table),
                interval: self.heartbeat_interval,
                retry_delay: self.retry_delay,
                clock: Arc::clone(&self.clock),
            };
            jobs.push(Ok(Job::from_parts(row.record.clone(), context)));
        }
        jobs
    }
}

impl<T> JobStore for MemoryBackEnd<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Driver = MemoryDriver;
    type Data = T;

    async fn enqueue(&self, job: &InsertJob<T>) -> Result<JobId, Error> {
        let now = self.clock.now();
        let mut table = lock(&self.table);
        table.last_id += 1;
        let id = JobId(table.last_id);
        let record = JobRecord {
            id,
            kind: self.kind.to_string(),
            entity: job.entity.clone(),
            revision: job.revision.clone(),
            payload: job.data.clone(),
            state: JobState::Queued,
            cancel_requested: false,
            created_at: now,
            queued_at: now,
            started_at: None,
            finished_at: None,
            last_heartbeat_at: None,
            failure_count: 0,
            reset_count: 0,
            max_attempts: job.max_attempts,
            failure_message: None,
            failure_kind: None,
            worker_id: None,
            stats: Stats::default(),
        };
        table.rows.insert(
            id,
            Row {
                record,
                process_after: now + job.delay,
                lease: None,
            },
        );
        Ok(id)
    }

    async fn job(&self, id: JobId) -> Result<JobRecord<T>, Error> {
        let mut table = lock(&self.table);
        Ok(self.row_mut(&mut table, id)?.record.clone())
    }

    async fn cancel(&self, id: JobId) -> Result<JobState, Error> {
        let now = self.clock.now();
        let mut table = lock(&self.table);
        let row = self.row_mut(&mut table, id)?;
        match row.record.state {
            JobState::Queued => {
                row.record.cancel_requested = true;
                row.finish(JobState::Canceled, now);
            }
            JobState::Processing => row.record.cancel_requested = true,
            terminal => return Err(Error::invalid_state(id, terminal)),
        }
        Ok(row.record.state)
    }

    async fn list(&self, options: &ListOptions) -> Result<Vec<JobRecord<T>>, Error> {
        let table = lock(&self.table);
        let matching = self
            .rows_of_kind(&table)
            .map(|row| &row.record)
            .filter(|&record| options.matches(record));

        let after = options.after;
        let descending = options.descending;
        let mut records = matching
            .filter(|record| match after {
                None => true,
                Some(after) if descending => record.id < after,
                Some(after) => record.id > after,
            })
            .cloned()
            .collect::<Vec<_>>();
        if descending {
            records.reverse();
        }
        if let Some(first) = options.first {
            records.truncate(first);
        }
        Ok(records)
    }

    async fn count(&self, options: &ListOptions) -> Result<usize, Error> {
        let table = lock(&self.table);
        Ok(self
            .rows_of_kind(&table)
            .filter(|row| options.matches(&row.record))
            .count())
    }

    async fn last_job_for_revision(
        &self,
        entity: EntityId,
        revision: &str,
    ) -> Result<Option<JobRecord<T>>, Error> {
        let table = lock(&self.table);
        Ok(self
            .rows_of_kind(&table)
            .map(|row| &row.record)
            .filter(|record| record.entity.id == entity && record.revision == revision)
            .next_back()
            .cloned())
    }

    async fn last_completed_job(&self, entity: EntityId) -> Result<Option<JobRecord<T>>, Error> {
        let table = lock(&self.table);
        Ok(self
            .rows_of_kind(&table)
            .map(|row| &row.record)
            .filter(|record| record.entity.id == entity && record.state == JobState::Completed)
            .next_back()
            .cloned())
    }

    async fn stats(&self, id: JobId) -> Result<Stats, Error> {
        let mut table = lock(&self.table);
        Ok(self.row_mut(&mut table, id)?.record.stats.clone())
    }

    async fn merge_stats(&self, id: JobId, partial: &Stats) -> Result<Stats, Error> {
        let mut table = lock(&self.table);
        let stats = &mut self.row_mut(&mut table, id)?.record.stats;
        stats.merge(partial);
        Ok(stats.clone())
    }

    async fn activity(&self, entities: &[EntityId]) -> Result<Vec<EntityActivity>, Error> {
        let table = lock(&self.table);
        let mut latest: BTreeMap<EntityId, (JobId, SystemTime)> = BTreeMap::new();
        let mut active: BTreeMap<EntityId, bool> = BTreeMap::new();
        for record in self.rows_of_kind(&table).map(|row| &row.record) {
            // rows iterate in id order, so the last write is the newest job
            latest.insert(record.entity.id, (record.id, record.last_activity_at()));
            if !record.state.is_terminal() {
                active.insert(record.entity.id, true);
            }
        }
        Ok(entities
            .iter()
            .map(|entity| EntityActivity {
                entity: *entity,
                last_queued_at: latest.get(entity).map(|(_, at)| *at),
                has_active_job: active.get(entity).copied().unwrap_or(false),
            })
            .collect())
    }
}

impl<T> Reap for MemoryBackEnd<T>
where
    T: Send + Sync + 'static,
{
    type Driver = MemoryDriver;

    async fn reap_stale(
        &self,
        stale_after: Duration,
        max_resets: u32,
    ) -> Result<ReapReport, Error> {
        let now = self.clock.now();
        let mut table = lock(&self.table);
        let mut report = ReapReport::default();

        for row in table.rows.values_mut() {
            let record = &row.record;
            if record.kind != self.kind || record.state != JobState::Processing {
                continue;
            }
            let last_seen = record
                .last_heartbeat_at
                .or(record.started_at)
                .unwrap_or(record.queued_at);
            let stale = now
                .duration_since(last_seen)
                .is_ok_and(|age| age > stale_after);
            if !stale {
                continue;
            }

            if record.cancel_requested {
                row.finish(JobState::Canceled, now);
                report.canceled.push(row.record.id);
            } else if record.reset_count < max_resets {
                row.record.reset_count += 1;
                row.requeue(now, now);
                report.requeued.push(row.record.id);
            } else {
                row.record.failure_kind = Some(FailureKind::LostWorker);
                row.record.failure_message = Some(LOST_WORKER_MESSAGE.to_owned());
                row.finish(JobState::Failed, now);
                report.failed.push(row.record.id);
            }
        }
        Ok(report)
    }
}
