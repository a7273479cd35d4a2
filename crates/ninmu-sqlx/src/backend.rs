use std::borrow::Cow;
use std::time::Duration;

use futures::StreamExt as _;
use ninmu_core::{
    BackEndContext, BackEndDriver, BackEndPoller, Heartbeat, Job, JobId, JobRecord, JobState,
    Reap, ReapReport, job::LOST_WORKER_MESSAGE,
};
use serde::de::DeserializeOwned;

use crate::{Error, ErrorKind, Listener, queries};

pub struct PostgresDriver;
impl BackEndDriver for PostgresDriver {
    type Error = Error;
}

fn interval(duration: Duration) -> Result<sqlx::postgres::types::PgInterval, Error> {
    sqlx::postgres::types::PgInterval::try_from(duration)
        .map_err(|e| Error::new(ErrorKind::Encode, e))
}

/// `LIMIT` for a claim of `batch_size` jobs.
fn claim_limit(batch_size: usize) -> i64 {
    i64::try_from(batch_size).unwrap_or(i64::MAX)
}

/// Lease on one claimed job. Dropping it without finalizing leaves the job
/// to the reaper.
#[derive(Debug)]
pub struct PgContext {
    id: JobId,
    pool: sqlx::PgPool,
    lease_token: sqlx::types::Uuid,
    interval: Duration,
    retry_interval: sqlx::postgres::types::PgInterval,
}

impl PgContext {
    async fn finish(self, state: JobState) -> Result<(), Error> {
        let res = sqlx::query(queries::FINISH_OWNED)
            .bind(self.id.0)
            .bind(self.lease_token)
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;

        if res.rows_affected() == 0 {
            return Err(Error::lost_lease(self.id));
        }
        Ok(())
    }
}

impl BackEndContext for PgContext {
    type Driver = PostgresDriver;

    fn job_id(&self) -> JobId {
        self.id
    }

    fn heartbeat_interval(&mut self) -> Duration {
        self.interval
    }

    async fn heartbeat(&mut self) -> Result<Heartbeat, Error> {
        let cancel_requested = sqlx::query_scalar::<_, bool>(queries::HEARTBEAT)
            .bind(self.id.0)
            .bind(self.lease_token)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match cancel_requested {
            None => Heartbeat::Lost,
            Some(true) => Heartbeat::CancelRequested,
            Some(false) => Heartbeat::Continue,
        })
    }

    async fn complete(self) -> Result<(), Error> {
        self.finish(JobState::Completed).await
    }

    async fn fail(self, message: String, retryable: bool) -> Result<JobState, Error> {
        let state = sqlx::query_scalar::<_, String>(queries::FAIL_OWNED)
            .bind(self.id.0)
            .bind(self.lease_token)
            .bind(retryable)
            .bind(message)
            .bind(&self.retry_interval)
            .fetch_optional(&self.pool)
            .await?;

        match state {
            Some(state) => queries::parse_state(&state),
            None => Err(Error::lost_lease(self.id)),
        }
    }

    async fn cancel(self) -> Result<(), Error> {
        self.finish(JobState::Canceled).await
    }
}

/// Claims and reaps jobs of one kind from PostgreSQL.
#[derive(Debug)]
pub struct PgBackEnd<T> {
    pool: sqlx::PgPool,
    pub(crate) kind: Cow<'static, str>,
    worker_id: String,
    heartbeat_interval: Duration,
    retry_delay: Duration,
    marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Clone for PgBackEnd<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            kind: self.kind.clone(),
            worker_id: self.worker_id.clone(),
            heartbeat_interval: self.heartbeat_interval,
            retry_delay: self.retry_delay,
            marker: std::marker::PhantomData,
        }
    }
}

impl<T> PgBackEnd<T> {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            kind: Cow::Borrowed(crate::DEFAULT_KIND),
            worker_id: sqlx::types::Uuid::new_v4().to_string(),
            heartbeat_interval: ninmu_core::DEFAULT_HEARTBEAT_INTERVAL,
            retry_delay: crate::DEFAULT_RETRY_DELAY,
            marker: std::marker::PhantomData,
        }
    }

    /// Only claim and reap jobs of this kind.
    pub fn kind<S>(self, kind: S) -> Self
    where
        S: Into<Cow<'static, str>>,
    {
        Self {
            kind: kind.into(),
            ..self
        }
    }

    /// Identifier stamped on claimed jobs. Defaults to a random uuid.
    pub fn worker_id(self, worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..self
        }
    }

    pub fn heartbeat_interval(self, heartbeat_interval: Duration) -> Self {
        Self {
            heartbeat_interval,
            ..self
        }
    }

    pub fn retry_delay(self, retry_delay: Duration) -> Self {
        Self {
            retry_delay,
            ..self
        }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    pub async fn listener(&self) -> Result<Listener, sqlx::Error> {
        Listener::connect(&self.pool).await
    }
}

impl<T> BackEndPoller for PgBackEnd<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Driver = PostgresDriver;
    type Data = T;
    type Context = PgContext;

    async fn poll_job(
        &mut self,
        batch_size: usize,
    ) -> Vec<Result<Job<JobRecord<T>, PgContext>, Error>> {
        let retry_interval = match interval(self.retry_delay) {
            Ok(v) => v,
            Err(error) => return vec![Err(error)],
        };

        sqlx::query_as::<_, queries::JobRow>(queries::CLAIM_JOBS)
            .bind(self.kind.as_ref())
            .bind(claim_limit(batch_size))
            .bind(&self.worker_id)
            .fetch(&self.pool)
            .map(|res| -> Result<Job<JobRecord<T>, PgContext>, Error> {
                let row = res?;
                let lease_token = row
                    .lease_token
                    .ok_or_else(|| Error::decode("claimed job without lease token"))?;
                let record = row.into_record::<T>()?;
                let context = PgContext {
                    id: record.id,
                    pool: self.pool.clone(),
                    lease_token,
                    interval: self.heartbeat_interval,
                    retry_interval: retry_interval.clone(),
                };
                Ok(Job::from_parts(record, context))
            })
            .collect::<Vec<_>>()
            .await
    }
}

impl<T> Reap for PgBackEnd<T>
where
    T: Send + 'static,
{
    type Driver = PostgresDriver;

    async fn reap_stale(
        &self,
        stale_after: Duration,
        max_resets: u32,
    ) -> Result<ReapReport, Error> {
        let stale_after = interval(stale_after)?;
        let rows = sqlx::query_as::<_, (i64, String)>(queries::REAP_STALE)
            .bind(self.kind.as_ref())
            .bind(&stale_after)
            .bind(i32::try_from(max_resets).unwrap_or(i32::MAX))
            .bind(LOST_WORKER_MESSAGE)
            .fetch_all(&self.pool)
            .await?;

        let mut report = ReapReport::default();
        for (id, state) in rows {
            let id = JobId(id);
            match queries::parse_state(&state)? {
                JobState::Queued => report.requeued.push(id),
                JobState::Canceled => report.canceled.push(id),
                _ => report.failed.push(id),
            }
        }
        report.requeued.sort();
        report.failed.sort();
        report.canceled.sort();
        Ok(report)
    }
}
