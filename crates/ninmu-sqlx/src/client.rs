//! Enqueue jobs and serve the read/cancel/stats operations API layers use.
use std::borrow::Cow;

use ninmu_core::{
    EntityActivity, EntityId, InsertJob, JobId, JobRecord, JobState, JobStore, ListOptions, Stats,
};
use serde::{Serialize, de::DeserializeOwned};

use crate::{Error, ErrorKind, backend::PostgresDriver, listener::ChannelData, queries};

/// A handle used to enqueue and inspect jobs of one kind.
#[derive(Debug)]
pub struct Client<T> {
    pool: sqlx::PgPool,
    kind: Cow<'static, str>,
    data_type: std::marker::PhantomData<fn() -> T>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            kind: self.kind.clone(),
            data_type: std::marker::PhantomData,
        }
    }
}

impl<T> Client<T> {
    /// Create a new client bound to the given connection pool.
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            kind: crate::DEFAULT_KIND.into(),
            data_type: std::marker::PhantomData,
        }
    }

    /// Specify the job kind used when inserting and reading jobs.
    pub fn kind<S>(self, kind: S) -> Self
    where
        S: Into<Cow<'static, str>>,
    {
        Self {
            kind: kind.into(),
            ..self
        }
    }

    fn notify_payload(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(&ChannelData {
            kind: self.kind.to_string(),
        })?)
    }
}

impl<T> Client<T>
where
    T: Serialize + Sync,
{
    /// Insert a job and wake listening workers.
    pub async fn insert(&self, job: &InsertJob<T>) -> Result<JobId, Error> {
        self.insert_tx(job, &self.pool).await
    }

    /// Insert a job using an existing transaction or connection. The
    /// notification is delivered when that transaction commits.
    pub async fn insert_tx<'c, A>(&self, job: &InsertJob<T>, tx: A) -> Result<JobId, Error>
    where
        A: sqlx::Acquire<'c, Database = sqlx::Postgres> + Send,
    {
        let mut conn = tx.acquire().await?;
        let id = self.insert_one(job, &mut *conn).await?;

        sqlx::query(queries::NOTIFY)
            .bind(crate::NOTIFY_CHANNEL_NAME)
            .bind(self.notify_payload()?)
            .execute(&mut *conn)
            .await?;

        Ok(id)
    }

    /// Insert several jobs in one transaction with a single notification.
    pub async fn insert_batch<'job, I>(&self, jobs: I) -> Result<Vec<JobId>, Error>
    where
        I: IntoIterator<Item = &'job InsertJob<T>> + Send,
        I::IntoIter: Send,
        T: 'job,
    {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::new();
        for job in jobs {
            ids.push(self.insert_one(job, &mut *tx).await?);
        }
        if !ids.is_empty() {
            sqlx::query(queries::NOTIFY)
                .bind(crate::NOTIFY_CHANNEL_NAME)
                .bind(self.notify_payload()?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(ids)
    }

    async fn insert_one(
        &self,
        job: &InsertJob<T>,
        conn: &mut sqlx::PgConnection,
    ) -> Result<JobId, Error> {
        let payload = serde_json::to_value(job.data())
            .map_err(|error| Error::new(ErrorKind::Encode, Box::new(error)))?;
        let delay = sqlx::postgres::types::PgInterval::try_from(job.delay_duration())
            .map_err(|e| Error::new(ErrorKind::Encode, e))?;
        let max_attempts = i32::try_from(job.attempts()).unwrap_or(i32::MAX);

        let id = sqlx::query_scalar::<_, i64>(queries::INSERT_JOB)
            .bind(self.kind.as_ref())
            .bind(job.entity().id.0)
            .bind(&job.entity().name)
            .bind(job.revision())
            .bind(payload)
            .bind(max_attempts)
            .bind(delay)
            .fetch_one(&mut *conn)
            .await?;

        tracing::trace!(job_id = id, kind = %self.kind, "enqueued job");
        Ok(JobId(id))
    }
}

impl<T> JobStore for Client<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Driver = PostgresDriver;
    type Data = T;

    async fn enqueue(&self, job: &InsertJob<T>) -> Result<JobId, Error> {
        self.insert(job).await
    }

    async fn job(&self, id: JobId) -> Result<JobRecord<T>, Error> {
        sqlx::query_as::<_, queries::JobRow>(queries::GET_JOB)
            .bind(id.0)
            .bind(self.kind.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(id))?
            .into_record()
    }

    async fn cancel(&self, id: JobId) -> Result<JobState, Error> {
        let state = sqlx::query_scalar::<_, String>(queries::REQUEST_CANCEL)
            .bind(id.0)
            .bind(self.kind.as_ref())
            .fetch_optional(&self.pool)
            .await?;
        if let Some(state) = state {
            return queries::parse_state(&state);
        }

        // Nothing changed: report why without touching the row.
        let current = sqlx::query_scalar::<_, String>(queries::JOB_STATE)
            .bind(id.0)
            .bind(self.kind.as_ref())
            .fetch_optional(&self.pool)
            .await?;
        match current {
            None => Err(Error::not_found(id)),
            Some(state) => Err(Error::invalid_state(id, queries::parse_state(&state)?)),
        }
    }

    async fn list(&self, options: &ListOptions) -> Result<Vec<JobRecord<T>>, Error> {
        let first = options.first.map(|first| i64::try_from(first).unwrap_or(i64::MAX));
        sqlx::query_as::<_, queries::JobRow>(queries::LIST_JOBS)
            .bind(self.kind.as_ref())
            .bind(options.state.map(JobState::as_str))
            .bind(text_filter(options))
            .bind(options.after.map(|after| after.0))
            .bind(options.descending)
            .bind(first)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(queries::JobRow::into_record)
            .collect()
    }

    async fn count(&self, options: &ListOptions) -> Result<usize, Error> {
        let count = sqlx::query_scalar::<_, i64>(queries::COUNT_JOBS)
            .bind(self.kind.as_ref())
            .bind(options.state.map(JobState::as_str))
            .bind(text_filter(options))
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn last_job_for_revision(
        &self,
        entity: EntityId,
        revision: &str,
    ) -> Result<Option<JobRecord<T>>, Error> {
        sqlx::query_as::<_, queries::JobRow>(queries::LAST_JOB_FOR_REVISION)
            .bind(self.kind.as_ref())
            .bind(entity.0)
            .bind(revision)
            .fetch_optional(&self.pool)
            .await?
            .map(queries::JobRow::into_record)
            .transpose()
    }

    async fn last_completed_job(&self, entity: EntityId) -> Result<Option<JobRecord<T>>, Error> {
        sqlx::query_as::<_, queries::JobRow>(queries::LAST_COMPLETED_JOB)
            .bind(self.kind.as_ref())
            .bind(entity.0)
            .fetch_optional(&self.pool)
            .await?
            .map(queries::JobRow::into_record)
            .transpose()
    }

    async fn stats(&self, id: JobId) -> Result<Stats, Error> {
        let stats = sqlx::query_scalar::<_, sqlx::types::Json<Stats>>(queries::GET_STATS)
            .bind(id.0)
            .bind(self.kind.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(id))?;
        Ok(stats.0)
    }

    async fn merge_stats(&self, id: JobId, partial: &Stats) -> Result<Stats, Error> {
        let mut tx = self.pool.begin().await?;
        let sqlx::types::Json(mut stats) =
            sqlx::query_scalar::<_, sqlx::types::Json<Stats>>(queries::LOCK_STATS)
                .bind(id.0)
                .bind(self.kind.as_ref())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| Error::not_found(id))?;

        stats.merge(partial);
        sqlx::query(queries::SET_STATS)
            .bind(id.0)
            .bind(sqlx::types::Json(&stats))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(stats)
    }

    async fn activity(&self, entities: &[EntityId]) -> Result<Vec<EntityActivity>, Error> {
        let ids = entities.iter().map(|entity| entity.0).collect::<Vec<_>>();
        let rows = sqlx::query_as::<_, queries::ActivityRow>(queries::ENTITY_ACTIVITY)
            .bind(self.kind.as_ref())
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| EntityActivity {
                entity: EntityId(row.entity_id),
                last_queued_at: row.activity_at.map(|at| at.0),
                has_active_job: row.has_active_job,
            })
            .collect())
    }
}

fn text_filter(options: &ListOptions) -> Option<String> {
    options
        .query
        .as_deref()
        .filter(|query| !query.is_empty())
        .map(queries::like_pattern)
}
