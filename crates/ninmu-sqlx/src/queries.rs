//! SQL text and row decoding for the `ninmu_job` table.
//!
//! Every state transition is one statement; `WHERE` clauses carry the
//! state and lease checks so a lost race shows up as zero rows.
use ninmu_core::{EntityId, EntityRef, FailureKind, JobId, JobRecord, JobState, Stats};
use serde::de::DeserializeOwned;

use crate::{Error, PgDateTime};

pub(crate) const INSERT_JOB: &str = r#"
INSERT INTO ninmu_job (kind, entity_id, entity_name, revision, payload, max_attempts, process_after)
VALUES ($1, $2, $3, $4, $5, $6, now() + $7::INTERVAL)
RETURNING id
"#;

pub(crate) const NOTIFY: &str = "SELECT pg_notify($1, $2)";

pub(crate) const CLAIM_JOBS: &str = r#"
WITH next AS (
    SELECT id
    FROM ninmu_job
    WHERE kind = $1 AND state = 'queued' AND process_after <= now()
    ORDER BY queued_at, id
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
UPDATE ninmu_job j
SET state = 'processing',
    started_at = now(),
    last_heartbeat_at = now(),
    worker_id = $3,
    lease_token = gen_random_uuid()
FROM next
WHERE j.id = next.id
RETURNING j.*
"#;

pub(crate) const HEARTBEAT: &str = r#"
UPDATE ninmu_job
SET last_heartbeat_at = now()
WHERE id = $1 AND lease_token = $2 AND state = 'processing'
RETURNING cancel_requested
"#;

pub(crate) const FINISH_OWNED: &str = r#"
UPDATE ninmu_job
SET state = $3, finished_at = now(), lease_token = NULL
WHERE id = $1 AND lease_token = $2 AND state = 'processing'
"#;

pub(crate) const FAIL_OWNED: &str = r#"
WITH owned AS (
    SELECT id,
           failure_count + 1 < max_attempts AS budget_left,
           CASE WHEN cancel_requested THEN 'canceled'
                WHEN $3::BOOLEAN AND failure_count + 1 < max_attempts THEN 'queued'
                ELSE 'failed'
           END AS next_state
    FROM ninmu_job
    WHERE id = $1 AND lease_token = $2 AND state = 'processing'
    FOR UPDATE
)
UPDATE ninmu_job j
SET state = owned.next_state,
    failure_count = j.failure_count + 1,
    failure_message = $4,
    failure_kind = CASE WHEN NOT $3::BOOLEAN THEN 'permanent'
                        WHEN owned.budget_left THEN 'retryable'
                        ELSE 'retries_exhausted'
                   END,
    queued_at = CASE WHEN owned.next_state = 'queued' THEN now() ELSE j.queued_at END,
    process_after = CASE WHEN owned.next_state = 'queued' THEN now() + $5::INTERVAL
                         ELSE j.process_after
                    END,
    started_at = CASE WHEN owned.next_state = 'queued' THEN NULL ELSE j.started_at END,
    last_heartbeat_at = CASE WHEN owned.next_state = 'queued' THEN NULL
                             ELSE j.last_heartbeat_at
                        END,
    worker_id = CASE WHEN owned.next_state = 'queued' THEN NULL ELSE j.worker_id END,
    finished_at = CASE WHEN owned.next_state = 'queued' THEN NULL ELSE now() END,
    lease_token = NULL
FROM owned
WHERE j.id = owned.id
RETURNING j.state
"#;

pub(crate) const REAP_STALE: &str = r#"
WITH stale AS (
    SELECT id,
           CASE WHEN cancel_requested THEN 'canceled'
                WHEN reset_count < $3 THEN 'queued'
                ELSE 'failed'
           END AS next_state
    FROM ninmu_job
    WHERE kind = $1
      AND state = 'processing'
      AND now() - COALESCE(last_heartbeat_at, started_at, queued_at) > $2::INTERVAL
    FOR UPDATE SKIP LOCKED
)
UPDATE ninmu_job j
SET state = stale.next_state,
    reset_count = j.reset_count + CASE WHEN stale.next_state = 'queued' THEN 1 ELSE 0 END,
    queued_at = CASE WHEN stale.next_state = 'queued' THEN now() ELSE j.queued_at END,
    process_after = CASE WHEN stale.next_state = 'queued' THEN now() ELSE j.process_after END,
    started_at = CASE WHEN stale.next_state = 'queued' THEN NULL ELSE j.started_at END,
    last_heartbeat_at = CASE WHEN stale.next_state = 'queued' THEN NULL
                             ELSE j.last_heartbeat_at
                        END,
    worker_id = CASE WHEN stale.next_state = 'queued' THEN NULL ELSE j.worker_id END,
    finished_at = CASE WHEN stale.next_state = 'queued' THEN NULL ELSE now() END,
    failure_message = CASE WHEN stale.next_state = 'failed' THEN $4 ELSE j.failure_message END,
    failure_kind = CASE WHEN stale.next_state = 'failed' THEN 'lost_worker' ELSE j.failure_kind END,
    lease_token = NULL
FROM stale
WHERE j.id = stale.id
RETURNING j.id, j.state
"#;

pub(crate) const REQUEST_CANCEL: &str = r#"
UPDATE ninmu_job
SET cancel_requested = TRUE,
    state = CASE WHEN state = 'queued' THEN 'canceled' ELSE state END,
    finished_at = CASE WHEN state = 'queued' THEN now() ELSE finished_at END
WHERE id = $1 AND kind = $2 AND state IN ('queued', 'processing')
RETURNING state
"#;

pub(crate) const JOB_STATE: &str = "SELECT state FROM ninmu_job WHERE id = $1 AND kind = $2";

pub(crate) const GET_JOB: &str = "SELECT * FROM ninmu_job WHERE id = $1 AND kind = $2";

pub(crate) const LIST_JOBS: &str = r#"
SELECT *
FROM ninmu_job
WHERE kind = $1
  AND ($2::TEXT IS NULL OR state = $2)
  AND ($3::TEXT IS NULL OR entity_name ILIKE $3 ESCAPE '\' OR revision ILIKE $3 ESCAPE '\')
  AND ($4::BIGINT IS NULL OR CASE WHEN $5::BOOLEAN THEN id < $4 ELSE id > $4 END)
ORDER BY CASE WHEN $5::BOOLEAN THEN id END DESC, id ASC
LIMIT $6
"#;

pub(crate) const COUNT_JOBS: &str = r#"
SELECT count(*)
FROM ninmu_job
WHERE kind = $1
  AND ($2::TEXT IS NULL OR state = $2)
  AND ($3::TEXT IS NULL OR entity_name ILIKE $3 ESCAPE '\' OR revision ILIKE $3 ESCAPE '\')
"#;

pub(crate) const LAST_JOB_FOR_REVISION: &str = r#"
SELECT *
FROM ninmu_job
WHERE kind = $1 AND entity_id = $2 AND revision = $3
ORDER BY id DESC
LIMIT 1
"#;

pub(crate) const LAST_COMPLETED_JOB: &str = r#"
SELECT *
FROM ninmu_job
WHERE kind = $1 AND entity_id = $2 AND state = 'completed'
ORDER BY id DESC
LIMIT 1
"#;

pub(crate) const GET_STATS: &str = "SELECT stats FROM ninmu_job WHERE id = $1 AND kind = $2";

pub(crate) const LOCK_STATS: &str =
    "SELECT stats FROM ninmu_job WHERE id = $1 AND kind = $2 FOR UPDATE";

pub(crate) const SET_STATS: &str = "UPDATE ninmu_job SET stats = $2 WHERE id = $1";

pub(crate) const ENTITY_ACTIVITY: &str = r#"
SELECT ids.entity_id,
       latest.activity_at,
       EXISTS (
           SELECT 1 FROM ninmu_job a
           WHERE a.kind = $1 AND a.entity_id = ids.entity_id AND a.state IN ('queued', 'processing')
       ) AS has_active_job
FROM UNNEST($2::BIGINT[]) WITH ORDINALITY AS ids(entity_id, ord)
LEFT JOIN LATERAL (
    SELECT GREATEST(j.queued_at, COALESCE(j.started_at, j.queued_at)) AS activity_at
    FROM ninmu_job j
    WHERE j.kind = $1 AND j.entity_id = ids.entity_id
    ORDER BY j.id DESC
    LIMIT 1
) latest ON TRUE
ORDER BY ids.ord
"#;

/// `%query%` for `ILIKE`, with the pattern metacharacters escaped.
pub(crate) fn like_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for c in query.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[derive(sqlx::FromRow, Debug)]
pub(crate) struct JobRow {
    pub id: i64,
    pub kind: String,
    pub entity_id: i64,
    pub entity_name: String,
    pub revision: String,
    pub payload: serde_json::Value,
    pub state: String,
    pub cancel_requested: bool,
    pub created_at: PgDateTime,
    pub queued_at: PgDateTime,
    pub started_at: Option<PgDateTime>,
    pub finished_at: Option<PgDateTime>,
    pub last_heartbeat_at: Option<PgDateTime>,
    pub failure_count: i32,
    pub reset_count: i32,
    pub max_attempts: i32,
    pub failure_message: Option<String>,
    pub failure_kind: Option<String>,
    pub worker_id: Option<String>,
    pub lease_token: Option<sqlx::types::Uuid>,
    pub stats: sqlx::types::Json<Stats>,
}

#[derive(sqlx::FromRow, Debug)]
pub(crate) struct ActivityRow {
    pub entity_id: i64,
    pub activity_at: Option<PgDateTime>,
    pub has_active_job: bool,
}

pub(crate) fn parse_state(state: &str) -> Result<JobState, Error> {
    state.parse().map_err(|error: ninmu_core::job::UnknownState| Error::decode(error.to_string()))
}

fn count(value: i32, column: &str) -> Result<u32, Error> {
    u32::try_from(value).map_err(|_| Error::decode(format!("negative {column}: {value}")))
}

impl JobRow {
    pub(crate) fn into_record<T>(self) -> Result<JobRecord<T>, Error>
    where
        T: DeserializeOwned,
    {
        let failure_kind = self
            .failure_kind
            .as_deref()
            .map(|kind| {
                FailureKind::parse(kind)
                    .ok_or_else(|| Error::decode(format!("unknown failure kind `{kind}`")))
            })
            .transpose()?;

        Ok(JobRecord {
            id: JobId(self.id),
            kind: self.kind,
            entity: EntityRef {
                id: EntityId(self.entity_id),
                name: self.entity_name,
            },
            revision: self.revision,
            payload: serde_json::from_value(self.payload)?,
            state: parse_state(&self.state)?,
            cancel_requested: self.cancel_requested,
            created_at: self.created_at.0,
            queued_at: self.queued_at.0,
            started_at: self.started_at.map(|at| at.0),
            finished_at: self.finished_at.map(|at| at.0),
            last_heartbeat_at: self.last_heartbeat_at.map(|at| at.0),
            failure_count: count(self.failure_count, "failure_count")?,
            reset_count: count(self.reset_count, "reset_count")?,
            max_attempts: count(self.max_attempts, "max_attempts")?,
            failure_message: self.failure_message,
            failure_kind,
            worker_id: self.worker_id,
            stats: self.stats.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_metacharacters() {
        assert_eq!(like_pattern("zoekt"), "%zoekt%");
        assert_eq!(like_pattern("100%_done\\"), "%100\\%\\_done\\\\%");
        assert_eq!(like_pattern(""), "%%");
    }

    #[test]
    fn unknown_state_is_a_decode_error() {
        let error = parse_state("paused").unwrap_err();
        assert_eq!(error.kind(), crate::ErrorKind::Decode);
        assert_eq!(parse_state("canceled").unwrap(), JobState::Canceled);
    }
}
