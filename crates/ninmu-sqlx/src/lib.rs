//! PostgreSQL storage for ninmu jobs.
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so any number of worker processes
//! can share one table. Enqueues publish on a NOTIFY channel that a
//! [`Listener`] turns into worker wake-ups.
pub use ninmu_core;
pub use sqlx::PgPool;

pub mod backend;
pub mod client;
mod error;
pub mod listener;
mod queries;

pub use backend::{PgBackEnd, PgContext};
pub use listener::{Listener, Wakeups, WorkerWithListenerExt};
pub use client::Client;
pub use error::{Error, ErrorKind};

const DEFAULT_KIND: &str = "ninmu_default";
const NOTIFY_CHANNEL_NAME: &str = "ninmu_jobs";

/// Default delay before a retried job becomes claimable again.
pub const DEFAULT_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(15);

/// Apply the bundled schema migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// `SystemTime` as a PostgreSQL `timestamptz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PgDateTime(pub std::time::SystemTime);

/// TIMESTAMPTZ is stored as microseconds since `2000-01-01 00:00:00 UTC`,
/// which is this far after the UNIX epoch.
/// https://www.postgresql.org/docs/current/protocol-logicalrep-message-formats.html
const POSTGRESQL_EPOCH_DURATION: std::time::Duration = std::time::Duration::from_secs(946684800);

fn postgres_epoch() -> std::time::SystemTime {
    std::time::SystemTime::UNIX_EPOCH + POSTGRESQL_EPOCH_DURATION
}

const OUT_OF_RANGE_MESSAGE: &str = "timestamp out of range for PostgreSQL i64 micros";

impl PgDateTime {
    fn to_pg_micros(self) -> Result<i64, &'static str> {
        match self.0.duration_since(postgres_epoch()) {
            Ok(d) => i64::try_from(d.as_micros()).map_err(|_| OUT_OF_RANGE_MESSAGE),
            Err(e) => i64::try_from(e.duration().as_micros())
                .map(|v| -v)
                .map_err(|_| OUT_OF_RANGE_MESSAGE),
        }
    }

    fn from_pg_micros(micros: i64) -> Result<Self, &'static str> {
        let offset = std::time::Duration::from_micros(micros.unsigned_abs());
        let at = if micros >= 0 {
            postgres_epoch().checked_add(offset)
        } else {
            postgres_epoch().checked_sub(offset)
        };
        at.map(Self).ok_or(OUT_OF_RANGE_MESSAGE)
    }
}

impl sqlx::Type<sqlx::Postgres> for PgDateTime {
    fn type_info() -> <sqlx::Postgres as sqlx::Database>::TypeInfo {
        // https://github.com/postgres/postgres/blob/master/src/include/catalog/pg_type.dat#L306-L311
        sqlx::postgres::PgTypeInfo::with_name("timestamptz")
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for PgDateTime {
    fn encode_by_ref(
        &self,
        buf: &mut <sqlx::Postgres as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        let pg_us = self.to_pg_micros()?;
        sqlx::Encode::<sqlx::Postgres>::encode(pg_us, buf)
    }

    fn size_hint(&self) -> usize {
        std::mem::size_of::<i64>()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for PgDateTime {
    fn decode(
        value: <sqlx::Postgres as sqlx::Database>::ValueRef<'r>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let pg_us = <i64 as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(Self::from_pg_micros(pg_us)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn postgres_epoch_is_zero_micros() {
        assert_eq!(PgDateTime(postgres_epoch()).to_pg_micros(), Ok(0));
        assert_eq!(PgDateTime::from_pg_micros(0), Ok(PgDateTime(postgres_epoch())));
    }

    #[test]
    fn micros_convert_both_sides_of_epoch() {
        let later = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let micros = PgDateTime(later).to_pg_micros().unwrap();
        assert_eq!(micros, (1_700_000_000 - 946_684_800) * 1_000_000);
        assert_eq!(PgDateTime::from_pg_micros(micros), Ok(PgDateTime(later)));

        let micros = PgDateTime(SystemTime::UNIX_EPOCH).to_pg_micros().unwrap();
        assert_eq!(micros, -946_684_800 * 1_000_000);
        assert_eq!(
            PgDateTime::from_pg_micros(micros),
            Ok(PgDateTime(SystemTime::UNIX_EPOCH))
        );
    }
}
