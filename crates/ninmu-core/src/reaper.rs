//! Heartbeat reaper: the only recovery path for jobs whose worker died.
//!
//! Runs on its own tick, independent of any worker. A failed scan is logged
//! and retried on the next tick.
use std::time::Duration;

use futures::{FutureExt as _, Stream, StreamExt as _};

use crate::{
    DEFAULT_HEARTBEAT_INTERVAL,
    backend::{BackEndDriver, Reap, ReapReport},
    utils::Ticker,
};

/// Builder for [`Reaper`].
pub struct ReaperBuilder<Tick = Ticker> {
    tick: Tick,
    stale_after: Duration,
    max_resets: u32,
}

impl ReaperBuilder {
    pub const DEFAULT_MAX_RESETS: u32 = 5;

    /// Scan every `interval`.
    pub fn new(interval: Duration) -> ReaperBuilder<Ticker> {
        Self::new_with_tick(Ticker::new(interval))
    }

    /// Drive scans from a custom tick stream.
    pub fn new_with_tick<Tick>(tick: Tick) -> ReaperBuilder<Tick> {
        ReaperBuilder {
            tick,
            stale_after: DEFAULT_HEARTBEAT_INTERVAL * 3,
            max_resets: Self::DEFAULT_MAX_RESETS,
        }
    }
}

impl<Tick> ReaperBuilder<Tick> {
    /// A processing job is stale once its last heartbeat is older than this.
    pub fn stale_after(self, stale_after: Duration) -> Self {
        Self {
            stale_after,
            ..self
        }
    }

    /// How many times a stale job is requeued before it fails as lost.
    pub fn max_resets(self, max_resets: u32) -> Self {
        Self { max_resets, ..self }
    }

    pub fn build<Store>(self, store: Store) -> Reaper<Tick, Store>
    where
        Store: Reap,
    {
        Reaper {
            tick: self.tick,
            scan: Scan {
                store,
                stale_after: self.stale_after,
                max_resets: self.max_resets,
            },
        }
    }
}

struct Scan<Store> {
    store: Store,
    stale_after: Duration,
    max_resets: u32,
}

impl<Store> Scan<Store>
where
    Store: Reap + Sync,
{
    async fn once(&self) -> Result<ReapReport, <Store::Driver as BackEndDriver>::Error> {
        let report = self.store.reap_stale(self.stale_after, self.max_resets).await?;
        if !report.is_empty() {
            tracing::info!(
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                canceled = report.canceled.len(),
                "reclaimed stale jobs"
            );
        }
        for id in &report.failed {
            tracing::warn!(job_id = %id, "job failed after exhausting its reset budget");
        }
        Ok(report)
    }
}

pub struct Reaper<Tick, Store> {
    tick: Tick,
    scan: Scan<Store>,
}

impl<Tick, Store> Reaper<Tick, Store>
where
    Store: Reap + Sync,
{
    pub fn store_ref(&self) -> &Store {
        &self.scan.store
    }

    /// One scan, outside the loop.
    pub async fn reap_once(&self) -> Result<ReapReport, <Store::Driver as BackEndDriver>::Error> {
        self.scan.once().await
    }
}

impl<Tick, Store> Reaper<Tick, Store>
where
    Tick: Stream<Item = ()> + Send,
    Store: Reap + Sync,
{
    /// Scan until the tick stream ends (or forever).
    pub fn run(self) -> impl Future<Output = ()> + Send {
        run_reaper(self.tick, self.scan, std::future::pending::<()>())
    }

    /// Scan until `signal` resolves. A scan in progress finishes first.
    pub fn with_graceful_shutdown<Signal>(self, signal: Signal) -> impl Future<Output = ()> + Send
    where
        Signal: Future<Output = ()> + Send,
    {
        run_reaper(self.tick, self.scan, signal)
    }
}

async fn run_reaper<Tick, Store, Signal>(tick: Tick, scan: Scan<Store>, signal: Signal)
where
    Tick: Stream<Item = ()> + Send,
    Store: Reap + Sync,
    Signal: Future<Output = ()> + Send,
{
    futures::pin_mut!(tick);
    futures::pin_mut!(signal);
    let mut tick = tick.fuse();
    let mut signal = signal.fuse();
    loop {
        futures::select! {
            tick_val = tick.next() => {
                if tick_val.is_none() { break; }
                if let Err(error) = scan.once().await {
                    tracing::error!(error = %error, "Failed to reap stale jobs");
                }
            },
            _ = signal => {
                tracing::debug!("reaper received graceful shutdown signal");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BackEndPoller, InsertJob, JobState, JobStore, ManualClock, MemoryBackEnd,
        job::{EntityRef, FailureKind, LOST_WORKER_MESSAGE},
    };

    #[tokio::test]
    async fn reap_once_applies_configured_budget() {
        let clock = ManualClock::default();
        let mut store = MemoryBackEnd::<()>::with_clock(clock.clone());
        let id = store
            .enqueue(&InsertJob::new(EntityRef::new(1, "github.com/a/b"), "r1", ()))
            .await
            .unwrap();
        let reaper = ReaperBuilder::new(Duration::from_secs(60))
            .stale_after(Duration::from_secs(30))
            .max_resets(1)
            .build(store.clone());

        let _ = store.poll_job(1).await;
        clock.advance(Duration::from_secs(31));
        assert_eq!(reaper.reap_once().await.unwrap().requeued, vec![id]);

        let _ = store.poll_job(1).await;
        clock.advance(Duration::from_secs(31));
        assert_eq!(reaper.reap_once().await.unwrap().failed, vec![id]);

        let job = store.job(id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.reset_count, 1);
        assert_eq!(job.failure_kind, Some(FailureKind::LostWorker));
        assert_eq!(job.failure_message.as_deref(), Some(LOST_WORKER_MESSAGE));
    }

    #[tokio::test]
    async fn loop_stops_when_tick_stream_ends() {
        let clock = ManualClock::default();
        let mut store = MemoryBackEnd::<()>::with_clock(clock.clone());
        let id = store
            .enqueue(&InsertJob::new(EntityRef::new(1, "github.com/a/b"), "r1", ()))
            .await
            .unwrap();
        let _ = store.poll_job(1).await;
        clock.advance(Duration::from_secs(3600));

        ReaperBuilder::new_with_tick(futures::stream::iter([()]))
            .build(store.clone())
            .run()
            .await;

        let job = store.job(id).await.unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.reset_count, 1);
    }
}
