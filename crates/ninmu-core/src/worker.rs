//! Dispatcher: a fixed number of slots, each running one leased job.
//!
//! Every tick the worker claims at most as many jobs as it has free slots,
//! so a saturated pool stops claiming instead of buffering work. Each claim
//! is tracked by job id until its attempt settles. An attempt heartbeats
//! while the handler runs and then records exactly one outcome, unless the
//! lease was lost, in which case it writes nothing.
//!
//! A panicking handler is caught and recorded as a retryable failure; it
//! never takes the other slots down with it.
use std::any::Any;
use std::collections::BTreeSet;
use std::future::Pending;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt as _, Stream, StreamExt as _};
use tracing::Instrument as _;

use crate::{
    JobHandler, JobResult,
    backend::{BackEndContext, BackEndPoller, Heartbeat},
    cancel::Cancel,
    job::{JobId, JobRecord, JobState},
    utils::Ticker,
};

/// Slots a worker runs unless configured otherwise.
pub const DEFAULT_SLOTS: usize = 5;

/// Where attempts execute.
///
/// A handle resolves to `None` when the attempt never ran to completion
/// (the task was aborted or panicked outside the handler).
pub trait JobSpawner: Send {
    type Handle<T>: Future<Output = Option<T>> + Send + 'static
    where
        T: Send + 'static;

    fn spawn<Fut>(&self, attempt: Fut) -> Self::Handle<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static;
}

/// Drives attempts on the worker's own task. They interleave at await
/// points, so a handler that blocks the thread stalls every slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineSpawner;

impl JobSpawner for InlineSpawner {
    type Handle<T>
        = BoxFuture<'static, Option<T>>
    where
        T: Send + 'static;

    fn spawn<Fut>(&self, attempt: Fut) -> Self::Handle<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        attempt.map(Some).boxed()
    }
}

/// How one claimed job ended, from the worker's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    /// The outcome was persisted and the job landed in this state.
    Recorded(JobState),
    /// A heartbeat found the lease gone; nothing was written.
    Abandoned,
    /// Writing the outcome failed; the reaper will pick the job up.
    Unrecorded,
}

pub struct Worker<Tick, Poller, F, M, Sp = InlineSpawner, Signal = Pending<()>>
where
    F: JobHandler<M>,
{
    tick: Tick,
    poller: Poller,
    handler: F,
    context: F::Context,
    slots: usize,
    spawner: Sp,
    signal: Signal,
    marker: std::marker::PhantomData<fn() -> M>,
}

impl<Tick, Poller, F, M, Sp, Signal> Worker<Tick, Poller, F, M, Sp, Signal>
where
    F: JobHandler<M>,
{
    pub fn backend_ref(&self) -> &Poller {
        &self.poller
    }

    /// Rebuild the tick stream, e.g. to merge in enqueue notifications.
    pub fn map_tick<Tick2>(
        self,
        f: impl FnOnce(Tick) -> Tick2,
    ) -> Worker<Tick2, Poller, F, M, Sp, Signal> {
        Worker {
            tick: f(self.tick),
            poller: self.poller,
            handler: self.handler,
            context: self.context,
            slots: self.slots,
            spawner: self.spawner,
            signal: self.signal,
            marker: std::marker::PhantomData,
        }
    }

    /// Stop claiming once `signal` resolves; attempts already running finish
    /// first. A process that dies mid-drain leaves its jobs to the reaper.
    pub fn with_graceful_shutdown<Signal2>(
        self,
        signal: Signal2,
    ) -> Worker<Tick, Poller, F, M, Sp, Signal2>
    where
        Signal2: Future<Output = ()> + Send,
    {
        Worker {
            tick: self.tick,
            poller: self.poller,
            handler: self.handler,
            context: self.context,
            slots: self.slots,
            spawner: self.spawner,
            signal,
            marker: std::marker::PhantomData,
        }
    }
}

impl<Tick, Poller, F, M, Sp, Signal> Worker<Tick, Poller, F, M, Sp, Signal>
where
    Tick: Stream<Item = ()> + Send,
    F: JobHandler<M>,
    F::Context: Clone,
    M: 'static,
    Poller: BackEndPoller<Data = F::Data>,
    Sp: JobSpawner,
    Signal: Future<Output = ()> + Send,
{
    /// Dispatch until the tick stream ends or the shutdown signal fires,
    /// then wait for in-flight attempts.
    pub fn run(self) -> impl Future<Output = ()> + Send {
        dispatch(self)
    }
}

async fn dispatch<Tick, Poller, F, M, Sp, Signal>(worker: Worker<Tick, Poller, F, M, Sp, Signal>)
where
    Tick: Stream<Item = ()> + Send,
    F: JobHandler<M>,
    F::Context: Clone,
    M: 'static,
    Poller: BackEndPoller<Data = F::Data>,
    Sp: JobSpawner,
    Signal: Future<Output = ()> + Send,
{
    let Worker {
        tick,
        mut poller,
        handler,
        context,
        slots,
        spawner,
        signal,
        marker: _,
    } = worker;

    let mut tick = pin!(tick.fuse());
    let mut signal = pin!(signal.fuse());
    let mut running = futures::stream::FuturesUnordered::new();
    let mut leased = BTreeSet::<JobId>::new();

    loop {
        futures::select! {
            beat = tick.next() => {
                if beat.is_none() {
                    tracing::debug!("tick stream ended");
                    break;
                }
                let free = slots.saturating_sub(leased.len());
                if free == 0 {
                    tracing::trace!(slots, "all slots busy");
                    continue;
                }

                for claimed in poller.poll_job(free).await {
                    let (record, lease) = match claimed {
                        Ok(job) => job.split_parts(),
                        Err(error) => {
                            tracing::error!(error = %error, "Failed to claim job");
                            continue;
                        }
                    };
                    let id = record.id;
                    leased.insert(id);

                    let span = tracing::debug_span!("job", job_id = %id, kind = %record.kind);
                    let attempt = run_attempt(record, lease, handler.clone(), context.clone())
                        .instrument(span);
                    running.push(spawner.spawn(attempt).map(move |settled| (id, settled)));
                }
            },
            done = running.next() => {
                if let Some((id, settled)) = done {
                    leased.remove(&id);
                    report(id, settled);
                }
            },
            () = signal => {
                tracing::debug!(in_flight = leased.len(), "shutdown requested, draining");
                break;
            }
        }
    }

    while let Some((id, settled)) = running.next().await {
        leased.remove(&id);
        report(id, settled);
    }
}

fn report(id: JobId, settled: Option<Settled>) {
    match settled {
        Some(Settled::Recorded(state)) => {
            tracing::debug!(job_id = %id, state = %state, "job settled")
        }
        Some(Settled::Abandoned) => {
            tracing::debug!(job_id = %id, "job abandoned after losing its lease")
        }
        Some(Settled::Unrecorded) => tracing::warn!(job_id = %id, "job outcome not recorded"),
        None => tracing::error!(job_id = %id, "job task ended without settling"),
    }
}

/// One attempt: run the handler with heartbeats, then record the outcome.
async fn run_attempt<F, M, Lease>(
    record: JobRecord<F::Data>,
    mut lease: Lease,
    handler: F,
    context: F::Context,
) -> Settled
where
    F: JobHandler<M>,
    Lease: BackEndContext,
{
    let cancel = Cancel::new();
    let every = lease.heartbeat_interval();

    tracing::trace!("handler started");
    let outcome = {
        let attempt = AssertUnwindSafe(handler.call(record, context, cancel.clone()));
        let mut attempt = pin!(attempt.catch_unwind().fuse());
        let mut heartbeats = pin!(Ticker::new(every).fuse());

        loop {
            futures::select! {
                caught = attempt => break caught.unwrap_or_else(|panic| panicked(&*panic)),
                _ = heartbeats.next() => match lease.heartbeat().await {
                    Ok(Heartbeat::Continue) => {}
                    Ok(Heartbeat::CancelRequested) => {
                        if !cancel.is_canceled() {
                            tracing::debug!("cancellation requested");
                            cancel.cancel();
                        }
                    }
                    Ok(Heartbeat::Lost) => {
                        tracing::warn!("lost the lease, abandoning the attempt");
                        cancel.cancel();
                        return Settled::Abandoned;
                    }
                    Err(error) => tracing::error!(error = %error, "Failed to heartbeat job"),
                },
            }
        }
    };
    tracing::trace!("handler finished");

    record_outcome(lease, outcome).await
}

fn panicked(panic: &(dyn Any + Send)) -> JobResult {
    let reason = panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    tracing::error!(panic = reason, "job handler panicked");
    JobResult::retry(format!("handler panicked: {reason}"))
}

async fn record_outcome<Lease>(lease: Lease, outcome: JobResult) -> Settled
where
    Lease: BackEndContext,
{
    let recorded = match outcome {
        JobResult::Complete => lease.complete().await.map(|()| JobState::Completed),
        JobResult::Retry(message) => lease.fail(message, true).await,
        JobResult::Fail(message) => lease.fail(message, false).await,
        JobResult::Canceled => lease.cancel().await.map(|()| JobState::Canceled),
    };
    match recorded {
        Ok(state) => Settled::Recorded(state),
        Err(error) => {
            tracing::error!(error = %error, "Failed to record job outcome");
            Settled::Unrecorded
        }
    }
}

/// Configures slots, tick and spawner, then binds a backend and handler.
pub struct WorkerBuilder<Tick = Ticker, Sp = InlineSpawner> {
    tick: Tick,
    slots: usize,
    spawner: Sp,
}

impl WorkerBuilder {
    /// Poll every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self::new_with_tick(Ticker::new(interval))
    }

    /// Poll whenever `tick` yields.
    pub fn new_with_tick<Tick>(tick: Tick) -> WorkerBuilder<Tick> {
        WorkerBuilder {
            tick,
            slots: DEFAULT_SLOTS,
            spawner: InlineSpawner,
        }
    }
}

impl<Tick, Sp> WorkerBuilder<Tick, Sp> {
    /// Maximum number of attempts in flight. At least one.
    pub fn concurrent(self, slots: usize) -> Self {
        Self {
            slots: slots.max(1),
            ..self
        }
    }

    pub fn job_spawner<Sp2>(self, spawner: Sp2) -> WorkerBuilder<Tick, Sp2>
    where
        Sp2: JobSpawner,
    {
        WorkerBuilder {
            tick: self.tick,
            slots: self.slots,
            spawner,
        }
    }

    /// Bind a backend and a handler that takes no shared context.
    pub fn build<Poller, F, M>(self, poller: Poller, handler: F) -> Worker<Tick, Poller, F, M, Sp>
    where
        F: JobHandler<M, Context = ()>,
        Poller: BackEndPoller<Data = F::Data>,
    {
        self.build_with_context(poller, handler, ())
    }

    /// Bind a backend, a handler and the context cloned into each attempt.
    pub fn build_with_context<Poller, F, M>(
        self,
        poller: Poller,
        handler: F,
        context: F::Context,
    ) -> Worker<Tick, Poller, F, M, Sp>
    where
        F: JobHandler<M>,
        Poller: BackEndPoller<Data = F::Data>,
    {
        Worker {
            tick: self.tick,
            poller,
            handler,
            context,
            slots: self.slots,
            spawner: self.spawner,
            signal: std::future::pending(),
            marker: std::marker::PhantomData,
        }
    }
}
