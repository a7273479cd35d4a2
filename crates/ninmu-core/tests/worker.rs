use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ninmu_core::{
    Cancel, EntityRef, FailureKind, InsertJob, JobData, JobId, JobRecord, JobResult, JobState,
    JobStore as _, ManualClock, MemoryBackEnd, ReaperBuilder, WorkerBuilder, WorkerContext,
};

const TICK: Duration = Duration::from_millis(5);

type Gauges = (Arc<AtomicUsize>, Arc<AtomicUsize>);

fn repo(id: i64) -> EntityRef {
    EntityRef::new(id, format!("github.com/sourcegraph/repo{id}"))
}

fn signal(cancel: &Cancel) -> impl Future<Output = ()> + Send + 'static {
    let cancel = cancel.clone();
    async move { cancel.canceled().await }
}

/// Poll the store until the job satisfies `done`, then trip `stop`.
async fn wait_for<T>(
    store: &MemoryBackEnd<T>,
    id: JobId,
    stop: &Cancel,
    done: impl Fn(&JobRecord<T>) -> bool,
) -> JobRecord<T>
where
    T: Clone + Send + Sync + 'static,
{
    loop {
        let job = store.job(id).await.unwrap();
        if done(&job) {
            stop.cancel();
            return job;
        }
        tokio::time::sleep(TICK).await;
    }
}

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("test timed out")
}

#[tokio::test]
async fn completes_every_job_with_bounded_concurrency() {
    let store = MemoryBackEnd::<u32>::new();
    let mut ids = Vec::new();
    for n in 0..6 {
        ids.push(store.enqueue(&InsertJob::new(repo(n.into()), "HEAD", n)).await.unwrap());
    }

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handler = |JobData(_job): JobData<u32>, WorkerContext(gauges): WorkerContext<Gauges>| {
        let (running, peak) = gauges;
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            JobResult::Complete
        }
    };

    let stop = Cancel::new();
    let worker = WorkerBuilder::new(TICK)
        .concurrent(2)
        .build_with_context(store.clone(), handler, (running.clone(), peak.clone()))
        .with_graceful_shutdown(signal(&stop));

    let last = *ids.last().unwrap();
    within(async {
        tokio::join!(
            worker.run(),
            wait_for(&store, last, &stop, |job| job.state.is_terminal())
        )
    })
    .await;

    for id in ids {
        assert_eq!(store.job(id).await.unwrap().state, JobState::Completed);
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn retryable_errors_exhaust_the_attempt_budget() {
    let store = MemoryBackEnd::<()>::new();
    let id = store
        .enqueue(&InsertJob::new(repo(1), "HEAD", ()).max_attempts(3))
        .await
        .unwrap();

    let stop = Cancel::new();
    let handler = || async { JobResult::from(Err::<(), _>("index server unavailable")) };
    let worker = WorkerBuilder::new(TICK)
        .build(store.clone(), handler)
        .with_graceful_shutdown(signal(&stop));

    let (_, job) = within(async {
        tokio::join!(
            worker.run(),
            wait_for(&store, id, &stop, |job| job.state.is_terminal())
        )
    })
    .await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure_count, 3);
    assert_eq!(job.failure_kind, Some(FailureKind::RetriesExhausted));
    assert_eq!(job.failure_message.as_deref(), Some("index server unavailable"));
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let store = MemoryBackEnd::<()>::new();
    let id = store.enqueue(&InsertJob::new(repo(1), "HEAD", ())).await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let stop = Cancel::new();
    let handler = |WorkerContext(calls): WorkerContext<Arc<AtomicUsize>>| async move {
        calls.fetch_add(1, Ordering::SeqCst);
        JobResult::fail("repository is empty")
    };
    let worker = WorkerBuilder::new(TICK)
        .build_with_context(store.clone(), handler, calls.clone())
        .with_graceful_shutdown(signal(&stop));

    let (_, job) = within(async {
        tokio::join!(
            worker.run(),
            wait_for(&store, id, &stop, |job| job.state.is_terminal())
        )
    })
    .await;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::Permanent));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancel_request_reaches_running_handler() {
    let store = MemoryBackEnd::<()>::new().heartbeat_interval(Duration::from_millis(10));
    let id = store.enqueue(&InsertJob::new(repo(1), "HEAD", ())).await.unwrap();

    let stop = Cancel::new();
    let handler = |JobData(_job): JobData<()>, cancel: Cancel| async move {
        cancel.canceled().await;
        JobResult::Canceled
    };
    let worker = WorkerBuilder::new(TICK)
        .build(store.clone(), handler)
        .with_graceful_shutdown(signal(&stop));

    let (_, job) = within(async {
        tokio::join!(worker.run(), async {
            let never = Cancel::new();
            wait_for(&store, id, &never, |job| job.state == JobState::Processing).await;
            assert_eq!(store.cancel(id).await.unwrap(), JobState::Processing);
            wait_for(&store, id, &stop, |job| job.state.is_terminal()).await
        })
    })
    .await;

    assert_eq!(job.state, JobState::Canceled);
    assert!(job.cancel_requested);
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn lost_lease_abandons_the_attempt() {
    let clock = ManualClock::default();
    let store = MemoryBackEnd::<()>::with_clock(clock.clone())
        .heartbeat_interval(Duration::from_millis(10));
    let id = store.enqueue(&InsertJob::new(repo(1), "HEAD", ())).await.unwrap();
    let reaper = ReaperBuilder::new(Duration::from_secs(3600))
        .stale_after(Duration::from_secs(30))
        .build(store.clone());

    let stop = Cancel::new();
    let handler = |JobData(job): JobData<()>, cancel: Cancel| async move {
        if job.reset_count == 0 {
            // First attempt hangs until the worker notices it lost the job.
            cancel.canceled().await;
        }
        JobResult::Complete
    };
    let worker = WorkerBuilder::new(TICK)
        .build(store.clone(), handler)
        .with_graceful_shutdown(signal(&stop));

    let (_, job) = within(async {
        tokio::join!(worker.run(), async {
            let never = Cancel::new();
            wait_for(&store, id, &never, |job| job.state == JobState::Processing).await;
            clock.advance(Duration::from_secs(31));
            assert_eq!(reaper.reap_once().await.unwrap().requeued, vec![id]);
            wait_for(&store, id, &stop, |job| job.state.is_terminal()).await
        })
    })
    .await;

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.reset_count, 1);
}

#[tokio::test]
async fn graceful_shutdown_drains_in_flight_jobs() {
    let store = MemoryBackEnd::<()>::new();
    let id = store.enqueue(&InsertJob::new(repo(1), "HEAD", ())).await.unwrap();
    let queued = store.enqueue(&InsertJob::new(repo(2), "HEAD", ())).await.unwrap();

    let stop = Cancel::new();
    let handler = || async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        JobResult::Complete
    };
    let worker = WorkerBuilder::new(TICK)
        .concurrent(1)
        .build(store.clone(), handler)
        .with_graceful_shutdown(signal(&stop));

    within(async {
        tokio::join!(
            worker.run(),
            wait_for(&store, id, &stop, |job| job.state == JobState::Processing)
        )
    })
    .await;

    // Shutdown was requested mid-job: that job finished, nothing new started.
    assert_eq!(store.job(id).await.unwrap().state, JobState::Completed);
    assert_eq!(store.job(queued).await.unwrap().state, JobState::Queued);
}

#[tokio::test]
async fn worker_stops_when_tick_stream_ends() {
    let store = MemoryBackEnd::<()>::new();
    let id = store.enqueue(&InsertJob::new(repo(1), "HEAD", ())).await.unwrap();

    WorkerBuilder::new_with_tick(futures::stream::iter([()]))
        .build(store.clone(), || async { JobResult::Complete })
        .run()
        .await;

    assert_eq!(store.job(id).await.unwrap().state, JobState::Completed);
}

#[tokio::test]
async fn panicking_handler_does_not_take_the_worker_down() {
    let store = MemoryBackEnd::<u32>::new();
    let doomed = store
        .enqueue(&InsertJob::new(repo(1), "HEAD", 0).max_attempts(1))
        .await
        .unwrap();
    let healthy = store.enqueue(&InsertJob::new(repo(2), "HEAD", 1)).await.unwrap();

    let handler = |JobData(job): JobData<u32>| async move {
        if job.payload == 0 {
            panic!("boom");
        }
        JobResult::Complete
    };
    let stop = Cancel::new();
    let worker = WorkerBuilder::new(TICK)
        .concurrent(1)
        .build(store.clone(), handler)
        .with_graceful_shutdown(signal(&stop));

    let (_, job) = within(async {
        tokio::join!(
            worker.run(),
            wait_for(&store, healthy, &stop, |job| job.state.is_terminal())
        )
    })
    .await;

    assert_eq!(job.state, JobState::Completed);
    let job = store.job(doomed).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::RetriesExhausted));
    assert!(
        job.failure_message
            .as_deref()
            .is_some_and(|message| message.starts_with("handler panicked: boom"))
    );
}
