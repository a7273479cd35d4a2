// Run a scheduler, a reaper and a worker against the in-process store.
//
// The scheduler enqueues an "embedding" job for up to four repositories per
// pass; the worker processes them two at a time and reports progress
// through the stats aggregate. Press Ctrl+C (or wait 15 seconds) to stop.
use std::time::Duration;

use ninmu::{
    Cancel, Candidate, EntityRef, JobData, JobListing, JobResult, JobStore as _, ListOptions,
    MatchLimit, MemoryBackEnd, Policy, ReaperBuilder, SchedulerBuilder, Stats, WorkerBuilder,
    WorkerContext,
};

#[derive(Debug, Clone)]
struct Embed {
    repo: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let store = MemoryBackEnd::<Embed>::new().heartbeat_interval(Duration::from_millis(200));
    let shutdown = Cancel::new();

    let repos = (1..=6)
        .map(|n| Candidate::new(EntityRef::new(n, format!("github.com/demo/repo{n}")), "HEAD"))
        .collect::<Vec<_>>();
    let policy = Policy::global("all-repos")
        .minimum_interval(Duration::from_secs(10))
        .match_limit(MatchLimit::Limited(4));
    let scheduler = SchedulerBuilder::new(Duration::from_secs(2))
        .policy(policy)
        .build(store.clone(), repos, |candidate: &Candidate| Embed {
            repo: candidate.entity.name.clone(),
        });

    let reaper = ReaperBuilder::new(Duration::from_secs(1))
        .stale_after(Duration::from_secs(3))
        .build(store.clone());

    let worker = WorkerBuilder::new(Duration::from_millis(250))
        .concurrent(2)
        .build_with_context(store.clone(), embed, store.clone());

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(scheduler.with_graceful_shutdown(signal(&shutdown)));
    tasks.spawn(reaper.with_graceful_shutdown(signal(&shutdown)));
    tasks.spawn(worker.with_graceful_shutdown(signal(&shutdown)).run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(Duration::from_secs(15)) => {}
    }
    shutdown.cancel();
    tasks.join_all().await;

    let mut listing = JobListing::new(&store, ListOptions::default());
    let total = listing.total_count().await.unwrap_or_default();
    println!("id\tstate\tchunks\trepo");
    for job in listing.page().await.unwrap_or_default() {
        println!(
            "{}\t{}\t{}\t{}",
            job.id,
            job.state,
            job.stats.counter_value("chunks_embedded"),
            job.payload.repo
        );
    }
    println!("total_jobs = {total}");
}

fn signal(shutdown: &Cancel) -> impl Future<Output = ()> + Send + 'static {
    let shutdown = shutdown.clone();
    async move { shutdown.canceled().await }
}

async fn embed(
    JobData(job): JobData<Embed>,
    WorkerContext(store): WorkerContext<MemoryBackEnd<Embed>>,
    cancel: Cancel,
) -> JobResult {
    tracing::info!(repo = %job.payload.repo, attempt = job.failure_count + 1, "embedding");
    for _ in 0..5 {
        if cancel.is_canceled() {
            return JobResult::Canceled;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let progress = Stats::new()
            .counter("chunks_embedded", 1)
            .category("skipped", "too_large", 0);
        if let Err(error) = store.merge_stats(job.id, &progress).await {
            return JobResult::retry(error);
        }
    }
    JobResult::Complete
}
