use std::time::Duration;

use futures::executor::block_on;
use ninmu_core::{
    BackEndContext as _, BackEndPoller as _, Candidate, EntityRef, InsertJob, JobState,
    JobStore as _, ListOptions, ManualClock, MemoryBackEnd, Policy, Reap as _, SchedulerBuilder,
};
use proptest::prelude::*;

fn sourcegraph() -> EntityRef {
    EntityRef::new(1, "github.com/sourcegraph/sourcegraph")
}

fn zoekt() -> EntityRef {
    EntityRef::new(2, "github.com/sourcegraph/zoekt")
}

async fn complete_next(store: &mut MemoryBackEnd<()>) {
    let job = store.poll_job(1).await.remove(0).unwrap();
    let (_record, context) = job.split_parts();
    context.complete().await.unwrap();
}

#[tokio::test]
async fn revision_lookup_tracks_each_revision_separately() {
    let clock = ManualClock::default();
    let store = MemoryBackEnd::with_clock(clock.clone());
    let r1 = store.enqueue(&InsertJob::new(sourcegraph(), "r1", ())).await.unwrap();
    clock.advance(Duration::from_secs(1));
    let r2 = store.enqueue(&InsertJob::new(sourcegraph(), "r2", ())).await.unwrap();

    let found = store.last_job_for_revision(sourcegraph().id, "r1").await.unwrap();
    assert_eq!(found.map(|job| job.id), Some(r1));
    let found = store.last_job_for_revision(sourcegraph().id, "r2").await.unwrap();
    assert_eq!(found.map(|job| job.id), Some(r2));
    assert!(store.last_job_for_revision(zoekt().id, "r1").await.unwrap().is_none());
}

#[tokio::test]
async fn completed_history_and_state_filter() {
    let clock = ManualClock::default();
    let mut store = MemoryBackEnd::with_clock(clock.clone()).retry_delay(Duration::ZERO);
    let done = store.enqueue(&InsertJob::new(sourcegraph(), "r1", ())).await.unwrap();
    complete_next(&mut store).await;
    clock.advance(Duration::from_secs(1));
    let failed = store
        .enqueue(&InsertJob::new(sourcegraph(), "r2", ()).max_attempts(1))
        .await
        .unwrap();
    let (_record, context) = store.poll_job(1).await.remove(0).unwrap().split_parts();
    assert_eq!(context.fail("boom".to_owned(), true).await.unwrap(), JobState::Failed);
    clock.advance(Duration::from_secs(1));
    store.enqueue(&InsertJob::new(sourcegraph(), "r3", ())).await.unwrap();

    let last = store.last_completed_job(sourcegraph().id).await.unwrap();
    assert_eq!(last.map(|job| job.id), Some(done));

    let options = ListOptions::default().state(JobState::Failed);
    let listed = store.list(&options).await.unwrap();
    assert_eq!(listed.iter().map(|job| job.id).collect::<Vec<_>>(), vec![failed]);
    assert_eq!(store.count(&options).await.unwrap(), 1);
    assert_eq!(store.count(&ListOptions::default()).await.unwrap(), 3);
}

#[tokio::test]
async fn completed_filter_lists_only_the_finished_job() {
    let clock = ManualClock::default();
    let mut store = MemoryBackEnd::with_clock(clock.clone());
    let mut ids = Vec::new();
    for revision in ["r1", "r2", "r3"] {
        ids.push(store.enqueue(&InsertJob::new(sourcegraph(), revision, ())).await.unwrap());
        clock.advance(Duration::from_secs(1));
    }
    complete_next(&mut store).await;

    let options = ListOptions::default().state(JobState::Completed);
    let listed = store.list(&options).await.unwrap();
    assert_eq!(listed.iter().map(|job| job.id).collect::<Vec<_>>(), vec![ids[0]]);
    assert_eq!(listed[0].state, JobState::Completed);
    assert_eq!(store.count(&options).await.unwrap(), 1);

    let queued = ListOptions::default().state(JobState::Queued);
    assert_eq!(store.count(&queued).await.unwrap(), 2);
}

#[tokio::test]
async fn recently_processed_entity_waits_for_its_interval() {
    let clock = ManualClock::default();
    let mut store = MemoryBackEnd::with_clock(clock.clone());
    store.enqueue(&InsertJob::new(sourcegraph(), "r1", ())).await.unwrap();
    complete_next(&mut store).await;
    clock.advance(Duration::from_secs(30 * 60));

    let scheduler = SchedulerBuilder::new_with_tick(futures::stream::empty::<()>())
        .policy(Policy::global("hourly").minimum_interval(Duration::from_secs(3600)))
        .clock(clock.clone())
        .build(
            store.clone(),
            vec![Candidate::new(sourcegraph(), "r2"), Candidate::new(zoekt(), "r1")],
            |_: &Candidate| (),
        );

    let outcomes = scheduler.evaluate().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].selected, vec![zoekt().id]);

    let queued = store.list(&ListOptions::default().state(JobState::Queued)).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].entity, zoekt());
    assert_eq!(queued[0].revision, "r1");
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Claim,
    Complete,
    Retry,
    Fail,
    Cancel,
    Stale,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Claim),
        Just(Step::Complete),
        Just(Step::Retry),
        Just(Step::Fail),
        Just(Step::Cancel),
        Just(Step::Stale),
    ]
}

proptest! {
    #[test]
    fn every_observed_change_is_a_legal_transition(steps in prop::collection::vec(step(), 1..24)) {
        block_on(async {
            let clock = ManualClock::default();
            let mut store = MemoryBackEnd::with_clock(clock.clone()).retry_delay(Duration::ZERO);
            let id = store
                .enqueue(&InsertJob::new(sourcegraph(), "r1", ()).max_attempts(3))
                .await
                .unwrap();
            let mut context = None;
            let mut previous = JobState::Queued;

            for step in steps {
                match step {
                    Step::Claim => {
                        if let Some(Ok(job)) = store.poll_job(1).await.pop() {
                            context = Some(job.split_parts().1);
                        }
                    }
                    Step::Complete => {
                        if let Some(ctx) = context.take() {
                            let _ = ctx.complete().await;
                        }
                    }
                    Step::Retry => {
                        if let Some(ctx) = context.take() {
                            let _ = ctx.fail("transient".to_owned(), true).await;
                        }
                    }
                    Step::Fail => {
                        if let Some(ctx) = context.take() {
                            let _ = ctx.fail("permanent".to_owned(), false).await;
                        }
                    }
                    Step::Cancel => {
                        let _ = store.cancel(id).await;
                    }
                    Step::Stale => {
                        clock.advance(Duration::from_secs(60));
                        store.reap_stale(Duration::from_secs(30), 1).await.unwrap();
                    }
                }

                let job = store.job(id).await.unwrap();
                prop_assert!(
                    job.state == previous || previous.can_transition_to(job.state),
                    "{previous} -> {} after {step:?}",
                    job.state
                );
                prop_assert!(job.failure_count <= job.max_attempts);
                prop_assert_eq!(job.state.is_terminal(), job.finished_at.is_some());
                previous = job.state;
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
