//! Recurrence scheduler: evaluate policies on a tick and enqueue due work.
//!
//! One pass reads the candidate universe once, asks the store for each
//! candidate's activity once, then walks the enabled policies in order. An
//! entity selected by an earlier policy is skipped by later ones in the same
//! pass.
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt as _, Stream, StreamExt as _};

use crate::{
    backend::{BackEndDriver, JobStore},
    clock::{Clock, SystemClock},
    job::{EntityActivity, EntityId, EntityRef, InsertJob, JobId},
    policy::Policy,
    utils::Ticker,
};

/// An entity that may receive a job, with the revision a new job would use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub entity: EntityRef,
    pub revision: String,
}

impl Candidate {
    pub fn new(entity: EntityRef, revision: impl Into<String>) -> Self {
        Self {
            entity,
            revision: revision.into(),
        }
    }
}

mod tmp {
    use super::Candidate;

    /// Supplies the universe of entities policies are evaluated over.
    #[trait_variant::make(EntitySource: Send)]
    pub trait LocalEntitySource {
        type Error: std::error::Error + Send;

        async fn candidates(&self) -> Result<Vec<Candidate>, Self::Error>;
    }
}

pub use tmp::EntitySource;

/// A fixed candidate list.
impl EntitySource for Vec<Candidate> {
    type Error = std::convert::Infallible;

    async fn candidates(&self) -> Result<Vec<Candidate>, Self::Error> {
        Ok(self.clone())
    }
}

/// What one policy did during a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub policy: String,
    pub selected: Vec<EntityId>,
    pub enqueued: Vec<JobId>,
}

#[derive(Debug)]
pub enum EvaluateError<SourceError, StoreError> {
    Source(SourceError),
    Store(StoreError),
}

impl<SourceError, StoreError> std::fmt::Display for EvaluateError<SourceError, StoreError>
where
    SourceError: std::fmt::Display,
    StoreError: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source(error) => write!(f, "failed to list candidates: {error}"),
            Self::Store(error) => write!(f, "failed to read entity activity: {error}"),
        }
    }
}

impl<SourceError, StoreError> std::error::Error for EvaluateError<SourceError, StoreError>
where
    SourceError: std::error::Error + 'static,
    StoreError: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Source(error) => Some(error),
            Self::Store(error) => Some(error),
        }
    }
}

type PassError<Source, Store> = EvaluateError<
    <Source as EntitySource>::Error,
    <<Store as JobStore>::Driver as BackEndDriver>::Error,
>;

pub struct SchedulerBuilder<Tick = Ticker> {
    tick: Tick,
    policies: Vec<Policy>,
    clock: Arc<dyn Clock>,
}

impl SchedulerBuilder {
    /// Evaluate every `interval`, starting immediately.
    pub fn new(interval: Duration) -> SchedulerBuilder<Ticker> {
        Self::new_with_tick(Ticker::immediate(interval))
    }

    pub fn new_with_tick<Tick>(tick: Tick) -> SchedulerBuilder<Tick> {
        SchedulerBuilder {
            tick,
            policies: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl<Tick> SchedulerBuilder<Tick> {
    /// Policies are evaluated in the order they are added.
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn policies(mut self, policies: impl IntoIterator<Item = Policy>) -> Self {
        self.policies.extend(policies);
        self
    }

    pub fn clock(self, clock: impl Clock) -> Self {
        Self {
            clock: Arc::new(clock),
            ..self
        }
    }

    /// `factory` builds the payload of each job the scheduler enqueues.
    pub fn build<Store, Source, Factory>(
        self,
        store: Store,
        source: Source,
        factory: Factory,
    ) -> Scheduler<Tick, Store, Source, Factory>
    where
        Store: JobStore,
        Source: EntitySource,
        Factory: Fn(&Candidate) -> Store::Data,
    {
        Scheduler {
            tick: self.tick,
            pass: Pass {
                store,
                source,
                factory,
                policies: self.policies,
                clock: self.clock,
            },
        }
    }
}

struct Pass<Store, Source, Factory> {
    store: Store,
    source: Source,
    factory: Factory,
    policies: Vec<Policy>,
    clock: Arc<dyn Clock>,
}

impl<Store, Source, Factory> Pass<Store, Source, Factory>
where
    Store: JobStore + Sync,
    Store::Data: Sync,
    Source: EntitySource + Sync,
    Factory: Fn(&Candidate) -> Store::Data + Send + Sync,
{
    async fn evaluate(&self) -> Result<Vec<PolicyOutcome>, PassError<Source, Store>> {
        let mut candidates = self.source.candidates().await.map_err(EvaluateError::Source)?;
        candidates.sort_by_key(|candidate| candidate.entity.id);
        candidates.dedup_by_key(|candidate| candidate.entity.id);

        let ids = candidates.iter().map(|candidate| candidate.entity.id).collect::<Vec<_>>();
        let activity = self.store.activity(&ids).await.map_err(EvaluateError::Store)?;
        let now = self.clock.now();

        let mut taken = BTreeSet::new();
        let mut outcomes = Vec::with_capacity(self.policies.len());
        for policy in self.policies.iter().filter(|policy| policy.enabled) {
            let (scoped, scoped_activity): (Vec<&Candidate>, Vec<EntityActivity>) = candidates
                .iter()
                .zip(&activity)
                .filter(|(candidate, _)| {
                    !taken.contains(&candidate.entity.id)
                        && policy.scope.matches(&candidate.entity.name)
                })
                .map(|(candidate, activity)| (candidate, activity.clone()))
                .unzip();

            let selected = policy.select_eligible(&scoped_activity, now);
            let mut outcome = PolicyOutcome {
                policy: policy.name.clone(),
                selected: selected.clone(),
                enqueued: Vec::with_capacity(selected.len()),
            };
            let chosen: BTreeSet<EntityId> = selected.iter().copied().collect();
            for candidate in scoped
                .into_iter()
                .filter(|candidate| chosen.contains(&candidate.entity.id))
            {
                taken.insert(candidate.entity.id);
                let job = InsertJob::new(
                    candidate.entity.clone(),
                    candidate.revision.clone(),
                    (self.factory)(candidate),
                );
                match self.store.enqueue(&job).await {
                    Ok(id) => outcome.enqueued.push(id),
                    Err(error) => {
                        tracing::error!(
                            policy = %policy.name,
                            entity = %candidate.entity.name,
                            error = %error,
                            "Failed to enqueue scheduled job"
                        );
                    }
                }
            }
            tracing::debug!(
                policy = %policy.name,
                selected = outcome.selected.len(),
                enqueued = outcome.enqueued.len(),
                "evaluated policy"
            );
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

pub struct Scheduler<Tick, Store, Source, Factory> {
    tick: Tick,
    pass: Pass<Store, Source, Factory>,
}

impl<Tick, Store, Source, Factory> Scheduler<Tick, Store, Source, Factory>
where
    Store: JobStore + Sync,
    Store::Data: Sync,
    Source: EntitySource + Sync,
    Factory: Fn(&Candidate) -> Store::Data + Send + Sync,
{
    pub fn store_ref(&self) -> &Store {
        &self.pass.store
    }

    /// Run a single pass now.
    pub async fn evaluate(&self) -> Result<Vec<PolicyOutcome>, PassError<Source, Store>> {
        self.pass.evaluate().await
    }
}

impl<Tick, Store, Source, Factory> Scheduler<Tick, Store, Source, Factory>
where
    Tick: Stream<Item = ()> + Send,
    Store: JobStore + Sync,
    Store::Data: Sync,
    Source: EntitySource + Sync,
    Factory: Fn(&Candidate) -> Store::Data + Send + Sync,
{
    pub fn run(self) -> impl Future<Output = ()> + Send {
        run_scheduler(self.tick, self.pass, std::future::pending::<()>())
    }

    /// Evaluate until `signal` resolves. A pass in progress finishes first.
    pub fn with_graceful_shutdown<Signal>(self, signal: Signal) -> impl Future<Output = ()> + Send
    where
        Signal: Future<Output = ()> + Send,
    {
        run_scheduler(self.tick, self.pass, signal)
    }
}

async fn run_scheduler<Tick, Store, Source, Factory, Signal>(
    tick: Tick,
    pass: Pass<Store, Source, Factory>,
    signal: Signal,
) where
    Tick: Stream<Item = ()> + Send,
    Store: JobStore + Sync,
    Store::Data: Sync,
    Source: EntitySource + Sync,
    Factory: Fn(&Candidate) -> Store::Data + Send + Sync,
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
                if let Err(error) = pass.evaluate().await {
                    tracing::error!(error = %error, "Failed to evaluate recurrence policies");
                }
            },
            _ = signal => {
                tracing::debug!("scheduler received graceful shutdown signal");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BackEndContext as _, BackEndPoller, JobState, ListOptions, ManualClock, MatchLimit,
        MemoryBackEnd, PolicyScope,
    };

    const HOUR: Duration = Duration::from_secs(3600);

    fn universe() -> Vec<Candidate> {
        vec![
            Candidate::new(EntityRef::new(2, "github.com/sourcegraph/zoekt"), "main"),
            Candidate::new(EntityRef::new(1, "github.com/sourcegraph/sourcegraph"), "main"),
            Candidate::new(EntityRef::new(3, "gitlab.com/other/repo"), "trunk"),
        ]
    }

    fn scheduler(
        store: &MemoryBackEnd<String>,
        clock: &ManualClock,
        policies: Vec<Policy>,
    ) -> Scheduler<
        Ticker,
        MemoryBackEnd<String>,
        Vec<Candidate>,
        impl Fn(&Candidate) -> String + use<>,
    > {
        SchedulerBuilder::new(HOUR)
            .policies(policies)
            .clock(clock.clone())
            .build(store.clone(), universe(), |candidate: &Candidate| {
                format!("embed {}", candidate.entity.name)
            })
    }

    #[tokio::test]
    async fn enqueues_in_entity_order_and_respects_interval() {
        let clock = ManualClock::default();
        let mut store = MemoryBackEnd::<String>::with_clock(clock.clone());
        let policies = vec![Policy::global("all").minimum_interval(HOUR)];
        let scheduler = scheduler(&store, &clock, policies);

        let outcomes = scheduler.evaluate().await.unwrap();
        assert_eq!(outcomes[0].selected, vec![EntityId(1), EntityId(2), EntityId(3)]);
        let jobs = store.list(&ListOptions::default()).await.unwrap();
        assert_eq!(jobs[0].payload, "embed github.com/sourcegraph/sourcegraph");
        assert_eq!(jobs[2].revision, "trunk");

        // Finish everything; within the hour nothing is due.
        for job in store.poll_job(10).await {
            let (_, context) = job.unwrap().split_parts();
            context.complete().await.unwrap();
        }
        clock.advance(HOUR - Duration::from_secs(1));
        assert!(scheduler.evaluate().await.unwrap()[0].selected.is_empty());

        clock.advance(Duration::from_secs(1));
        assert_eq!(scheduler.evaluate().await.unwrap()[0].selected.len(), 3);
    }

    #[tokio::test]
    async fn enqueued_entity_is_skipped_within_the_hour() {
        let clock = ManualClock::default();
        let store = MemoryBackEnd::<String>::with_clock(clock.clone());
        let entity = EntityRef::new(1, "github.com/sourcegraph/sourcegraph");
        store.enqueue(&InsertJob::new(entity, "main", String::new())).await.unwrap();
        let policy = Policy::global("all")
            .minimum_interval(HOUR)
            .scope(PolicyScope::patterns(["github.com/*"]).unwrap());
        let scheduler = scheduler(&store, &clock, vec![policy]);

        clock.advance(Duration::from_secs(60));
        let outcomes = scheduler.evaluate().await.unwrap();
        assert_eq!(outcomes[0].selected, vec![EntityId(2)]);
    }

    #[tokio::test]
    async fn later_policies_do_not_reselect_in_same_pass() {
        let clock = ManualClock::default();
        let store = MemoryBackEnd::<String>::with_clock(clock.clone());
        let first = Policy::global("sourcegraph")
            .scope(PolicyScope::patterns(["github.com/sourcegraph/*"]).unwrap())
            .match_limit(MatchLimit::Limited(1));
        let second = Policy::global("everything").match_limit(MatchLimit::Unlimited);
        let disabled = Policy::global("disabled").enabled(false);
        let scheduler = scheduler(&store, &clock, vec![first, disabled, second]);

        let outcomes = scheduler.evaluate().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].selected, vec![EntityId(1)]);
        assert_eq!(outcomes[1].selected, vec![EntityId(2), EntityId(3)]);
        assert_eq!(
            store.count(&ListOptions::default().state(JobState::Queued)).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn large_pass_enqueues_exactly_the_selected_entities() {
        let clock = ManualClock::default();
        let store = MemoryBackEnd::<String>::with_clock(clock.clone());
        let candidates = (1..=500)
            .rev()
            .map(|n| Candidate::new(EntityRef::new(n, format!("github.com/org/repo{n}")), "HEAD"))
            .collect::<Vec<_>>();
        let scheduler = SchedulerBuilder::new(HOUR)
            .policy(Policy::global("bulk").match_limit(MatchLimit::Limited(300)))
            .clock(clock.clone())
            .build(store.clone(), candidates, |candidate: &Candidate| {
                candidate.entity.name.clone()
            });

        let outcomes = scheduler.evaluate().await.unwrap();
        let expected = (1..=300).map(EntityId).collect::<Vec<_>>();
        assert_eq!(outcomes[0].selected, expected);
        assert_eq!(outcomes[0].enqueued.len(), 300);

        let options = ListOptions::default().first(500);
        let mut enqueued = store
            .list(&options)
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.entity.id)
            .collect::<Vec<_>>();
        enqueued.sort();
        assert_eq!(enqueued, expected);
    }

    #[tokio::test]
    async fn zero_limit_enqueues_nothing() {
        let clock = ManualClock::default();
        let store = MemoryBackEnd::<String>::with_clock(clock.clone());
        let policy = Policy::global("none").match_limit(MatchLimit::from(Some(0)));
        let scheduler = scheduler(&store, &clock, vec![policy]);

        assert!(scheduler.evaluate().await.unwrap()[0].enqueued.is_empty());
        assert_eq!(store.count(&ListOptions::default()).await.unwrap(), 0);
    }
}
