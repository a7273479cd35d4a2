//! Enqueue notifications turned into worker wake-ups.
//!
//! Every enqueue publishes its kind on one NOTIFY channel. A [`Listener`]
//! owns the LISTEN connection and fans each notification out to the
//! workers subscribed to that kind.
use std::collections::HashMap;
use std::time::Duration;

use futures::channel::mpsc;
use futures::{Stream, StreamExt as _};
use ninmu_core::{
    JobHandler, Worker,
    utils::{Throttle, ThrottleExt as _, Ticker},
};
use serde::{Deserialize, Serialize};

use crate::{Error, PgBackEnd};

/// NOTIFY payload published by every enqueue.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ChannelData {
    pub kind: String,
}

/// Yields when jobs of the subscribed kind were enqueued. Notifications that
/// arrive while a wake-up is still pending fold into it.
pub type Wakeups = mpsc::Receiver<()>;

type Routes = HashMap<String, Vec<mpsc::Sender<()>>>;

#[derive(Debug)]
pub struct Listener {
    inner: sqlx::postgres::PgListener,
    routes: Routes,
}

impl Listener {
    pub(crate) async fn connect(pool: &sqlx::PgPool) -> Result<Self, sqlx::Error> {
        let mut inner = sqlx::postgres::PgListener::connect_with(pool).await?;
        inner.listen(crate::NOTIFY_CHANNEL_NAME).await?;
        Ok(Self {
            inner,
            routes: Routes::new(),
        })
    }

    /// Wake-ups for jobs of `kind`. Subscribe before calling [`listen`].
    ///
    /// [`listen`]: Listener::listen
    pub fn subscribe(&mut self, kind: impl Into<String>) -> Wakeups {
        // Each sender owns one guaranteed slot, which is the pending wake-up.
        let (sender, wakeups) = mpsc::channel(0);
        self.routes.entry(kind.into()).or_default().push(sender);
        wakeups
    }

    /// Route notifications until the connection closes or `signal` resolves.
    pub async fn listen_until<Signal>(self, signal: Signal) -> Result<(), Error>
    where
        Signal: Future,
    {
        let Self { inner, mut routes } = self;
        let mut notifications = std::pin::pin!(inner.into_stream().take_until(signal));

        while let Some(received) = notifications.next().await {
            match received {
                Ok(notification) => route(&mut routes, notification.payload()),
                Err(error) => tracing::error!(error = %error, "Failed to receive job notification"),
            }
        }
        tracing::debug!("job listener stopped");
        Ok(())
    }

    pub async fn listen(self) -> Result<(), Error> {
        self.listen_until(std::future::pending::<()>()).await
    }
}

fn route(routes: &mut Routes, payload: &str) {
    let kind = match serde_json::from_str::<ChannelData>(payload) {
        Ok(ChannelData { kind }) => kind,
        Err(error) => {
            tracing::warn!(error = %error, payload, "Ignoring malformed job notification");
            return;
        }
    };
    let Some(senders) = routes.get_mut(&kind) else {
        tracing::trace!(kind = %kind, "no worker subscribed");
        return;
    };

    // A full channel already holds a wake-up; only a closed one is dropped.
    senders.retain_mut(|sender| match sender.try_send(()) {
        Err(error) => !error.is_disconnected(),
        Ok(()) => true,
    });
    if senders.is_empty() {
        tracing::debug!(kind = %kind, "every worker for this kind stopped listening");
        routes.remove(&kind);
    }
}

type ListenTick<Tick> = futures::stream::Select<Tick, Wakeups>;
type ThrottleTick<Tick> = Throttle<ListenTick<Tick>, Ticker>;

/// Wake a PostgreSQL worker on enqueue notifications as well as its tick.
pub trait WorkerWithListenerExt<Tick, F, M, Sp, Signal>
where
    Tick: Stream<Item = ()>,
    F: JobHandler<M>,
{
    fn subscribe(
        self,
        listener: &mut Listener,
    ) -> Worker<ListenTick<Tick>, PgBackEnd<F::Data>, F, M, Sp, Signal>;

    /// Like [`subscribe`](WorkerWithListenerExt::subscribe), passing at most
    /// `count` wake-ups per `window`.
    fn subscribe_with_throttle(
        self,
        listener: &mut Listener,
        window: Duration,
        count: usize,
    ) -> Worker<ThrottleTick<Tick>, PgBackEnd<F::Data>, F, M, Sp, Signal>;
}

impl<Tick, F, M, Sp, Signal> WorkerWithListenerExt<Tick, F, M, Sp, Signal>
    for Worker<Tick, PgBackEnd<F::Data>, F, M, Sp, Signal>
where
    Tick: Stream<Item = ()>,
    F: JobHandler<M>,
{
    fn subscribe(
        self,
        listener: &mut Listener,
    ) -> Worker<ListenTick<Tick>, PgBackEnd<F::Data>, F, M, Sp, Signal> {
        let wakeups = listener.subscribe(self.backend_ref().kind.as_ref());
        self.map_tick(|tick| futures::stream::select(tick, wakeups))
    }

    fn subscribe_with_throttle(
        self,
        listener: &mut Listener,
        window: Duration,
        count: usize,
    ) -> Worker<ThrottleTick<Tick>, PgBackEnd<F::Data>, F, M, Sp, Signal> {
        let wakeups = listener.subscribe(self.backend_ref().kind.as_ref());
        self.map_tick(|tick| futures::stream::select(tick, wakeups).throttle(window, count))
    }
}
