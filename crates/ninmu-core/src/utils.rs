//! Time-driven streams used by the polling loops.
//!
//! `Ticker` wakes a loop on a fixed period. `Throttle` caps how many wake-ups
//! pass per window and drops the rest, so bursts of notifications never turn
//! into queued claim attempts.
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use pin_project_lite::pin_project;

pin_project! {
    /// Fixed-period stream driving polls, heartbeats and scans.
    ///
    /// The delay is re-armed when it fires, so a consumer that stalls briefly
    /// drifts instead of receiving a burst of catch-up ticks.
    pub struct Ticker {
        #[pin]
        delay: futures_timer::Delay,
        period: Duration,
        fire_now: bool,
    }
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self {
            delay: futures_timer::Delay::new(period),
            period,
            fire_now: false,
        }
    }

    /// Like [`Ticker::new`], but the first tick is due immediately.
    pub fn immediate(period: Duration) -> Self {
        Self {
            fire_now: true,
            ..Self::new(period)
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Stream for Ticker {
    type Item = ();

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<()>> {
        let mut this = self.project();
        if std::mem::take(this.fire_now) {
            return Poll::Ready(Some(()));
        }
        match this.delay.as_mut().poll(cx) {
            Poll::Ready(()) => {
                this.delay.reset(*this.period);
                Poll::Ready(Some(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

pin_project! {
    /// Let at most `max_count` items through per window; drop the excess.
    pub struct Throttle<St, Tick> {
        #[pin]
        inner: St,
        #[pin]
        window: Tick,
        max_count: usize,
        issued: usize,
    }
}

impl<St> Throttle<St, Ticker> {
    pub fn new(stream: St, window: Duration, max_count: usize) -> Self {
        Self::with_window(stream, Ticker::new(window), max_count)
    }
}

impl<St, Tick> Throttle<St, Tick> {
    pub fn with_window(stream: St, window: Tick, max_count: usize) -> Self {
        Self {
            inner: stream,
            window,
            max_count,
            issued: 0,
        }
    }
}

impl<St, Tick> Stream for Throttle<St, Tick>
where
    St: Stream,
    Tick: Stream,
{
    type Item = St::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        // A new window resets the budget. Polling the window also registers
        // the waker, so a throttled stream wakes on the next window.
        match this.window.as_mut().poll_next(cx) {
            Poll::Ready(Some(_)) => *this.issued = 0,
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => {}
        }

        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => {
                    if *this.issued < *this.max_count {
                        *this.issued += 1;
                        return Poll::Ready(Some(item));
                    }
                    // over budget: drop and keep draining
                }
                other => return other,
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.inner.size_hint().1)
    }
}

pub trait ThrottleExt: Stream {
    /// Forward at most `max_count` per `window`; drop excess.
    fn throttle(self, window: Duration, max_count: usize) -> Throttle<Self, Ticker>
    where
        Self: Sized,
    {
        Throttle::new(self, window, max_count)
    }
}

impl<St: Stream> ThrottleExt for St {}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt as _;

    #[tokio::test]
    async fn throttle_drops_beyond_budget() {
        let burst = futures::stream::iter(0..10);
        // A window that never ticks keeps the first budget forever.
        let throttled =
            Throttle::with_window(burst, futures::stream::pending::<()>(), 3).collect::<Vec<_>>();
        assert_eq!(throttled.await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn immediate_ticker_fires_first_tick_without_waiting() {
        let mut ticker = Ticker::immediate(Duration::from_secs(3600));
        let first = tokio::time::timeout(Duration::from_millis(100), ticker.next()).await;
        assert_eq!(first, Ok(Some(())));
    }
}
