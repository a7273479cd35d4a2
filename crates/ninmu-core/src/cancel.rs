//! Cooperative cancellation handed to every handler invocation.
//!
//! The worker trips it when a heartbeat reports that cancellation was
//! requested or that the lease was lost. Handlers either poll
//! [`Cancel::is_canceled`] between units of work or race
//! [`Cancel::canceled`] against their own futures.
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct Cancel(CancellationToken);

impl Cancel {
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    /// A signal tripped with `self` that can also be tripped on its own.
    pub fn child(&self) -> Self {
        Self(self.0.child_token())
    }

    /// Trip the signal. Later calls are no-ops.
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once the signal is tripped.
    pub async fn canceled(&self) {
        self.0.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.0
    }
}

impl From<CancellationToken> for Cancel {
    fn from(token: CancellationToken) -> Self {
        Self(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn canceled_resolves_for_every_clone() {
        let cancel = Cancel::new();
        let waiter = cancel.clone();
        let handle = tokio::spawn(async move {
            waiter.canceled().await;
            waiter.is_canceled()
        });
        tokio::task::yield_now().await;
        assert!(!cancel.is_canceled());

        cancel.cancel();
        cancel.cancel();
        assert!(handle.await.unwrap());
        cancel.canceled().await;
    }

    #[test]
    fn child_follows_parent_only() {
        let shutdown = Cancel::new();
        let job = shutdown.child();
        job.cancel();
        assert!(!shutdown.is_canceled());

        let other = shutdown.child();
        shutdown.cancel();
        assert!(other.is_canceled());
    }
}
