//! Run each attempt as its own Tokio task, so a handler that blocks a
//! thread only stalls its own slot.
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;

use crate::worker::JobSpawner;

/// Spawn attempts onto the ambient Tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

pin_project! {
    /// Resolves to `None` instead of propagating a panic or an abort.
    pub struct TokioJobHandle<T> {
        #[pin]
        task: tokio::task::JoinHandle<T>,
    }
}

impl<T> Future for TokioJobHandle<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.project().task.poll(cx).map(|joined| match joined {
            Ok(settled) => Some(settled),
            Err(error) if error.is_panic() => {
                tracing::error!(error = %error, "job task panicked");
                None
            }
            Err(error) => {
                tracing::warn!(error = %error, "job task was aborted");
                None
            }
        })
    }
}

impl JobSpawner for TokioSpawner {
    type Handle<T>
        = TokioJobHandle<T>
    where
        T: Send + 'static;

    fn spawn<Fut>(&self, attempt: Fut) -> Self::Handle<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        TokioJobHandle {
            task: tokio::spawn(attempt),
        }
    }
}
