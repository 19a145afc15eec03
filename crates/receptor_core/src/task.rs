//! Deferred results of spawned operations.
//!
//! Every I/O-bound operation returns a [`Deferred`]: a handle to a task already
//! running on the session's runtime. Await it (or call [`Deferred::wait`]) to
//! get the result; drop it to let the task finish detached. Ordering between
//! dependent operations is expressed by awaiting one before issuing the next.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

enum State<T> {
    /// Resolved without spawning (precondition failures, cached answers).
    Ready(Option<Result<T>>),
    Running(JoinHandle<Result<T>>),
}

/// Handle to the eventual result of an operation.
pub struct Deferred<T> {
    state: State<T>,
    token: CancellationToken,
    operation: &'static str,
}

// The output is never pinned in place; JoinHandle is Unpin.
impl<T> Unpin for Deferred<T> {}

impl<T: Send + 'static> Deferred<T> {
    /// Spawn `fut` on `runtime`. The task stops at its next await point once
    /// the handle's token is cancelled.
    pub fn spawn<F>(runtime: &Handle, operation: &'static str, fut: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = runtime.spawn(async move {
            select! {
                biased;
                _ = child.cancelled() => {
                    tracing::debug!(operation, "Operation cancelled");
                    Err(Error::cancelled(operation))
                }
                result = fut => result,
            }
        });
        Self { state: State::Running(handle), token, operation }
    }
}

impl<T> Deferred<T> {
    /// An already-successful result.
    pub fn ready(operation: &'static str, value: T) -> Self {
        Self::resolved(operation, Ok(value))
    }

    /// An already-failed result.
    pub fn failed(operation: &'static str, error: Error) -> Self {
        Self::resolved(operation, Err(error))
    }

    fn resolved(operation: &'static str, result: Result<T>) -> Self {
        Self { state: State::Ready(Some(result)), token: CancellationToken::new(), operation }
    }

    /// Name of the operation, for logging.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Request cancellation. The result becomes `Error::Cancelled` unless the
    /// task already finished.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check if the result is available without waiting.
    pub fn is_finished(&self) -> bool {
        match &self.state {
            State::Ready(_) => true,
            State::Running(handle) => handle.is_finished(),
        }
    }

    /// Wait at most `timeout` for the result.
    ///
    /// On timeout the operation is cancelled and aborted before returning
    /// `Error::Timeout`. Backend work already submitted may still complete.
    pub async fn wait(mut self, timeout: Duration) -> Result<T> {
        let outcome = tokio::time::timeout(timeout, &mut self).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                self.token.cancel();
                if let State::Running(handle) = &self.state {
                    handle.abort();
                }
                tracing::warn!(operation = self.operation, ?timeout, "Operation timed out");
                Err(Error::timeout(self.operation, timeout))
            }
        }
    }
}

impl<T> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            State::Ready(result) => Poll::Ready(
                result
                    .take()
                    .unwrap_or_else(|| Err(Error::internal("deferred result already taken"))),
            ),
            State::Running(handle) => {
                Pin::new(handle).poll(cx).map(|joined| joined.map_err(Error::from).and_then(|r| r))
            }
        }
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("operation", &self.operation)
            .field("is_finished", &self.is_finished())
            .field("is_cancelled", &self.token.is_cancelled())
            .finish()
    }
}
