//! One-shot results that any number of threads can wait on.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{
    FutureExt,
    channel::oneshot,
    future::Shared,
};
use thiserror::Error;

/// The producing side went away without delivering a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("completion was dropped before a value was produced")]
pub struct Cancelled;

/// Creates a linked completer/completion pair.
#[must_use]
pub fn completion<T: Clone>() -> (Completer<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx }, Completion { inner: rx.shared() })
}

/// Sending half of a [`Completion`].
pub struct Completer<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Completer<T> {
    /// Delivers the value to every clone of the linked completion.
    pub fn complete(self, value: T) {
        // Nobody listening is fine.
        let _ = self.tx.send(value);
    }
}

/// A cloneable, shareable one-shot result.
///
/// Implements [`Future`] for async callers, [`Completion::wait`] for plain
/// threads and [`Completion::peek`] for threads that must never block.
pub struct Completion<T: Clone> {
    inner: Shared<oneshot::Receiver<T>>,
}

impl<T: Clone> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Completion<T> {
    /// A completion that is already resolved.
    #[must_use]
    pub fn ready(value: T) -> Self {
        let (completer, completion) = completion();
        completer.complete(value);
        completion
    }

    /// Returns the value if it has been produced, without blocking.
    #[must_use]
    pub fn peek(&self) -> Option<Result<T, Cancelled>> {
        self.inner
            .clone()
            .now_or_never()
            .map(|res| res.map_err(|_| Cancelled))
    }

    /// Returns true once a value was produced or the completer was dropped.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.peek().is_some()
    }

    /// Blocks the current thread until the value is produced.
    ///
    /// Must not be called from a thread that is itself responsible for
    /// producing the value.
    pub fn wait(&self) -> Result<T, Cancelled> {
        futures::executor::block_on(self.inner.clone()).map_err(|_| Cancelled)
    }
}

impl<T: Clone> Future for Completion<T> {
    type Output = Result<T, Cancelled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx).map(|res| res.map_err(|_| Cancelled))
    }
}
