//! Bridge from callback-style SDK completion to a future.
//!
//! Cloud SDKs commonly report async results through a handler with
//! `on_success`/`on_error` methods. [`completion`] returns such a handler
//! together with the future it resolves. The handler is consumed on
//! resolution, so a result is delivered at most once; dropping it without
//! resolving yields [`ProviderError::abandoned`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::ProviderError;

/// Completion handler handed to the SDK.
#[derive(Debug)]
pub struct Completion<T> {
    tx: oneshot::Sender<Result<T, ProviderError>>,
}

impl<T> Completion<T> {
    pub fn on_success(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    pub fn on_error(self, error: ProviderError) {
        let _ = self.tx.send(Err(error));
    }

    /// Resolve from an existing result.
    pub fn complete(self, result: Result<T, ProviderError>) {
        let _ = self.tx.send(result);
    }
}

/// Future side of a [`Completion`].
#[derive(Debug)]
pub struct PendingResult<T> {
    rx: oneshot::Receiver<Result<T, ProviderError>>,
}

impl<T> Future for PendingResult<T> {
    type Output = Result<T, ProviderError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(ProviderError::abandoned())))
    }
}

/// Create a linked handler and future.
pub fn completion<T>() -> (Completion<T>, PendingResult<T>) {
    let (tx, rx) = oneshot::channel();
    (Completion { tx }, PendingResult { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;

    #[tokio::test]
    async fn test_success_resolves_future() {
        let (done, pending) = completion::<u32>();
        tokio::spawn(async move { done.on_success(7) });
        assert_eq!(pending.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_error_resolves_future() {
        let (done, pending) = completion::<u32>();
        done.on_error(ProviderError::throttled("RequestLimitExceeded"));
        assert_eq!(pending.await.unwrap_err().kind, ProviderErrorKind::Throttled);
    }

    #[tokio::test]
    async fn test_dropped_handler_is_abandoned() {
        let (done, pending) = completion::<u32>();
        drop(done);
        assert_eq!(pending.await.unwrap_err(), ProviderError::abandoned());
    }
}
