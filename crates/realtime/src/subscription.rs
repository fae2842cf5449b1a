//! # Subscription
//!
//! Push-style delivery handle returned by collaborators. Dropping the handle
//! unsubscribes.

use std::fmt;

use tokio::sync::mpsc;

use crate::error::Result;

type Release = Box<dyn FnOnce() + Send>;

/// Stream of pushed values with guaranteed release.
///
/// Items are `Err` when the collaborator reports a read failure. The
/// collaborator decides whether the stream continues after an error.
pub struct Subscription<T> {
    receiver: mpsc::UnboundedReceiver<Result<T>>,
    release: Option<Release>,
}

impl<T> Subscription<T> {
    /// Wrap a receiver; `release` runs exactly once when the handle is dropped.
    pub fn new(
        receiver: mpsc::UnboundedReceiver<Result<T>>, release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self { receiver, release: Some(Box::new(release)) }
    }

    /// Sender/handle pair for collaborators that need no release hook.
    #[must_use]
    pub fn channel() -> (SubscriptionSender<T>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SubscriptionSender { sender: tx }, Self { receiver: rx, release: None })
    }

    /// Next pushed value, or `None` once the collaborator has closed the stream.
    pub async fn next(&mut self) -> Option<Result<T>> {
        self.receiver.recv().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.receiver.close();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("closed", &self.receiver.is_closed()).finish()
    }
}

/// Producer side of a [`Subscription`].
#[derive(Debug)]
pub struct SubscriptionSender<T> {
    sender: mpsc::UnboundedSender<Result<T>>,
}

impl<T> Clone for SubscriptionSender<T> {
    fn clone(&self) -> Self {
        Self { sender: self.sender.clone() }
    }
}

impl<T> SubscriptionSender<T> {
    #[must_use]
    pub fn new(sender: mpsc::UnboundedSender<Result<T>>) -> Self {
        Self { sender }
    }

    /// Push a value. Returns `false` when the subscriber has gone away.
    pub fn push(&self, item: Result<T>) -> bool {
        self.sender.send(item).is_ok()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn release_runs_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel::<Result<u32>>();
        let counter = Arc::clone(&released);
        let mut subscription = Subscription::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(Ok(7)).unwrap();
        tx.send(Err(Error::Unavailable("listen failed".to_string()))).unwrap();
        assert_eq!(subscription.next().await, Some(Ok(7)));
        assert!(matches!(subscription.next().await, Some(Err(Error::Unavailable(_)))));

        drop(subscription);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn channel_reports_closed_subscriber() {
        let (sender, subscription) = Subscription::<u32>::channel();
        assert!(sender.push(Ok(1)));
        drop(subscription);
        assert!(sender.is_closed());
        assert!(!sender.push(Ok(2)));
    }
}
