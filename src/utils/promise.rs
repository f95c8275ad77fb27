//! A write-once result that any number of tasks can await.

use crate::error::{ProtocolError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::fmt;
use tokio::sync::oneshot;

/// Completed at most once; later completions are ignored. Dropping an
/// uncompleted promise resolves its waiters with `ConnectionClosed`.
pub struct Promise<T: Clone> {
    sender: Mutex<Option<oneshot::Sender<Result<T>>>>,
    future: Shared<BoxFuture<'static, Result<T>>>,
}

impl<T> Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        let future = rx
            .map(|received| received.unwrap_or(Err(ProtocolError::ConnectionClosed)))
            .boxed()
            .shared();
        Promise {
            sender: Mutex::new(Some(tx)),
            future,
        }
    }

    /// A promise that is already settled.
    pub fn resolved(result: Result<T>) -> Self {
        let promise = Self::new();
        promise.complete(result);
        promise
    }

    /// Settles the promise. Returns false if it was already settled.
    pub fn complete(&self, result: Result<T>) -> bool {
        match self.sender.lock().take() {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// A future resolving to the settled value; clones share one result.
    pub fn future(&self) -> Shared<BoxFuture<'static, Result<T>>> {
        self.future.clone()
    }

    pub async fn wait(&self) -> Result<T> {
        self.future.clone().await
    }

    /// The settled value, if any waiter has already observed it.
    pub fn peek(&self) -> Option<Result<T>> {
        self.future.peek().cloned()
    }

    pub fn is_completed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl<T> Default for Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("completed", &self.sender.lock().is_none())
            .finish()
    }
}
