use std::fmt;

use tokio::sync::oneshot;

use crate::{context::Context, error::Error};

/// One caller's stake in a batch.
///
/// The batch function answers every request exactly once, either with [`send`](Self::send) or
/// with [`cancel`](Self::cancel). A request dropped without an answer (for instance because the
/// batch function skipped it) cancels its caller with [`Error::Unfulfilled`].
pub struct Request<K, V> {
    key: K,
    slot: Option<oneshot::Sender<V>>,
    ctx: Context,
}

impl<K, V> Request<K, V> {
    pub(crate) fn new(key: K, ctx: Context) -> (Self, oneshot::Receiver<V>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            key,
            slot: Some(tx),
            ctx,
        };
        (request, rx)
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// The caller's own context. It is done once the caller stopped waiting, for whatever reason.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Deliver the caller's value.
    ///
    /// Never blocks. Hands the value back if the request was already answered or its caller is
    /// gone.
    pub fn send(&mut self, value: V) -> Result<(), V> {
        if self.ctx.is_done() {
            return Err(value);
        }
        match self.slot.take() {
            Some(tx) => tx.send(value),
            None => Err(value),
        }
    }

    /// Fail the caller with `err`. Returns `false` if the request was already answered.
    pub fn cancel<E>(&mut self, err: E) -> bool
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.cancel_with(Error::cause(err))
    }

    /// Like [`cancel`](Self::cancel) with a ready-made [`Error`].
    pub fn cancel_with(&mut self, err: Error) -> bool {
        let Some(tx) = self.slot.take() else {
            return false;
        };
        // The cause must be in place before the slot closes.
        let canceled = self.ctx.cancel(err);
        drop(tx);
        canceled
    }

    /// Whether the request still awaits an answer and its caller is still waiting.
    pub fn is_pending(&self) -> bool {
        self.slot.is_some() && !self.ctx.is_done()
    }
}

impl<K, V> Drop for Request<K, V> {
    fn drop(&mut self) {
        if self.slot.is_some() {
            self.cancel_with(Error::Unfulfilled);
        }
    }
}

impl<K: fmt::Debug, V> fmt::Debug for Request<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("key", &self.key)
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Fail every request in `batch` with `err`; already answered requests are left alone.
pub fn cancel_all<K, V>(batch: &mut [Request<K, V>], err: Error) {
    for request in batch {
        request.cancel_with(err.clone());
    }
}
