//! Cancellation contexts.
//!
//! A [`Context`] is a cloneable handle onto a single cancellation state. It is cancelled at most
//! once, with a cause ([`Error`]); every clone observes the same cause. Contexts form a tree:
//! cancelling a parent cancels its children, never the other way round.
//!
//! Code that reacts to cancellation either awaits [`Context::done`] or registers a watcher with
//! [`Context::after_func`]. Watchers run inline on whichever task performs the cancellation, so
//! they must be short and must not block.
use std::{
    collections::HashMap,
    fmt, mem,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::Notify, task::AbortHandle, time::Instant};

use crate::error::Error;

type Watcher = Box<dyn FnOnce(&Error) + Send>;

/// Cancellation handle shared by a caller and everything acting on its behalf.
#[derive(Clone)]
pub struct Context(Arc<Inner>);

struct Inner {
    state: Mutex<State>,
    done: Notify,
    deadline: Option<Instant>,
    links: Mutex<Links>,
}

#[derive(Default)]
struct State {
    cause: Option<Error>,
    watchers: HashMap<u64, Watcher>,
    next_id: u64,
}

/// What ties a context to the outside world: its parent's watcher and its deadline timer. Both
/// are released once the context is cancelled or dropped.
#[derive(Default)]
struct Links {
    parent: Option<AfterFunc>,
    timer: Option<AbortHandle>,
}

impl Links {
    fn detach(self) {
        if let Some(parent) = self.parent {
            parent.stop();
        }
        if let Some(timer) = self.timer {
            timer.abort();
        }
    }
}

impl Context {
    /// A root context. It is only ever cancelled explicitly.
    pub fn new() -> Self {
        Self::with_deadline_unchecked(None)
    }

    fn with_deadline_unchecked(deadline: Option<Instant>) -> Self {
        Context(Arc::new(Inner {
            state: Mutex::new(State::default()),
            done: Notify::new(),
            deadline,
            links: Mutex::new(Links::default()),
        }))
    }

    /// A context cancelled (with the same cause) whenever `self` is.
    pub fn child(&self) -> Context {
        self.derive(self.deadline())
    }

    fn derive(&self, deadline: Option<Instant>) -> Context {
        let child = Context::with_deadline_unchecked(deadline);
        let weak = Arc::downgrade(&child.0);
        let link = self.watch(move |cause| {
            if let Some(inner) = weak.upgrade() {
                Context(inner).cancel(cause.clone());
            }
        });
        child.0.links.lock().parent = Some(link);
        child
    }

    /// A child that is additionally cancelled with [`Error::DeadlineExceeded`] at `deadline`.
    ///
    /// If the parent's own deadline is earlier, this is just [`child`](Self::child).
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime while the deadline is still in the future.
    pub fn with_deadline(&self, deadline: Instant) -> Context {
        if self.deadline().is_some_and(|parent| parent <= deadline) {
            return self.child();
        }
        let child = self.derive(Some(deadline));
        if child.is_done() {
            return child;
        }
        if deadline <= Instant::now() {
            child.cancel(Error::DeadlineExceeded);
            return child;
        }
        let weak = Arc::downgrade(&child.0);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                Context(inner).cancel(Error::DeadlineExceeded);
            }
        });
        child.0.links.lock().timer = Some(timer.abort_handle());
        child
    }

    /// Shorthand for [`with_deadline`](Self::with_deadline) at `now + timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Cancel with `cause`. Returns `false` if the context was already cancelled, in which case
    /// the first cause is kept.
    pub fn cancel(&self, cause: Error) -> bool {
        let watchers = {
            let mut state = self.0.state.lock();
            if state.cause.is_some() {
                return false;
            }
            state.cause = Some(cause.clone());
            mem::take(&mut state.watchers)
        };
        self.0.done.notify_waiters();
        let links = mem::take(&mut *self.0.links.lock());
        links.detach();
        for (_, watcher) in watchers {
            watcher(&cause);
        }
        true
    }

    /// Resolves once the context is cancelled.
    pub async fn done(&self) {
        loop {
            let notified = self.0.done.notified();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_done(&self) -> bool {
        self.0.state.lock().cause.is_some()
    }

    /// The cause passed to the first successful [`cancel`](Self::cancel), if any.
    pub fn cause(&self) -> Option<Error> {
        self.0.state.lock().cause.clone()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.0.deadline
    }

    /// Run `f` once this context is cancelled.
    ///
    /// If the context is already cancelled `f` runs immediately, on the calling task. The returned
    /// handle can unregister `f` before it runs.
    pub fn after_func<F>(&self, f: F) -> AfterFunc
    where
        F: FnOnce() + Send + 'static,
    {
        self.watch(move |_| f())
    }

    fn watch<F>(&self, f: F) -> AfterFunc
    where
        F: FnOnce(&Error) + Send + 'static,
    {
        let mut state = self.0.state.lock();
        let cause = state.cause.clone();
        if let Some(cause) = cause {
            drop(state);
            f(&cause);
            return AfterFunc {
                ctx: Weak::new(),
                id: 0,
            };
        }
        let id = state.next_id;
        state.next_id += 1;
        state.watchers.insert(id, Box::new(f));
        AfterFunc {
            ctx: Arc::downgrade(&self.0),
            id,
        }
    }

    /// A guard that cancels this context with [`Error::Canceled`] when dropped.
    pub fn cancel_on_drop(&self) -> CancelGuard {
        CancelGuard(self.clone())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cause", &self.cause())
            .field("deadline", &self.0.deadline)
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        mem::take(self.links.get_mut()).detach();
    }
}

/// Registration handle returned by [`Context::after_func`].
#[derive(Debug)]
pub struct AfterFunc {
    ctx: Weak<Inner>,
    id: u64,
}

impl AfterFunc {
    /// Unregister the watcher. Returns `true` if this call prevented it from running, `false` if
    /// it already ran (or is running).
    pub fn stop(&self) -> bool {
        let Some(inner) = self.ctx.upgrade() else {
            return false;
        };
        let watcher = inner.state.lock().watchers.remove(&self.id);
        watcher.is_some()
    }
}

/// Cancels its context with [`Error::Canceled`] on drop.
#[derive(Debug)]
pub struct CancelGuard(Context);

impl CancelGuard {
    pub fn context(&self) -> &Context {
        &self.0
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.0.cancel(Error::Canceled);
    }
}
