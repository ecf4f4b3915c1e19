//! Per-key serialization of async jobs.
//!
//! A [`Registry`] keeps at most one live *call* per key. A call is a bounded job queue drained by
//! its own worker task, one job at a time, so jobs sharing a key never overlap while jobs for
//! different keys run independently. Jobs are queued, never discarded.
//!
//! Each caller holds a stake in the call from the moment it looks the call up until its job has
//! run (or until it withdraws because the queue was full or its context ended). The call is removed
//! from the registry exactly when the last stake goes away, and the count and the map are only ever
//! touched together under one lock, so nobody can find a call whose worker already exited.
use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::Arc,
    task::{self, Poll},
};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::{
    config::DEFAULT_QUEUE_CAPACITY,
    context::Context,
    error::{Error, Result},
};

type Job = BoxFuture<'static, ()>;

type Calls<K> = Mutex<HashMap<K, Call>>;

struct Call {
    jobs: mpsc::Sender<Job>,
    stakes: usize,
}

/// Serializes jobs by key. Cloning yields another handle onto the same registry.
pub struct Registry<K> {
    capacity: usize,
    calls: Arc<Calls<K>>,
}

impl<K> Registry<K> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// `capacity` bounds each key's job queue; `try_*` operations fail once it is full.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of keys with a live call.
    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

impl<K: Clone + Eq + Hash + Send + 'static> Registry<K> {
    /// Queue `fut` behind the other jobs for `key`. Returns once queued, not once run.
    pub async fn submit<Fut>(&self, key: K, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.push(key, fut.boxed()).await;
    }

    /// Queue `fut` only if `key`'s queue has room right now.
    ///
    /// Must be called from within a tokio runtime.
    pub fn try_submit<Fut>(&self, key: K, fut: Fut) -> bool
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.try_push(key, fut.boxed())
    }

    /// Queue `fut`, giving up when `ctx` is done first.
    pub async fn submit_with<Fut>(&self, ctx: &Context, key: K, fut: Fut) -> Result<()>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.push_with(ctx, key, fut.boxed()).await
    }

    /// Run `fut` in `key`'s queue and wait for its output.
    pub async fn call<T, Fut>(&self, key: K, fut: Fut) -> Result<T>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.enqueue(key, fut).await.await
    }

    /// Queue `fut` and return a handle to its output instead of waiting for it.
    pub async fn enqueue<T, Fut>(&self, key: K, fut: Fut) -> Pending<T>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (job, pending) = job(fut);
        self.push(key, job).await;
        pending
    }

    /// Like [`call`](Self::call), but `None` if `key`'s queue is full.
    pub async fn try_call<T, Fut>(&self, key: K, fut: Fut) -> Option<Result<T>>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (job, pending) = job(fut);
        if !self.try_push(key, job) {
            return None;
        }
        Some(pending.await)
    }

    /// Like [`try_call`](Self::try_call), but stops waiting for the output when `ctx` is done. A
    /// context that is already done fails before anything is queued.
    pub async fn try_call_with<T, Fut>(&self, ctx: &Context, key: K, fut: Fut) -> Option<Result<T>>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        if let Some(cause) = ctx.cause() {
            return Some(Err(cause));
        }
        let (job, pending) = job(fut);
        if !self.try_push(key, job) {
            return None;
        }
        Some(tokio::select! {
            output = pending => output,
            () = ctx.done() => Err(ctx.cause().unwrap_or(Error::Canceled)),
        })
    }

    /// Like [`call`](Self::call), but stops waiting (for room in the queue or for the output) when
    /// `ctx` is done. A job that was already queued still runs.
    pub async fn call_with<T, Fut>(&self, ctx: &Context, key: K, fut: Fut) -> Result<T>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (job, pending) = job(fut);
        self.push_with(ctx, key, job).await?;
        tokio::select! {
            output = pending => output,
            () = ctx.done() => Err(ctx.cause().unwrap_or(Error::Canceled)),
        }
    }

    async fn push(&self, key: K, job: Job) {
        let (stake, jobs) = self.acquire(key);
        if jobs.send(job).await.is_ok() {
            stake.commit();
        }
    }

    fn try_push(&self, key: K, job: Job) -> bool {
        let (stake, jobs) = self.acquire(key);
        match jobs.try_send(job) {
            Ok(()) => {
                stake.commit();
                true
            }
            Err(_) => false,
        }
    }

    async fn push_with(&self, ctx: &Context, key: K, job: Job) -> Result<()> {
        if let Some(cause) = ctx.cause() {
            return Err(cause);
        }
        let (stake, jobs) = self.acquire(key);
        tokio::select! {
            sent = jobs.send(job) => {
                if sent.is_err() {
                    return Err(Error::Closed);
                }
                stake.commit();
                Ok(())
            }
            () = ctx.done() => Err(ctx.cause().unwrap_or(Error::Canceled)),
        }
    }

    fn acquire(&self, key: K) -> (Stake<'_, K>, mpsc::Sender<Job>) {
        let mut calls = self.calls.lock();
        let existing = calls.get_mut(&key).map(|call| {
            call.stakes += 1;
            call.jobs.clone()
        });
        let jobs = match existing {
            Some(jobs) => jobs,
            None => {
                let (jobs, rx) = mpsc::channel(self.capacity);
                calls.insert(
                    key.clone(),
                    Call {
                        jobs: jobs.clone(),
                        stakes: 1,
                    },
                );
                tokio::spawn(run_call(Arc::clone(&self.calls), key.clone(), rx));
                jobs
            }
        };
        drop(calls);
        let stake = Stake {
            calls: &self.calls,
            key: Some(key),
        };
        (stake, jobs)
    }
}

impl<K> Default for Registry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for Registry<K> {
    fn clone(&self) -> Self {
        Self {
            capacity: self.capacity,
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<K> fmt::Debug for Registry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("capacity", &self.capacity)
            .field("calls", &self.len())
            .finish()
    }
}

/// A caller's claim on a call. Dropping it uncommitted withdraws the claim.
struct Stake<'a, K: Eq + Hash> {
    calls: &'a Calls<K>,
    key: Option<K>,
}

impl<K: Eq + Hash> Stake<'_, K> {
    /// The job is queued; from now on the worker releases this stake after running it.
    fn commit(mut self) {
        self.key = None;
    }
}

impl<K: Eq + Hash> Drop for Stake<'_, K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            release(self.calls, &key);
        }
    }
}

/// Drop one stake in `key`'s call, removing the call on the last one. Returns whether it was
/// removed.
fn release<K: Eq + Hash>(calls: &Calls<K>, key: &K) -> bool {
    let mut calls = calls.lock();
    let Some(call) = calls.get_mut(key) else {
        return true;
    };
    call.stakes -= 1;
    if call.stakes > 0 {
        return false;
    }
    // Dropping the entry's sender closes the queue once in-flight clones are gone.
    calls.remove(key);
    true
}

async fn run_call<K: Eq + Hash>(calls: Arc<Calls<K>>, key: K, mut jobs: mpsc::Receiver<Job>) {
    let mut ran = 0usize;
    while let Some(job) = jobs.recv().await {
        if let Err(payload) = AssertUnwindSafe(job).catch_unwind().await {
            warn!(error = %Error::from_panic(payload), "keyed job panicked");
        }
        ran += 1;
        if release(&calls, &key) {
            break;
        }
    }
    trace!(ran, "call drained");
}

fn job<T, Fut>(fut: Fut) -> (Job, Pending<T>)
where
    T: Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let job = async move {
        let output = AssertUnwindSafe(fut)
            .catch_unwind()
            .await
            .map_err(Error::from_panic);
        let _ = tx.send(output);
    };
    (job.boxed(), Pending(rx))
}

/// Output of a job queued with [`Registry::enqueue`].
///
/// The job runs whether or not this is awaited; dropping it only discards the output.
#[derive(Debug)]
pub struct Pending<T>(oneshot::Receiver<Result<T>>);

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(Error::Closed)))
    }
}
