//! Greedy micro-batching.
//!
//! A [`Group`] owns one worker task. Callers enqueue a [`Request`] on a bounded channel and wait on
//! their own result slot. The worker blocks for the first request, then takes everything else
//! already queued without waiting, and hands the lot to the batch function in one call. Batch size
//! is therefore whatever piled up while the previous batch ran: no windowing delay when idle, large
//! batches under load.
//!
//! Within one batch requests appear in arrival order. Nothing orders requests across batches, and
//! there is no fairness between callers beyond the FIFO queue.
use std::{fmt, panic::AssertUnwindSafe};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    config::Config,
    context::Context,
    error::{Error, Result},
    merge::Merge,
    request::{Request, cancel_all},
};

/// What a batch function returns: a boxed future borrowing the batch.
pub type BatchFuture<'a> = BoxFuture<'a, ()>;

/// Batches concurrent calls into single invocations of a batch function.
///
/// The batch function receives a context and the batch. The context is cancelled once every
/// caller in the batch has stopped waiting, or when [`Config::batch_timeout`] elapses. The
/// function must answer each request with [`Request::send`] or [`Request::cancel`]; requests left
/// unanswered are failed with [`Error::Unfulfilled`] once it returns. A panic inside it fails
/// every unanswered request of that batch with [`Error::Panicked`] and the worker carries on.
pub struct Group<K, V> {
    config: Config,
    state: Mutex<State<K, V>>,
}

struct State<K, V> {
    closed: bool,
    worker: Option<Worker<K, V>>,
}

struct Worker<K, V> {
    requests: mpsc::Sender<Request<K, V>>,
    quit: Context,
    exited: Context,
    handle: Option<JoinHandle<()>>,
}

impl<K, V> Group<K, V> {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                closed: false,
                worker: None,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl<K: Send + 'static, V: Send + 'static> Group<K, V> {
    /// Submit `key` and wait for its value.
    ///
    /// The first call starts the worker with `f`; every later call's `f` is dropped unused, so all
    /// callers of one group should pass the same function.
    ///
    /// Returns [`Error::Closed`] once the group is stopped, or the cause of `ctx` (or of the
    /// batch function's [`Request::cancel`]) if this call is cancelled first.
    pub async fn call<F>(&self, ctx: &Context, key: K, f: F) -> Result<V>
    where
        F: for<'a> FnMut(Context, &'a mut [Request<K, V>]) -> BatchFuture<'a> + Send + 'static,
    {
        let requests = self.start(f)?;
        let ctx = ctx.child();
        let _guard = ctx.cancel_on_drop();
        let (request, slot) = Request::new(key, ctx.clone());

        tokio::select! {
            sent = requests.send(request) => {
                if sent.is_err() {
                    return Err(Error::Closed);
                }
            }
            () = ctx.done() => return Err(ctx.cause().unwrap_or(Error::Canceled)),
        }

        tokio::select! {
            received = slot => received.map_err(|_| ctx.cause().unwrap_or(Error::Unfulfilled)),
            () = ctx.done() => Err(ctx.cause().unwrap_or(Error::Canceled)),
        }
    }

    fn start<F>(&self, f: F) -> Result<mpsc::Sender<Request<K, V>>>
    where
        F: for<'a> FnMut(Context, &'a mut [Request<K, V>]) -> BatchFuture<'a> + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        let worker = state
            .worker
            .get_or_insert_with(|| Worker::spawn(&self.config, f));
        Ok(worker.requests.clone())
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// The batch in progress runs to completion; requests still queued fail with
    /// [`Error::Closed`], as does every later [`call`](Self::call). Safe to call repeatedly and
    /// from several tasks at once; each caller returns only after the worker is gone.
    pub async fn stop(&self) -> Result<()> {
        let (quit, exited, handle) = {
            let mut state = self.state.lock();
            state.closed = true;
            let Some(worker) = state.worker.as_mut() else {
                return Ok(());
            };
            (
                worker.quit.clone(),
                worker.exited.clone(),
                worker.handle.take(),
            )
        };
        quit.cancel(Error::Closed);
        match handle {
            Some(handle) => match handle.await {
                Err(err) if err.is_panic() => return Err(Error::from_panic(err.into_panic())),
                _ => {}
            },
            None => exited.done().await,
        }
        Ok(())
    }
}

impl<K, V> Default for Group<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for Group<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Group")
            .field("config", &self.config)
            .field("closed", &state.closed)
            .field("started", &state.worker.is_some())
            .finish()
    }
}

impl<K: Send + 'static, V: Send + 'static> Worker<K, V> {
    fn spawn<F>(config: &Config, f: F) -> Self
    where
        F: for<'a> FnMut(Context, &'a mut [Request<K, V>]) -> BatchFuture<'a> + Send + 'static,
    {
        let (requests, rx) = mpsc::channel(config.channel_capacity());
        let quit = Context::new();
        let exited = Context::new();
        let handle = tokio::spawn(run_loop(
            rx,
            f,
            config.clone(),
            quit.clone(),
            exited.clone(),
        ));
        debug!(queue_capacity = config.channel_capacity(), "batch worker started");
        Self {
            requests,
            quit,
            exited,
            handle: Some(handle),
        }
    }
}

async fn run_loop<K, V, F>(
    mut requests: mpsc::Receiver<Request<K, V>>,
    mut f: F,
    config: Config,
    quit: Context,
    exited: Context,
) where
    K: Send + 'static,
    V: Send + 'static,
    F: for<'a> FnMut(Context, &'a mut [Request<K, V>]) -> BatchFuture<'a> + Send + 'static,
{
    let _exited = exited.cancel_on_drop();
    let limit = config.buffer.limit();
    let mut batch = Vec::with_capacity(config.buffer.initial_capacity());
    let mut merge = Merge::new(Context::new());

    loop {
        let first = tokio::select! {
            biased;
            () = quit.done() => break,
            received = requests.recv() => match received {
                Some(request) => request,
                None => break,
            },
        };

        merge.reset(batch_context(&config));
        merge.add(first.context());
        batch.push(first);
        while batch.len() < limit {
            match requests.try_recv() {
                Ok(request) => {
                    merge.add(request.context());
                    batch.push(request);
                }
                Err(_) => break,
            }
        }
        merge.seal();

        debug!(len = batch.len(), "running batch");
        let ctx = merge.context().clone();
        run_batch(&mut f, ctx.clone(), &mut batch).await;
        merge.stop();
        ctx.cancel(Error::Canceled);
        batch.clear();
    }

    // Senders holding a permit may still push after close; recv sees them through to None.
    requests.close();
    let mut abandoned = 0usize;
    while let Some(mut request) = requests.recv().await {
        request.cancel_with(Error::Closed);
        abandoned += 1;
    }
    debug!(abandoned, "batch worker exited");
}

async fn run_batch<K, V, F>(f: &mut F, ctx: Context, batch: &mut [Request<K, V>])
where
    F: for<'a> FnMut(Context, &'a mut [Request<K, V>]) -> BatchFuture<'a>,
{
    let outcome = AssertUnwindSafe(async { f(ctx, &mut *batch).await })
        .catch_unwind()
        .await;
    if let Err(payload) = outcome {
        let err = Error::from_panic(payload);
        warn!(error = %err, len = batch.len(), "batch function panicked");
        cancel_all(batch, err);
    }
}

fn batch_context(config: &Config) -> Context {
    let ctx = Context::new();
    match config.batch_timeout {
        Some(timeout) => ctx.with_timeout(timeout),
        None => ctx,
    }
}
