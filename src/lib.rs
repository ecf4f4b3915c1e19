//! Request coalescing for tokio: many concurrent callers, fewer physical executions, and every
//! caller still gets its own result and its own cancellation.
//!
//! Three primitives share one cancellation model:
//! * [`Group`] batches. One worker task per group blocks for a request, then greedily takes every
//!   request already queued and passes them all to a batch function in a single call. The batch
//!   function answers each [`Request`] individually with a value or an error.
//! * [`Registry`] serializes by key. Jobs submitted under the same key run one after another on a
//!   worker owned by that key; the worker and its registry entry live exactly as long as someone
//!   holds a stake in the key.
//! * [`Flight`] deduplicates by key. Concurrent calls for a key share the output of the one
//!   execution in flight.
//!
//! Cancellation is per caller. Each call runs under a [`Context`]; when it ends the caller returns
//! the context's cause and nobody else is affected. The context a batch function receives is
//! cancelled only once *every* caller in that batch has stopped waiting (or the configured batch
//! timeout passes), so the batch function can abandon work nobody wants any more.
//!
//! Failures are local: a batch function failing one request, a panic in a batch function or keyed
//! job, or a stopped group all surface as an [`Error`] from the affected calls only. Worker tasks
//! survive panics.
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! use coalesce::{Context, Group};
//! use futures::FutureExt;
//!
//! let group = Group::<&'static str, usize>::new();
//! let ctx = Context::new();
//! let len = group
//!     .call(&ctx, "three", |_ctx, batch| {
//!         async move {
//!             for request in batch.iter_mut() {
//!                 let n = request.key().len();
//!                 let _ = request.send(n);
//!             }
//!         }
//!         .boxed()
//!     })
//!     .await;
//! assert_eq!(len.unwrap(), 5);
//!
//! group.stop().await.unwrap();
//! assert!(group.call(&ctx, "late", |_, _| async {}.boxed()).await.unwrap_err().is_closed());
//! # }
//! ```
pub use crate::{
    config::{BufferPolicy, Config, DEFAULT_BATCH_CAPACITY, DEFAULT_QUEUE_CAPACITY},
    context::{AfterFunc, CancelGuard, Context},
    error::{Error, Result},
    flight::Flight,
    group::{BatchFuture, Group},
    merge::Merge,
    registry::{Pending, Registry},
    request::{Request, cancel_all},
};

mod config;
mod context;
mod error;
mod flight;
mod group;
mod merge;
mod registry;
mod request;
