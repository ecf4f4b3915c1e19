//! Single-flight deduplication.
//!
//! While a call for a key is in flight, further calls for the same key do not run their own work;
//! they wait for the in-flight one and receive a clone of its output. Once it finishes the key is
//! forgotten, so the next call runs fresh.
use std::{collections::HashMap, fmt, hash::Hash, panic::AssertUnwindSafe, sync::Arc};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Error, Result};

type Flying<V> = Shared<BoxFuture<'static, Result<V>>>;

/// Deduplicates concurrent work by key. Cloning yields another handle onto the same set of flights.
pub struct Flight<K, V> {
    flights: Arc<Mutex<HashMap<K, Flying<V>>>>,
}

impl<K, V> Flight<K, V> {
    pub fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of keys currently in flight.
    pub fn len(&self) -> usize {
        self.flights.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.lock().is_empty()
    }
}

impl<K, V> Flight<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Run `fut` for `key`, or join the run already in flight for it (dropping `fut`).
    ///
    /// The work runs on its own task: callers that stop waiting do not cancel it for the others.
    /// A panic in the work is reported to every joined caller as [`Error::Panicked`].
    pub async fn call<Fut>(&self, key: K, fut: Fut) -> Result<V>
    where
        Fut: Future<Output = V> + Send + 'static,
    {
        let flying = {
            let mut flights = self.flights.lock();
            match flights.get(&key) {
                Some(flying) => flying.clone(),
                None => {
                    let flying = self.launch(key.clone(), fut);
                    flights.insert(key, flying.clone());
                    flying
                }
            }
        };
        flying.await
    }

    // Called with the map locked, so the task's own removal cannot run before the insert.
    fn launch<Fut>(&self, key: K, fut: Fut) -> Flying<V>
    where
        Fut: Future<Output = V> + Send + 'static,
    {
        let flights = Arc::clone(&self.flights);
        let handle = tokio::spawn(async move {
            let output = AssertUnwindSafe(fut)
                .catch_unwind()
                .await
                .map_err(Error::from_panic);
            flights.lock().remove(&key);
            trace!("flight landed");
            output
        });
        handle
            .map(|joined| match joined {
                Ok(output) => output,
                Err(err) if err.is_panic() => Err(Error::from_panic(err.into_panic())),
                Err(_) => Err(Error::Canceled),
            })
            .boxed()
            .shared()
    }
}

impl<K, V> Default for Flight<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for Flight<K, V> {
    fn clone(&self) -> Self {
        Self {
            flights: Arc::clone(&self.flights),
        }
    }
}

impl<K, V> fmt::Debug for Flight<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flight").field("in_flight", &self.len()).finish()
    }
}
