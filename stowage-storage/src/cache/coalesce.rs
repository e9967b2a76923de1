//! Request coalescing for upstream revalidation.
//!
//! At most one fetch per key is in flight. The first caller for a key
//! becomes the leader and starts the work in a spawned task; later callers
//! attach to the same shared future and receive a clone of its outcome.
//!
//! The work runs detached from every caller, so a caller that stops waiting
//! (timeout, client disconnect) never cancels it. The task removes its own
//! table entry when it finishes.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};

/// Shared handle to an in-flight outcome.
pub type FlightFuture<V> = Shared<BoxFuture<'static, V>>;

/// A caller's handle on a flight.
pub struct Flight<V: Clone> {
    leader: bool,
    outcome: FlightFuture<V>,
}

impl<V> Flight<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Whether this caller started the flight.
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Wait for the outcome, giving up after `timeout`.
    ///
    /// Returns `None` on timeout. Giving up leaves the flight running.
    pub async fn wait(self, timeout: Duration) -> Option<V> {
        tokio::time::timeout(timeout, self.outcome).await.ok()
    }
}

struct InFlight<V: Clone> {
    id: u64,
    outcome: FlightFuture<V>,
}

/// Removes a flight's entry when its task ends, including by panic.
struct ClearOnDrop<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    table: Arc<DashMap<K, InFlight<V>>>,
    key: K,
    id: u64,
}

impl<K, V> Drop for ClearOnDrop<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    fn drop(&mut self) {
        let id = self.id;
        self.table.remove_if(&self.key, |_, flight| flight.id == id);
    }
}

/// Keyed table of in-flight operations.
pub struct Coalescer<K, V: Clone> {
    inflight: Arc<DashMap<K, InFlight<V>>>,
    next_id: AtomicU64,
}

impl<K, V> Coalescer<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Attach to the flight for `key`, starting one with `start` if none is
    /// in flight.
    ///
    /// `start` is only called by the leader. `on_abort` produces the outcome
    /// if the spawned task panics or is cancelled by runtime shutdown.
    /// Must be called from within a tokio runtime.
    pub fn join<S, Fut, A>(&self, key: K, start: S, on_abort: A) -> Flight<V>
    where
        S: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
        A: FnOnce(String) -> V + Send + 'static,
    {
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(entry) => Flight {
                leader: false,
                outcome: entry.get().outcome.clone(),
            },
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let table = Arc::clone(&self.inflight);
                let work = start();

                let handle = tokio::spawn(async move {
                    let _clear = ClearOnDrop { table, key, id };
                    work.await
                });

                let outcome = async move {
                    match handle.await {
                        Ok(outcome) => outcome,
                        Err(join_error) => on_abort(join_error.to_string()),
                    }
                }
                .boxed()
                .shared();

                entry.insert(InFlight {
                    id,
                    outcome: outcome.clone(),
                });

                Flight {
                    leader: true,
                    outcome,
                }
            }
        }
    }

    /// Number of keys with a flight in progress.
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_inflight(&self, key: &K) -> bool {
        self.inflight.contains_key(key)
    }
}

impl<K, V> Default for Coalescer<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
