//! Collapses concurrent work for the same key into a single execution.
//!
//! The first caller for a key becomes the leader and runs the production
//! future. Callers arriving while the leader is still running subscribe to
//! its result instead of repeating the work:
//!
//! ```text
//! lookup A ─┐
//!           │                         leader
//! lookup B ─┼──► SingleFlight ──────► f().await
//!           │        │                   │
//! lookup C ─┘        ▼                   │
//!             [A, B, C receive  ◄────────┘
//!              the same result]
//! ```
//!
//! If the leader is dropped before finishing, its slot is released and the
//! waiters race to become the next leader rather than waiting forever.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::trace;

/// Errors are shared between every caller that joined the same flight.
pub type SharedError = Arc<anyhow::Error>;

pub type FlightResult<V> = std::result::Result<V, SharedError>;

enum Role<V> {
    Leader(broadcast::Sender<FlightResult<V>>),
    Waiter(broadcast::Receiver<FlightResult<V>>),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlightStats {
    /// Calls that ran the production future themselves.
    pub led: u64,
    /// Calls that waited on another caller's result.
    pub joined: u64,
}

pub struct SingleFlight<V> {
    in_flight: Mutex<HashMap<String, broadcast::Sender<FlightResult<V>>>>,
    led: AtomicU64,
    joined: AtomicU64,
}

impl<V: Clone> SingleFlight<V> {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            led: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// Runs `f` unless a call for `key` is already in flight, in which case
    /// the in-flight result is returned instead.
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> FlightResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        let mut rx = match self.register(key) {
            Role::Leader(tx) => return self.lead(key, tx, f).await,
            Role::Waiter(rx) => rx,
        };

        loop {
            match rx.recv().await {
                Ok(result) => return result,
                // A single value is ever sent per flight.
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => {
                    trace!(key, "In-flight leader went away, retrying");
                    match self.register(key) {
                        Role::Leader(tx) => return self.lead(key, tx, f).await,
                        Role::Waiter(next) => rx = next,
                    }
                }
            }
        }
    }

    async fn lead<F, Fut>(
        &self,
        key: &str,
        tx: broadcast::Sender<FlightResult<V>>,
        f: F,
    ) -> FlightResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        let result = {
            // Released on completion and on cancellation alike.
            let _slot = scopeguard::guard(key, |key| {
                self.lock().remove(key);
            });
            f().await.map_err(Arc::new)
        };

        // Everyone who subscribed before the slot was released gets this.
        let _ = tx.send(result.clone());
        result
    }

    fn register(&self, key: &str) -> Role<V> {
        let mut in_flight = self.lock();

        if let Some(tx) = in_flight.get(key) {
            self.joined.fetch_add(1, Ordering::Relaxed);
            trace!(key, "Joining in-flight lookup");
            return Role::Waiter(tx.subscribe());
        }

        let (tx, _) = broadcast::channel(1);
        in_flight.insert(key.to_owned(), tx.clone());
        self.led.fetch_add(1, Ordering::Relaxed);
        Role::Leader(tx)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    pub fn stats(&self) -> FlightStats {
        FlightStats {
            led: self.led.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<FlightResult<V>>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V: Clone> Default for SingleFlight<V> {
    fn default() -> Self {
        Self::new()
    }
}
