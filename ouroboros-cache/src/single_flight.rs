//! Per-key computation deduplication
//!
//! The first caller for a key becomes the leader and receives a
//! [`FlightGuard`]; everyone arriving while the flight is open gets a
//! [`FlightWaiter`] that resolves to the leader's result. The guard removes
//! the flight when dropped, so a leader that panics or is cancelled releases
//! its waiters with [`CacheError::Cancelled`] instead of hanging them.

use crate::error::{CacheError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

type Outcome<T> = Option<Result<T>>;

struct Flight<T> {
    id: u64,
    rx: watch::Receiver<Outcome<T>>,
    started: Instant,
}

/// Registry of in-flight computations keyed by fingerprint
pub struct SingleFlight<T> {
    flights: Arc<DashMap<String, Flight<T>>>,
    next_id: AtomicU64,
}

/// What a caller should do for a key
pub enum Role<T> {
    /// Compute, then call [`FlightGuard::complete`]
    Leader(FlightGuard<T>),
    /// Wait for the leader
    Follower(FlightWaiter<T>),
}

impl<T: Clone + Send + Sync> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Join the flight for `key`, opening it if none is in progress
    pub fn join(&self, key: &str) -> Role<T> {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(flight) => Role::Follower(FlightWaiter {
                rx: flight.get().rx.clone(),
            }),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                slot.insert(Flight {
                    id,
                    rx,
                    started: Instant::now(),
                });
                Role::Leader(FlightGuard {
                    key: key.to_string(),
                    id,
                    tx: Some(tx),
                    flights: Arc::clone(&self.flights),
                })
            }
        }
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.flights.contains_key(key)
    }

    /// How long the flight for `key` has been open
    pub fn flight_age(&self, key: &str) -> Option<Duration> {
        self.flights.get(key).map(|f| f.started.elapsed())
    }

    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }
}

impl<T: Clone + Send + Sync> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Leadership of one flight
///
/// Dropping the guard without [`complete`](FlightGuard::complete) cancels the
/// flight for every waiter.
pub struct FlightGuard<T> {
    key: String,
    id: u64,
    tx: Option<watch::Sender<Outcome<T>>>,
    flights: Arc<DashMap<String, Flight<T>>>,
}

impl<T> FlightGuard<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish the result to all waiters and close the flight
    pub fn complete(mut self, result: Result<T>) {
        if let Some(tx) = self.tx.take() {
            // no receivers is fine
            let _ = tx.send(Some(result));
        }
    }
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        let id = self.id;
        // only remove our own flight, never a successor's
        self.flights.remove_if(&self.key, |_, flight| flight.id == id);
    }
}

/// Handle held by a caller that joined someone else's flight
pub struct FlightWaiter<T> {
    rx: watch::Receiver<Outcome<T>>,
}

impl<T: Clone> FlightWaiter<T> {
    /// Wait for the leader's result
    pub async fn wait(mut self) -> Result<T> {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(CacheError::Cancelled(
                "leader abandoned the computation".to_string(),
            ))
        })
    }
}

/// Cooperative cancellation signal for a computation
///
/// Cloning the token shares the signal; the paired [`CancelHandle`] fires it.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Create a connected handle/token pair
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled; never resolves if the handle is dropped unfired
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
