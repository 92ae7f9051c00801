//! Request coalescing for cache-miss recomputation.
//!
//! The first caller for a key becomes the leader and runs the computation. Callers that arrive
//! while it is in flight subscribe to the leader's outcome instead of computing it again. A
//! leader that is dropped before finishing releases the key, and its followers race to become the
//! next leader.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::counter;
use tokio::sync::watch;
use tracing::debug;

use crate::infra::telemetry::METRIC_COALESCED_TOTAL;

use super::keys::CacheKey;

type Slot<T, E> = Option<Result<T, E>>;

struct Flight<T, E> {
    id: u64,
    outcome: watch::Receiver<Slot<T, E>>,
}

/// Deduplicates concurrent computations per [`CacheKey`] within one domain.
pub struct RequestCoalescer<T, E> {
    domain: &'static str,
    flights: DashMap<CacheKey, Flight<T, E>>,
    next_flight: AtomicU64,
}

impl<T, E> RequestCoalescer<T, E>
where
    T: Clone + Send + Sync,
    E: Clone + Send + Sync,
{
    pub fn new(domain: &'static str) -> Self {
        Self {
            domain,
            flights: DashMap::new(),
            next_flight: AtomicU64::new(0),
        }
    }

    pub fn domain(&self) -> &'static str {
        self.domain
    }

    /// Number of keys with a computation currently in flight.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Run `compute` for `key` unless a computation for it is already in flight, in which case
    /// wait for and return that computation's outcome.
    pub async fn run<F, Fut>(&self, key: CacheKey, compute: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (flight_id, sender) = loop {
            let mut outcome = match self.flights.entry(key) {
                Entry::Occupied(occupied) => occupied.get().outcome.clone(),
                Entry::Vacant(vacant) => {
                    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                    let (sender, outcome) = watch::channel(None);
                    vacant.insert(Flight { id, outcome });
                    break (id, sender);
                }
            };

            counter!(METRIC_COALESCED_TOTAL, "domain" => self.domain).increment(1);
            debug!(domain = self.domain, key = %key, "Joining in-flight computation");
            match outcome.wait_for(Option::is_some).await {
                Ok(slot) => {
                    if let Some(result) = slot.clone() {
                        return result;
                    }
                }
                Err(_) => {
                    debug!(domain = self.domain, key = %key, "Leader abandoned computation");
                }
            }
        };

        let _release = FlightRelease {
            flights: &self.flights,
            key,
            id: flight_id,
        };
        let result = compute().await;
        sender.send_replace(Some(result.clone()));
        result
    }
}

struct FlightRelease<'a, T, E> {
    flights: &'a DashMap<CacheKey, Flight<T, E>>,
    key: CacheKey,
    id: u64,
}

impl<T, E> Drop for FlightRelease<'_, T, E> {
    fn drop(&mut self) {
        self.flights
            .remove_if(&self.key, |_, flight| flight.id == self.id);
    }
}
