//! Per-key single-flight: one caller does the work, concurrent callers for
//! the same key wait for its result.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Outcome shared with followers. Errors travel as their display text since
/// `CaError` is not `Clone`.
pub(crate) type Shared<T> = Result<T, String>;

/// One in-progress computation.
pub(crate) struct Flight<T> {
    result: Mutex<Option<Shared<T>>>,
    done: Condvar,
}

impl<T: Clone> Flight<T> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    /// Blocks until the leader publishes a result.
    pub(crate) fn wait(&self) -> Shared<T> {
        let mut result = lock(&self.result);
        loop {
            if let Some(outcome) = result.as_ref() {
                return outcome.clone();
            }
            result = self
                .done
                .wait(result)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn publish(&self, outcome: Shared<T>) {
        let mut result = lock(&self.result);
        if result.is_none() {
            *result = Some(outcome);
        }
        self.done.notify_all();
    }
}

/// What [`SingleFlight::join`] made of the caller.
pub(crate) enum Role<'a, T: Clone> {
    Leader(LeaderGuard<'a, T>),
    Follower(Arc<Flight<T>>),
}

/// The set of keys currently being worked on.
pub(crate) struct SingleFlight<T> {
    flights: Mutex<HashMap<String, Arc<Flight<T>>>>,
}

impl<T: Clone> SingleFlight<T> {
    pub(crate) fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Becomes the leader for `key`, or follows the existing leader.
    pub(crate) fn join(&self, key: &str) -> Role<'_, T> {
        let mut flights = lock(&self.flights);
        if let Some(flight) = flights.get(key) {
            return Role::Follower(Arc::clone(flight));
        }
        let flight = Arc::new(Flight::new());
        flights.insert(key.to_string(), Arc::clone(&flight));
        Role::Leader(LeaderGuard {
            group: self,
            key: key.to_string(),
            flight,
            finished: false,
        })
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        lock(&self.flights).len()
    }
}

/// Held by the leader. Dropping it without [`complete`](Self::complete)
/// (an early return or a panic) releases followers with an error.
pub(crate) struct LeaderGuard<'a, T: Clone> {
    group: &'a SingleFlight<T>,
    key: String,
    flight: Arc<Flight<T>>,
    finished: bool,
}

impl<T: Clone> LeaderGuard<'_, T> {
    pub(crate) fn complete(mut self, outcome: Shared<T>) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: Shared<T>) {
        self.finished = true;
        {
            let mut flights = lock(&self.group.flights);
            if flights
                .get(&self.key)
                .is_some_and(|current| Arc::ptr_eq(current, &self.flight))
            {
                flights.remove(&self.key);
            }
        }
        self.flight.publish(outcome);
    }
}

impl<T: Clone> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(Err("issuing thread abandoned the request".to_string()));
        }
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
