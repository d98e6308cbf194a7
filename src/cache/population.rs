//! Per-key population locks
//!
//! A map of one-shot completion signals keyed by cache key. The first caller
//! to miss on a key becomes the leader and runs the factory; later callers
//! subscribe to the leader's signal and receive its outcome. Entries are
//! removed as soon as the leader finishes, fails or is dropped, so locks never
//! outlive one population window.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::error::Error;

/// Default ceiling on how long one population may take (30 seconds)
pub const DEFAULT_POPULATION_TIMEOUT: Duration = Duration::from_secs(30);

/// What the leader hands to waiters: the value's string form or the error
pub type Outcome = std::result::Result<Arc<str>, Error>;

type Signal = Arc<watch::Sender<Option<Outcome>>>;

/// Result of trying to take the lock for a key
pub enum Claim<'a> {
    /// Caller must populate the key and `complete` the guard
    Leader(PopulationGuard<'a>),
    /// Another caller is populating; wait on the receiver
    Follower(watch::Receiver<Option<Outcome>>),
}

/// What a follower observed
#[derive(Debug)]
pub enum Wait {
    /// The leader finished (or the ceiling elapsed, as an error outcome)
    Done(Outcome),
    /// The leader went away without an outcome; try again
    Abandoned,
}

/// Registry of in-flight populations
pub struct PopulationLocks {
    inflight: DashMap<String, Signal>,
    ceiling: Duration,
}

impl PopulationLocks {
    pub fn new(ceiling: Duration) -> Self {
        Self {
            inflight: DashMap::new(),
            ceiling,
        }
    }

    /// Ceiling applied to leaders and waiters alike
    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Number of keys currently being populated
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }

    /// Become the leader for `key`, or subscribe to the current leader
    pub fn claim(&self, key: &str) -> Claim<'_> {
        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(occupied) => Claim::Follower(occupied.get().subscribe()),
            Entry::Vacant(vacant) => {
                let (sender, _) = watch::channel(None);
                let signal = Arc::new(sender);
                vacant.insert(Arc::clone(&signal));
                Claim::Leader(PopulationGuard {
                    locks: self,
                    key: key.to_string(),
                    signal,
                })
            }
        }
    }

    /// Wait for the leader's outcome, at most `ceiling`
    pub async fn wait(&self, key: &str, mut receiver: watch::Receiver<Option<Outcome>>) -> Wait {
        match tokio::time::timeout(self.ceiling, receiver.wait_for(Option::is_some)).await {
            Ok(Ok(state)) => match (*state).clone() {
                Some(outcome) => Wait::Done(outcome),
                None => Wait::Abandoned,
            },
            Ok(Err(_)) => {
                tracing::debug!(key = %key, "Population leader dropped, retrying");
                Wait::Abandoned
            }
            Err(_) => {
                tracing::debug!(key = %key, "Timed out waiting for population");
                Wait::Done(Err(self.timeout_error(key)))
            }
        }
    }

    pub fn timeout_error(&self, key: &str) -> Error {
        Error::PopulationTimeout {
            key: key.to_string(),
            ceiling_ms: self.ceiling.as_millis() as u64,
        }
    }

    fn release(&self, key: &str, signal: &Signal) {
        self.inflight
            .remove_if(key, |_, current| Arc::ptr_eq(current, signal));
    }
}

impl Default for PopulationLocks {
    fn default() -> Self {
        Self::new(DEFAULT_POPULATION_TIMEOUT)
    }
}

/// Held by the leader of a population.
///
/// Dropping the guard without `complete` releases the key and wakes waiters
/// with `Wait::Abandoned`.
pub struct PopulationGuard<'a> {
    locks: &'a PopulationLocks,
    key: String,
    signal: Signal,
}

impl PopulationGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish the outcome to every waiter and release the key
    pub fn complete(self, outcome: Outcome) {
        self.signal.send_replace(Some(outcome));
    }
}

impl Drop for PopulationGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.key, &self.signal);
    }
}

// =============================================================================
// Tests
// =============================================================================
