//! In-process serialisation primitives
//!
//! Two distinct needs: discovery runs once per user at a time
//! (`SingleFlight`, second caller gets a conflict), and matcher work on one
//! (user, payee, direction, currency) key queues behind a keyed async lock
//! so obligation transitions stay linearly ordered.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::models::Direction;

/// Per-user single-flight registry for the discovery path
#[derive(Default)]
pub struct SingleFlight {
    in_flight: Mutex<HashSet<i64>>,
}

impl SingleFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the user slot; None while another run is in flight
    pub fn try_begin(self: &Arc<Self>, user_id: i64) -> Option<SingleFlightGuard> {
        let mut in_flight = self.in_flight.lock().expect("single-flight lock poisoned");
        if !in_flight.insert(user_id) {
            return None;
        }
        Some(SingleFlightGuard {
            flight: Arc::clone(self),
            user_id,
        })
    }
}

/// Releases the user slot on drop
pub struct SingleFlightGuard {
    flight: Arc<SingleFlight>,
    user_id: i64,
}

impl Drop for SingleFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.flight.in_flight.lock() {
            in_flight.remove(&self.user_id);
        }
    }
}

/// Identity of a matcher serialisation domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub user_id: i64,
    pub payee_id: i64,
    pub direction: Direction,
    pub currency_id: i64,
}

/// Keyed async mutexes; all matcher operations on one key queue up
#[derive(Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<MatchKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire the lock for a key, waiting behind any holder
    pub async fn acquire(&self, key: MatchKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut inner = self.inner.lock().expect("keyed-locks registry poisoned");
            Arc::clone(inner.entry(key).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight_conflicts_until_released() {
        let flight = SingleFlight::new();

        let guard = flight.try_begin(1).unwrap();
        assert!(flight.try_begin(1).is_none());
        // A different user is unaffected
        assert!(flight.try_begin(2).is_some());

        drop(guard);
        assert!(flight.try_begin(1).is_some());
    }

    #[tokio::test]
    async fn test_keyed_locks_serialise_same_key() {
        let locks = KeyedLocks::new();
        let key = MatchKey {
            user_id: 1,
            payee_id: 2,
            direction: Direction::Debit,
            currency_id: 3,
        };

        let guard = locks.acquire(key).await;

        let locks2 = Arc::clone(&locks);
        let contender = tokio::spawn(async move {
            let _guard = locks2.acquire(key).await;
        });

        // The contender cannot finish while the first guard is held
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}
