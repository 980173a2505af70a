//! In-process single-flight table.
//!
//! The first caller for a fingerprint becomes the leader and owns a watch
//! channel; later callers for the same fingerprint subscribe to it instead of
//! generating. The table entry lives exactly as long as the leader. A result
//! published with `complete` reaches current followers at once, and callers
//! that join before the leader is dropped see it too. Followers of a leader
//! dropped without a result see a closed channel.

// Author: kelexine (https://github.com/kelexine)

use crate::cache::fingerprint::Fingerprint;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

type Flights<V> = Arc<Mutex<HashMap<Fingerprint, watch::Receiver<Option<V>>>>>;

/// Fingerprint → in-progress marker, shared by clones of one generator.
pub(crate) struct FlightTable<V> {
    flights: Flights<V>,
}

/// What a caller should do after joining the table.
pub(crate) enum Role<V> {
    Leader(FlightLeader<V>),
    Follower(FlightFollower<V>),
}

pub(crate) struct FlightLeader<V> {
    fingerprint: Fingerprint,
    tx: watch::Sender<Option<V>>,
    flights: Flights<V>,
}

pub(crate) struct FlightFollower<V> {
    rx: watch::Receiver<Option<V>>,
}

impl<V: Clone> FlightTable<V> {
    pub(crate) fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Joins the flight for `fingerprint`, starting one if none is running.
    pub(crate) fn join(&self, fingerprint: &Fingerprint) -> Role<V> {
        let mut flights = self.flights.lock();
        if let Some(rx) = flights.get(fingerprint) {
            return Role::Follower(FlightFollower { rx: rx.clone() });
        }

        let (tx, rx) = watch::channel(None);
        flights.insert(fingerprint.clone(), rx);
        Role::Leader(FlightLeader {
            fingerprint: fingerprint.clone(),
            tx,
            flights: Arc::clone(&self.flights),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.flights.lock().len()
    }
}

impl<V> Clone for FlightTable<V> {
    fn clone(&self) -> Self {
        Self {
            flights: Arc::clone(&self.flights),
        }
    }
}

impl<V> FlightLeader<V> {
    /// Publishes the result to every follower. The flight closes when the
    /// leader is dropped.
    pub(crate) fn complete(&self, value: V) {
        self.tx.send_replace(Some(value));
    }
}

impl<V> Drop for FlightLeader<V> {
    fn drop(&mut self) {
        self.flights.lock().remove(&self.fingerprint);
    }
}

impl<V: Clone> FlightFollower<V> {
    /// Waits for the leader. `None` means the leader went away without a result.
    pub(crate) async fn wait(mut self) -> Option<V> {
        match self.rx.wait_for(|value| value.is_some()).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::GenerationRequest;

    fn fp() -> Fingerprint {
        GenerationRequest::builder("m1", "op").build().fingerprint().unwrap()
    }

    #[tokio::test]
    async fn test_second_caller_follows() {
        let table = FlightTable::<u32>::new();
        let Role::Leader(leader) = table.join(&fp()) else {
            panic!("first caller should lead");
        };
        let Role::Follower(follower) = table.join(&fp()) else {
            panic!("second caller should follow");
        };

        let waiting = tokio::spawn(follower.wait());
        tokio::task::yield_now().await;
        leader.complete(7);
        assert_eq!(waiting.await.unwrap(), Some(7));

        drop(leader);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_dropped_leader_releases_followers() {
        let table = FlightTable::<u32>::new();
        let leader = table.join(&fp());
        let Role::Follower(follower) = table.join(&fp()) else {
            panic!("second caller should follow");
        };

        drop(leader);
        assert_eq!(follower.wait().await, None);
        assert!(matches!(table.join(&fp()), Role::Leader(_)));
    }

    #[tokio::test]
    async fn test_late_follower_sees_result() {
        let table = FlightTable::<&'static str>::new();
        let Role::Leader(leader) = table.join(&fp()) else {
            panic!("first caller should lead");
        };
        let Role::Follower(follower) = table.join(&fp()) else {
            panic!("second caller should follow");
        };

        leader.complete("done");
        drop(leader);
        // The follower only starts waiting after the flight closed
        assert_eq!(follower.wait().await, Some("done"));
    }

    #[tokio::test]
    async fn test_joining_after_completion_gets_result() {
        let table = FlightTable::<u32>::new();
        let Role::Leader(leader) = table.join(&fp()) else {
            panic!("first caller should lead");
        };
        leader.complete(3);

        let Role::Follower(follower) = table.join(&fp()) else {
            panic!("flight is still open until the leader drops");
        };
        assert_eq!(follower.wait().await, Some(3));
    }
}
