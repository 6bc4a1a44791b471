use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use relay_statsd::metric;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::stats::RouteStats;
use crate::statsd::RouteCounters;

/// What happens to a line submitted while the buffer is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Wait until the buffer has capacity. Lines are never dropped.
    Blocking,
    /// Drop the line and count it.
    #[default]
    DropOnFull,
}

/// The entry point of a route, feeding lines into the bounded buffer.
///
/// Many callers may submit concurrently, the background task is the only consumer.
#[derive(Debug)]
pub(crate) struct Gate {
    key: Arc<str>,
    policy: AdmissionPolicy,
    tx: RwLock<Option<mpsc::Sender<Bytes>>>,
    stats: Arc<RouteStats>,
}

impl Gate {
    /// Creates a gate with a buffer of `capacity` lines and returns the consuming end.
    pub fn new(
        key: Arc<str>,
        policy: AdmissionPolicy,
        capacity: usize,
        stats: Arc<RouteStats>,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        let gate = Self {
            key,
            policy,
            tx: RwLock::new(Some(tx)),
            stats,
        };
        (gate, rx)
    }

    /// Submits a line to the buffer according to the admission policy.
    ///
    /// Once the gate is closed, submitted lines are discarded.
    pub async fn submit(&self, line: Bytes) {
        if line.is_empty() {
            return;
        }

        relay_log::trace!(route = &*self.key, "dispatching {:?}", line);

        // Clone the sender so the lock is not held while waiting for capacity.
        let Some(tx) = self.tx.read().clone() else {
            relay_log::trace!(route = &*self.key, "route is shut down, discarding line");
            return;
        };

        // The buffered count is increased before the line is sent so it never falls below the
        // actual occupancy of the buffer.
        let permit = match self.policy {
            AdmissionPolicy::Blocking => match tx.reserve().await {
                Ok(permit) => permit,
                Err(_) => return self.closed(),
            },
            AdmissionPolicy::DropOnFull => match tx.try_reserve() {
                Ok(permit) => permit,
                Err(TrySendError::Full(())) => return self.full(),
                Err(TrySendError::Closed(())) => return self.closed(),
            },
        };

        // A caller waiting for capacity keeps its sender across `close`. Dropping the permit
        // returns the slot.
        if self.tx.read().is_none() {
            return self.closed();
        }

        self.stats.inc_buffered();
        permit.send(line);
    }

    /// Stops accepting lines. The consumer drains the buffer and terminates.
    ///
    /// Callers still waiting for capacity discard their line once they get a slot.
    pub fn close(&self) {
        self.tx.write().take();
    }

    fn full(&self) {
        self.stats.inc_dropped_queue_full();
        metric!(
            counter(RouteCounters::MetricsDropped) += 1,
            route = &*self.key,
            reason = "queue_full"
        );
    }

    fn closed(&self) {
        relay_log::trace!(route = &*self.key, "route is not running, discarding line");
    }
}
