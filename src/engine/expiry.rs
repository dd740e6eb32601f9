//! Periodic expiry sweep
//!
//! Runs as its own task, independent of ingestion. Each tick sweeps every
//! shard under the same lock ingestion uses, finalizing idle and over-age
//! flows.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::flow::FlowTracker;

/// Time base used to decide whether a flow has expired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockSource {
    /// System time, for live capture
    #[default]
    Wall,
    /// Latest packet timestamp seen, for replay
    Packet,
}

pub struct ExpiryScheduler {
    tracker: Arc<FlowTracker>,
    interval: Duration,
    clock: ClockSource,
}

impl ExpiryScheduler {
    pub fn new(tracker: Arc<FlowTracker>, interval: Duration, clock: ClockSource) -> Self {
        Self {
            tracker,
            interval,
            clock,
        }
    }

    fn now(&self) -> Option<DateTime<Utc>> {
        match self.clock {
            ClockSource::Wall => Some(Utc::now()),
            ClockSource::Packet => self.tracker.packet_clock(),
        }
    }

    /// Run one sweep; returns the number of flows finalized
    pub fn sweep_once(&self) -> usize {
        match self.now() {
            Some(now) => self.tracker.expire(now),
            None => 0,
        }
    }

    /// Sweep every interval until `shutdown` flips to true
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Expiry scheduler started (interval={:?}, clock={:?})", self.interval, self.clock);

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = self.sweep_once();
                        debug!("Expiry sweep finalized {} flows", expired);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Expiry scheduler stopped");
        })
    }
}
