//! Ingest workers
//!
//! Each worker is an OS thread that owns one or more packet sources and
//! polls them round-robin, feeding bursts into the shared flow tracker.
//! Workers never block on the sink or the table; an idle round sleeps for
//! the configured backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::core::PacketNormalizer;
use crate::error::Result;
use crate::flow::FlowTracker;
use super::capture::{Burst, PacketSource};
use super::EngineState;

struct SourceSlot {
    source: Box<dyn PacketSource>,
    normalizer: PacketNormalizer,
}

/// Single ingestion thread
pub struct IngestWorker {
    id: usize,
    sources: Vec<SourceSlot>,
    tracker: Arc<FlowTracker>,
    burst_size: usize,
    idle_backoff: Duration,
    stop: Arc<AtomicBool>,
    state: Arc<RwLock<EngineState>>,
}

impl IngestWorker {
    pub fn new(
        id: usize,
        sources: Vec<Box<dyn PacketSource>>,
        tracker: Arc<FlowTracker>,
        burst_size: usize,
        idle_backoff: Duration,
        stop: Arc<AtomicBool>,
        state: Arc<RwLock<EngineState>>,
    ) -> Self {
        let sources = sources
            .into_iter()
            .map(|source| SourceSlot {
                normalizer: PacketNormalizer::new(source.link_layer()),
                source,
            })
            .collect();

        Self {
            id,
            sources,
            tracker,
            burst_size,
            idle_backoff,
            stop,
            state,
        }
    }

    /// Poll sources until they are exhausted or a stop is requested;
    /// returns the number of packets accepted
    pub fn run(mut self) -> Result<u64> {
        let names: Vec<&str> = self.sources.iter().map(|s| s.source.name()).collect();
        info!("Worker {} started ({})", self.id, names.join(", "));

        let mut accepted = 0u64;
        while !self.sources.is_empty() && !self.stop.load(Ordering::Acquire) {
            let mut idle = true;
            let mut i = 0;

            while i < self.sources.len() {
                let slot = &mut self.sources[i];
                let burst = match slot.source.next_burst(self.burst_size) {
                    Ok(burst) => burst,
                    Err(e) => {
                        error!("Worker {}: source {} failed: {}", self.id, slot.source.name(), e);
                        self.fail();
                        return Err(e);
                    }
                };

                match burst {
                    Burst::Frames(frames) => {
                        idle = false;
                        match self.tracker.ingest_burst(&slot.normalizer, &frames) {
                            Ok(n) => accepted += n as u64,
                            Err(e) if e.is_fatal() => {
                                error!("Worker {}: fatal ingest error: {}", self.id, e);
                                self.fail();
                                return Err(e);
                            }
                            Err(e) => warn!("Worker {}: burst from {} dropped: {}", self.id, slot.source.name(), e),
                        }
                        i += 1;
                    }
                    Burst::Empty => i += 1,
                    Burst::Exhausted => {
                        debug!("Worker {}: source {} exhausted", self.id, slot.source.name());
                        self.sources.swap_remove(i);
                    }
                }
            }

            if idle && !self.sources.is_empty() {
                std::thread::sleep(self.idle_backoff);
            }
        }

        info!("Worker {} stopped ({} packets)", self.id, accepted);
        Ok(accepted)
    }

    /// Flag the engine as failed and stop every other worker
    fn fail(&self) {
        *self.state.write() = EngineState::Error;
        self.stop.store(true, Ordering::Release);
    }

    /// Run on a dedicated OS thread
    pub fn spawn(self) -> Result<JoinHandle<Result<u64>>> {
        let handle = std::thread::Builder::new()
            .name(format!("flow-ingest-{}", self.id))
            .spawn(move || self.run())?;
        Ok(handle)
    }
}

/// Split `sources` round-robin over `workers` groups (0 = one per source)
pub fn distribute<T>(sources: Vec<T>, workers: usize) -> Vec<Vec<T>> {
    let count = if workers == 0 {
        sources.len()
    } else {
        workers.min(sources.len())
    };

    let mut groups: Vec<Vec<T>> = (0..count).map(|_| Vec::new()).collect();
    for (i, source) in sources.into_iter().enumerate() {
        groups[i % count].push(source);
    }
    groups
}
