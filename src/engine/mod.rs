//! Flow engine
//!
//! Multi-threaded ingestion with an independent expiry task and a
//! buffered emitter in front of the sink.
//!
//! # Architecture
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐     ┌──────────┐
//! │   Sources   │────▶│   Workers    │────▶│   Emitter    │────▶│   Sink   │
//! │ (pcap, ...) │     │ (N threads)  │     │  (bounded)   │     │          │
//! └─────────────┘     └──────────────┘     └──────────────┘     └──────────┘
//!                            │                    ▲
//!                            ▼                    │
//!                     ┌──────────────┐     ┌──────────────┐
//!                     │  Flow Table  │◀────│    Expiry    │
//!                     │  (sharded)   │     │  Scheduler   │
//!                     └──────────────┘     └──────────────┘
//! ```

pub mod capture;
pub mod emitter;
pub mod expiry;
pub mod sink;
pub mod stats;
pub mod workers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{FlowError, Result};
use crate::flow::{FlowTable, FlowTracker};

pub use capture::{Burst, CaptureConfig, ChannelSource, PacketSource, PcapFileSource, RawFrame, ReplaySource};
pub use emitter::{Emitter, EmitterConfig, OverflowPolicy};
pub use expiry::{ClockSource, ExpiryScheduler};
pub use sink::{open_sink, JsonLinesSink, MemorySink, NullSink, RecordSink, SinkConfig};
pub use stats::{EngineStats, StatsSnapshot};
pub use workers::IngestWorker;

/// How often `wait_for_sources` checks the workers
const WORKER_POLL: Duration = Duration::from_millis(10);

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Expiry sweep period (ms)
    pub expiry_interval_ms: u64,
    /// Ingest threads, 0 = one per source
    pub workers: usize,
    /// Time base for expiry
    pub clock: ClockSource,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            expiry_interval_ms: 1_000,
            workers: 0,
            clock: ClockSource::Wall,
        }
    }
}

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not started
    Stopped,
    /// Ingesting
    Running,
    /// Shutdown in progress
    Stopping,
    /// A worker hit a fatal error
    Error,
}

/// Main flow processing engine
pub struct FlowEngine {
    config: Config,
    state: Arc<RwLock<EngineState>>,
    stats: Arc<EngineStats>,
    table: Arc<FlowTable>,
    tracker: Arc<FlowTracker>,
    emitter: Arc<Emitter>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<Result<u64>>>,
    expiry: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl FlowEngine {
    /// Create an engine writing to `sink`; starts the emitter's drain thread
    pub fn new(config: Config, sink: Box<dyn RecordSink>) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(EngineStats::new());
        let emitter = Emitter::start(&config.emitter, sink, stats.clone())?;
        let table = Arc::new(FlowTable::new(&config.flow));
        let tracker = Arc::new(FlowTracker::new(&config.flow, table.clone(), emitter.clone(), stats.clone()));

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(EngineState::Stopped)),
            stats,
            table,
            tracker,
            emitter,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            expiry: None,
            shutdown_tx: None,
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<FlowTracker> {
        &self.tracker
    }

    /// Live flows
    pub fn active_flows(&self) -> usize {
        self.table.len()
    }

    /// Start ingest workers over `sources` and the expiry task
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, sources: Vec<Box<dyn PacketSource>>) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != EngineState::Stopped {
                return Err(FlowError::Config(format!("engine cannot start from {:?}", *state)));
            }
            *state = EngineState::Running;
        }

        info!(
            "Starting flow engine ({} sources, {} shards, capacity {})",
            sources.len(),
            self.table.shard_count(),
            self.table.capacity()
        );

        let capture = &self.config.capture;
        for (id, group) in workers::distribute(sources, self.config.engine.workers).into_iter().enumerate() {
            let worker = IngestWorker::new(
                id,
                group,
                self.tracker.clone(),
                capture.burst_size,
                Duration::from_micros(capture.idle_backoff_us),
                self.stop.clone(),
                self.state.clone(),
            );
            self.workers.push(worker.spawn()?);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = ExpiryScheduler::new(
            self.tracker.clone(),
            Duration::from_millis(self.config.engine.expiry_interval_ms),
            self.config.engine.clock,
        );
        self.expiry = Some(scheduler.spawn(shutdown_rx));
        self.shutdown_tx = Some(shutdown_tx);

        info!("Flow engine started");
        Ok(())
    }

    /// True once every ingest worker has exited
    pub fn sources_finished(&self) -> bool {
        self.workers.iter().all(|w| w.is_finished())
    }

    /// Wait until every source is exhausted or a worker failed
    pub async fn wait_for_sources(&self) {
        while !self.sources_finished() {
            if self.state() == EngineState::Error {
                warn!("Ingest worker failed, no longer waiting for sources");
                return;
            }
            tokio::time::sleep(WORKER_POLL).await;
        }
    }

    /// Cooperative shutdown
    ///
    /// Stops intake, joins the workers, stops the expiry task, finalizes
    /// every live flow and drains the emitter into the sink.
    pub async fn shutdown(&mut self) -> Result<StatsSnapshot> {
        info!("Stopping flow engine...");
        *self.state.write() = EngineState::Stopping;

        self.stop.store(true, Ordering::Release);
        let mut first_error = None;
        for handle in self.workers.drain(..) {
            let joined = tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| FlowError::Invariant(format!("worker join task failed: {}", e)))?;
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!("Ingest worker exited with error: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    error!("Ingest worker panicked");
                    first_error.get_or_insert(FlowError::Invariant("ingest worker panicked".to_string()));
                }
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(expiry) = self.expiry.take() {
            if let Err(e) = expiry.await {
                warn!("Expiry task ended abnormally: {}", e);
            }
        }

        let flushed = self.tracker.flush_all();
        info!("Flushed {} live flows", flushed);

        let emitter = self.emitter.clone();
        tokio::task::spawn_blocking(move || emitter.close())
            .await
            .map_err(|e| FlowError::Invariant(format!("emitter close task failed: {}", e)))?;

        let snapshot = self.stats.snapshot();
        snapshot.log_summary();

        match first_error {
            Some(e) => {
                *self.state.write() = EngineState::Error;
                Err(e)
            }
            None => {
                *self.state.write() = EngineState::Stopped;
                info!("Flow engine stopped");
                Ok(snapshot)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LinkLayer;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.expiry_interval_ms, 1_000);
        assert_eq!(config.workers, 0);
        assert_eq!(config.clock, ClockSource::Wall);
    }

    #[tokio::test]
    async fn test_engine_lifecycle() {
        let mut engine = FlowEngine::new(Config::default(), Box::new(NullSink)).unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);

        engine.start(Vec::new()).unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(engine.start(Vec::new()).is_err());

        let snapshot = engine.shutdown().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(snapshot, StatsSnapshot::default());
    }

    struct BrokenSource;

    impl PacketSource for BrokenSource {
        fn next_burst(&mut self, _max: usize) -> Result<Burst> {
            Err(FlowError::Io(std::io::Error::new(std::io::ErrorKind::Other, "interface down")))
        }

        fn link_layer(&self) -> LinkLayer {
            LinkLayer::Ethernet
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_worker_failure_stops_engine() {
        let mut engine = FlowEngine::new(Config::default(), Box::new(NullSink)).unwrap();

        // The channel stays open, so its worker only exits on a stop request
        let (_tx, rx) = crossbeam_channel::unbounded::<RawFrame>();
        let sources: Vec<Box<dyn PacketSource>> = vec![
            Box::new(BrokenSource),
            Box::new(ChannelSource::new(rx, LinkLayer::Ethernet)),
        ];
        engine.start(sources).unwrap();

        tokio::time::timeout(Duration::from_secs(5), engine.wait_for_sources())
            .await
            .expect("wait_for_sources returns after a worker failure");
        assert_eq!(engine.state(), EngineState::Error);

        let result = tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
            .await
            .expect("shutdown joins the remaining workers");
        assert!(matches!(result, Err(FlowError::Io(_))));
        assert_eq!(engine.state(), EngineState::Error);
    }
}
