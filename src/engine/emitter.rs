//! Record emitter
//!
//! Decouples flow finalization from the sink. Producers (ingest workers,
//! expiry, shutdown flush) call [`Emitter::accept`], which never waits longer
//! than the configured block timeout. A dedicated drain thread moves records
//! from the bounded buffer into the sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FlowError, Result};
use crate::flow::FlowRecord;
use super::sink::RecordSink;
use super::stats::EngineStats;

/// How often the drain thread re-checks for shutdown while idle
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Behavior when the buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest buffered record to make room
    #[default]
    DropOldest,
    /// Wait up to `block_timeout_ms`, then drop the new record
    Block,
}

/// Emitter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Records buffered between producers and the sink
    pub buffer_size: usize,
    /// Full-buffer policy
    pub overflow: OverflowPolicy,
    /// Upper bound on a blocking `accept` (ms)
    pub block_timeout_ms: u64,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            buffer_size: 10_000,
            overflow: OverflowPolicy::DropOldest,
            block_timeout_ms: 50,
        }
    }
}

/// Bounded hand-off from flow finalization to the sink
pub struct Emitter {
    tx: Sender<FlowRecord>,
    rx: Receiver<FlowRecord>,
    policy: OverflowPolicy,
    block_timeout: Duration,
    closed: Arc<AtomicBool>,
    stats: Arc<EngineStats>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl Emitter {
    /// Create the emitter and start its drain thread
    pub fn start(config: &EmitterConfig, sink: Box<dyn RecordSink>, stats: Arc<EngineStats>) -> Result<Arc<Self>> {
        let emitter = Arc::new(Self::buffered(config, stats));

        let rx = emitter.rx.clone();
        let closed = emitter.closed.clone();
        let drain_stats = emitter.stats.clone();
        let handle = std::thread::Builder::new()
            .name("flow-emitter".to_string())
            .spawn(move || drain_loop(rx, sink, closed, drain_stats))?;
        *emitter.drain.lock() = Some(handle);

        info!(
            "Emitter started (buffer={}, overflow={:?})",
            config.buffer_size, config.overflow
        );
        Ok(emitter)
    }

    /// Emitter without a drain thread; records stay buffered
    pub fn buffered(config: &EmitterConfig, stats: Arc<EngineStats>) -> Self {
        let (tx, rx) = bounded(config.buffer_size.max(1));
        Self {
            tx,
            rx,
            policy: config.overflow,
            block_timeout: Duration::from_millis(config.block_timeout_ms),
            closed: Arc::new(AtomicBool::new(false)),
            stats,
            drain: Mutex::new(None),
        }
    }

    /// Hand a finalized record to the sink
    ///
    /// Never blocks longer than the configured timeout. Returns
    /// `EmitTimeout` when a blocking accept gives up, and `EmitterClosed`
    /// after shutdown.
    pub fn accept(&self, record: FlowRecord) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            EngineStats::incr(&self.stats.records_dropped);
            return Err(FlowError::EmitterClosed);
        }

        match self.policy {
            OverflowPolicy::DropOldest => self.accept_drop_oldest(record),
            OverflowPolicy::Block if self.block_timeout.is_zero() => match self.tx.try_send(record) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    EngineStats::incr(&self.stats.records_dropped);
                    Err(FlowError::EmitterFull)
                }
                Err(TrySendError::Disconnected(_)) => Err(FlowError::EmitterClosed),
            },
            OverflowPolicy::Block => match self.tx.send_timeout(record, self.block_timeout) {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => {
                    EngineStats::incr(&self.stats.records_dropped);
                    warn!("Emitter buffer full for {:?}, dropping record", self.block_timeout);
                    Err(FlowError::EmitTimeout(self.block_timeout.as_millis() as u64))
                }
                Err(SendTimeoutError::Disconnected(_)) => Err(FlowError::EmitterClosed),
            },
        }
    }

    fn accept_drop_oldest(&self, mut record: FlowRecord) -> Result<()> {
        loop {
            match self.tx.try_send(record) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    if let Ok(oldest) = self.rx.try_recv() {
                        EngineStats::incr(&self.stats.records_dropped);
                        debug!("Emitter buffer full, dropped record for flow {}", oldest.flow_id);
                    }
                    record = back;
                }
                Err(TrySendError::Disconnected(_)) => return Err(FlowError::EmitterClosed),
            }
        }
    }

    /// Records waiting for the sink
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Take buffered records directly (for emitters without a drain thread)
    pub fn drain_pending(&self) -> Vec<FlowRecord> {
        self.rx.try_iter().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting, write out everything buffered and flush the sink
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.drain.lock().take() {
            if handle.join().is_err() {
                warn!("Emitter drain thread panicked");
            }
        }
        info!("Emitter closed");
    }
}

impl Drop for Emitter {
    fn drop(&mut self) {
        self.close();
    }
}

fn drain_loop(
    rx: Receiver<FlowRecord>,
    mut sink: Box<dyn RecordSink>,
    closed: Arc<AtomicBool>,
    stats: Arc<EngineStats>,
) {
    debug!("Emitter drain thread started (sink={})", sink.name());

    loop {
        match rx.recv_timeout(DRAIN_POLL) {
            Ok(record) => write_record(sink.as_mut(), &record, &stats),
            Err(RecvTimeoutError::Timeout) => {
                if closed.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = sink.flush() {
                    EngineStats::incr(&stats.sink_errors);
                    warn!("Sink {} flush failed: {}", sink.name(), e);
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Producers are stopped by now; take whatever is left
    for record in rx.try_iter() {
        write_record(sink.as_mut(), &record, &stats);
    }
    if let Err(e) = sink.flush() {
        EngineStats::incr(&stats.sink_errors);
        warn!("Sink {} final flush failed: {}", sink.name(), e);
    }

    debug!("Emitter drain thread stopped");
}

fn write_record(sink: &mut dyn RecordSink, record: &FlowRecord, stats: &EngineStats) {
    match sink.write(record) {
        Ok(()) => EngineStats::incr(&stats.records_emitted),
        Err(e) => {
            EngineStats::incr(&stats.sink_errors);
            warn!("Sink {} rejected flow {}: {}", sink.name(), record.flow_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sink::tests::sample_record;
    use crate::engine::sink::MemorySink;
    use std::time::Instant;

    fn config(buffer_size: usize, overflow: OverflowPolicy) -> EmitterConfig {
        EmitterConfig {
            buffer_size,
            overflow,
            block_timeout_ms: 20,
        }
    }

    #[test]
    fn test_records_reach_sink() {
        let stats = Arc::new(EngineStats::new());
        let sink = MemorySink::new();
        let emitter = Emitter::start(&EmitterConfig::default(), Box::new(sink.clone()), stats.clone()).unwrap();

        for port in 0..100 {
            emitter.accept(sample_record(1000 + port)).unwrap();
        }
        assert!(!emitter.is_closed());
        emitter.close();
        assert!(emitter.is_closed());

        assert_eq!(sink.len(), 100);
        assert_eq!(stats.snapshot().records_emitted, 100);
        assert!(matches!(emitter.accept(sample_record(1)), Err(FlowError::EmitterClosed)));
    }

    #[test]
    fn test_drop_oldest_keeps_newest() {
        let stats = Arc::new(EngineStats::new());
        let emitter = Emitter::buffered(&config(3, OverflowPolicy::DropOldest), stats.clone());

        for port in 0..5 {
            emitter.accept(sample_record(2000 + port)).unwrap();
        }

        let ports: Vec<u16> = emitter.drain_pending().iter().map(|r| r.src_port).collect();
        assert_eq!(ports, vec![2002, 2003, 2004]);
        assert_eq!(stats.snapshot().records_dropped, 2);
    }

    #[test]
    fn test_block_without_timeout_reports_full() {
        let stats = Arc::new(EngineStats::new());
        let mut cfg = config(1, OverflowPolicy::Block);
        cfg.block_timeout_ms = 0;
        let emitter = Emitter::buffered(&cfg, stats.clone());

        emitter.accept(sample_record(3100)).unwrap();
        assert!(matches!(emitter.accept(sample_record(3101)), Err(FlowError::EmitterFull)));
        assert_eq!(emitter.drain_pending()[0].src_port, 3100);
    }

    #[test]
    fn test_block_times_out() {
        let stats = Arc::new(EngineStats::new());
        let emitter = Emitter::buffered(&config(1, OverflowPolicy::Block), stats.clone());

        emitter.accept(sample_record(3000)).unwrap();
        let started = Instant::now();
        let err = emitter.accept(sample_record(3001)).unwrap_err();

        assert!(matches!(err, FlowError::EmitTimeout(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(stats.snapshot().records_dropped, 1);
        assert_eq!(emitter.pending(), 1);
    }
}
