//! Record sinks
//!
//! The external transport that receives finalized flow records. Sinks are
//! driven by the emitter's drain thread only, so they need `Send` but not
//! `Sync`.

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::flow::FlowRecord;

/// Destination for finalized flow records
pub trait RecordSink: Send {
    /// Write one record
    fn write(&mut self, record: &FlowRecord) -> Result<()>;

    /// Push buffered output to the transport
    fn flush(&mut self) -> Result<()>;

    /// Short name for logging
    fn name(&self) -> &str;
}

/// Sink configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    /// JSON lines on standard output
    Stdout,
    /// JSON lines appended to a file
    File { path: PathBuf },
    /// Discard records
    Null,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::Stdout
    }
}

/// Open the sink described by `config`
pub fn open_sink(config: &SinkConfig) -> Result<Box<dyn RecordSink>> {
    match config {
        SinkConfig::Stdout => Ok(Box::new(JsonLinesSink::stdout())),
        SinkConfig::File { path } => Ok(Box::new(JsonLinesSink::file(path)?)),
        SinkConfig::Null => Ok(Box::new(NullSink)),
    }
}

/// One JSON object per line
pub struct JsonLinesSink<W: Write + Send> {
    writer: BufWriter<W>,
    name: String,
}

impl JsonLinesSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout(), "stdout")
    }
}

impl JsonLinesSink<std::fs::File> {
    /// Append to `path`, creating it if needed
    pub fn file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(file, &path.display().to_string()))
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W, name: &str) -> Self {
        Self {
            writer: BufWriter::new(writer),
            name: name.to_string(),
        }
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| FlowError::Io(e.into_error()))
    }
}

impl<W: Write + Send> RecordSink for JsonLinesSink<W> {
    fn write(&mut self, record: &FlowRecord) -> Result<()> {
        let line = record.to_json().map_err(io::Error::from)?;
        writeln!(self.writer, "{}", line)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Collects records in memory; clones share the same buffer
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<FlowRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far
    pub fn records(&self) -> Vec<FlowRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordSink for MemorySink {
    fn write(&mut self, record: &FlowRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

pub struct NullSink;

impl RecordSink for NullSink {
    fn write(&mut self, _record: &FlowRecord) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}
