//! Capture boundary
//!
//! Packet sources hand out bursts of raw frames with their arrival
//! timestamps. Retrieval never blocks: an idle source returns
//! [`Burst::Empty`], a finished one [`Burst::Exhausted`].
//!
//! Supported sources:
//! - PCAP file replay (`PcapFileSource`)
//! - In-memory replay (`ReplaySource`)
//! - Frames pushed from another thread (`ChannelSource`)

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, TryRecvError};
use pcap_file::pcap::PcapReader;
use pcap_file::DataLink;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::LinkLayer;
use crate::error::{FlowError, Result};

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Maximum frames retrieved per call
    pub burst_size: usize,
    /// Link layer of live sources
    pub link_layer: LinkLayer,
    /// PCAP file to replay instead of a live source
    pub pcap_file: Option<PathBuf>,
    /// Sleep after an empty burst (µs)
    pub idle_backoff_us: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            burst_size: 32,
            link_layer: LinkLayer::Ethernet,
            pcap_file: None,
            idle_backoff_us: 100,
        }
    }
}

/// One captured frame
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, timestamp: DateTime<Utc>) -> Self {
        Self { data, timestamp }
    }
}

/// Result of one retrieval call
#[derive(Debug, PartialEq)]
pub enum Burst {
    /// Between 1 and `max` frames
    Frames(Vec<RawFrame>),
    /// Nothing available right now
    Empty,
    /// The source will never produce another frame
    Exhausted,
}

/// Trait for packet capture implementations
pub trait PacketSource: Send {
    /// Retrieve up to `max` frames without blocking
    fn next_burst(&mut self, max: usize) -> Result<Burst>;

    /// Link layer of the frames this source produces
    fn link_layer(&self) -> LinkLayer;

    /// Short description for logging
    fn name(&self) -> &str;
}

/// Replays a classic libpcap file
pub struct PcapFileSource {
    reader: PcapReader<BufReader<File>>,
    link: LinkLayer,
    name: String,
    done: bool,
}

impl PcapFileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let reader = PcapReader::new(BufReader::new(file)).map_err(pcap_error)?;

        let datalink = reader.header().datalink;
        let link = match datalink {
            DataLink::ETHERNET => LinkLayer::Ethernet,
            DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => LinkLayer::RawIp,
            other => {
                return Err(FlowError::Config(format!(
                    "{}: unsupported datalink {:?}",
                    path.display(),
                    other
                )))
            }
        };

        info!("Opened pcap {} (datalink {:?})", path.display(), datalink);
        Ok(Self {
            reader,
            link,
            name: path.display().to_string(),
            done: false,
        })
    }
}

/// Upper bound on frames preallocated per burst
const PREALLOC_FRAMES: usize = 1024;

fn pcap_error(e: pcap_file::PcapError) -> FlowError {
    FlowError::Io(io::Error::new(io::ErrorKind::InvalidData, e))
}

impl PacketSource for PcapFileSource {
    fn next_burst(&mut self, max: usize) -> Result<Burst> {
        if self.done {
            return Ok(Burst::Exhausted);
        }

        let mut frames = Vec::with_capacity(max.min(PREALLOC_FRAMES));
        while frames.len() < max {
            match self.reader.next_packet() {
                Some(Ok(packet)) => {
                    let timestamp = DateTime::<Utc>::from(UNIX_EPOCH + packet.timestamp);
                    frames.push(RawFrame::new(packet.data.into_owned(), timestamp));
                }
                Some(Err(e)) => return Err(pcap_error(e)),
                None => {
                    debug!("Reached end of {}", self.name);
                    self.done = true;
                    break;
                }
            }
        }

        if frames.is_empty() {
            Ok(Burst::Exhausted)
        } else {
            Ok(Burst::Frames(frames))
        }
    }

    fn link_layer(&self) -> LinkLayer {
        self.link
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Replays frames held in memory
pub struct ReplaySource {
    frames: VecDeque<RawFrame>,
    link: LinkLayer,
}

impl ReplaySource {
    pub fn new(frames: Vec<RawFrame>, link: LinkLayer) -> Self {
        Self {
            frames: frames.into(),
            link,
        }
    }
}

impl PacketSource for ReplaySource {
    fn next_burst(&mut self, max: usize) -> Result<Burst> {
        if self.frames.is_empty() {
            return Ok(Burst::Exhausted);
        }
        let n = max.min(self.frames.len());
        Ok(Burst::Frames(self.frames.drain(..n).collect()))
    }

    fn link_layer(&self) -> LinkLayer {
        self.link
    }

    fn name(&self) -> &str {
        "replay"
    }
}

/// Frames delivered through a channel; exhausted once every sender is gone
pub struct ChannelSource {
    rx: Receiver<RawFrame>,
    link: LinkLayer,
}

impl ChannelSource {
    pub fn new(rx: Receiver<RawFrame>, link: LinkLayer) -> Self {
        Self { rx, link }
    }
}

impl PacketSource for ChannelSource {
    fn next_burst(&mut self, max: usize) -> Result<Burst> {
        let mut frames = Vec::new();
        while frames.len() < max {
            match self.rx.try_recv() {
                Ok(frame) => frames.push(frame),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if frames.is_empty() {
                        return Ok(Burst::Exhausted);
                    }
                    break;
                }
            }
        }

        if frames.is_empty() {
            Ok(Burst::Empty)
        } else {
            Ok(Burst::Frames(frames))
        }
    }

    fn link_layer(&self) -> LinkLayer {
        self.link
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Build the sources described by `config`
pub fn create_sources(config: &CaptureConfig) -> Result<Vec<Box<dyn PacketSource>>> {
    match &config.pcap_file {
        Some(path) => Ok(vec![Box::new(PcapFileSource::open(path)?)]),
        None => Err(FlowError::Config(
            "no packet source configured (set capture.pcap_file or pass --pcap)".to_string(),
        )),
    }
}
