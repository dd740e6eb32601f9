//! Bidirectional flow feature extraction
//!
//! Captured frames are normalized into packets, grouped into
//! direction-normalized flows and summarized with streaming statistics.
//! Each flow is finalized exactly once (FIN/RST, idle timeout, lifetime cap,
//! eviction or shutdown) into a [`flow::FlowRecord`] and handed to a sink.

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod flow;

pub use config::Config;
pub use engine::{EngineState, FlowEngine, StatsSnapshot};
pub use error::{FlowError, Result};
pub use flow::{EndReason, FlowRecord};
