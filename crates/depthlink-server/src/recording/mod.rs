//! Continuous recording of provider streams
//!
//! Frames are piped into one encoder process per (device, stream kind). Every
//! segment the encoders are rolled over into a new chunk; finished chunks are
//! rescaled to the nominal segment length and later concatenated into one
//! video per recording session. Provenance is kept in the ledger.

pub mod encoder;
pub mod ledger;
pub mod naming;
pub mod processor;
pub mod recorder;

pub use encoder::{EncoderBackend, FfmpegBackend};
pub use ledger::Ledger;
pub use processor::ChunkProcessor;
pub use recorder::RecorderHandle;

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger serialization failed: {0}")]
    Ledger(#[from] serde_json::Error),

    #[error("Encoder failed: {0}")]
    Encoder(String),

    #[error("Unexpected encoder output: {0}")]
    Probe(String),
}

pub type Result<T> = std::result::Result<T, RecordingError>;

/// Lifecycle of one encoder process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderStatus {
    NotStarted,
    Started,
    /// Graceful stop requested, process still flushing
    Ending,
    Ended,
}

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub output_path: PathBuf,
    pub segment_length: Duration,
    pub rollover_grace: Duration,
    /// A device without frames for this long is retired at its next rollover
    pub idle_timeout: Duration,
    pub stop_timeout: Duration,
    pub normalize_interval: Duration,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Frames buffered per encoder before new frames are dropped
    pub encoder_queue: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_path: PathBuf::from("./recordings"),
            segment_length: Duration::from_millis(15_000),
            rollover_grace: Duration::from_millis(100),
            idle_timeout: Duration::from_millis(30_000),
            stop_timeout: Duration::from_millis(10_000),
            normalize_interval: Duration::from_millis(30_000),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            encoder_queue: 64,
        }
    }
}
