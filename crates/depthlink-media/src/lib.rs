//! Media processing for Depthlink
//!
//! This crate provides:
//! - Classification and decoding of frame payloads received from providers
//! - RVL depth compression and the packed depth+matrices frame format
//! - Pose composition relative to the groundplane
//! - Voice gain and Opus encoding for the outbound audio track

pub mod audio;
pub mod demux;
pub mod depth;
pub mod pose;
pub mod rvl;

pub use audio::*;
pub use demux::*;
pub use depth::*;
pub use pose::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Invalid matrices payload: {0}")]
    Matrices(#[from] serde_json::Error),

    #[error("Invalid packed frame: {0}")]
    PackedFrame(String),

    #[error("Depth frame of {width}x{height} is too large")]
    DepthDimensions { width: u32, height: u32 },

    #[error("RVL decode failed: {0}")]
    Rvl(#[from] rvl::RvlError),

    #[error("Image decode failed: {0}")]
    Image(#[from] image::ImageError),
}
