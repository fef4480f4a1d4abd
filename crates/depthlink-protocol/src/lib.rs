//! Depthlink protocol definitions
//!
//! Types shared between the server, the viewer client and the media crate:
//! signalling messages exchanged over `/signalling`, frame envelopes used by the
//! stream router, pose matrices and the persistent recording ledger.

pub mod frames;
pub mod recording;
pub mod signalling;
pub mod types;

pub use frames::*;
pub use recording::*;
pub use signalling::*;
pub use types::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame is missing its peer id prefix")]
    MissingPeerPrefix,
}
