//! Depthlink client library
//!
//! Joins the signalling network as a consumer or provider, negotiates one
//! WebRTC connection per remote peer and publishes decoded frames, tracks and
//! user notices on an event bus.

pub mod config;
pub mod events;
pub mod network;
pub mod rtc;

pub use config::ClientConfig;
pub use events::{EventBus, Notice, NoticeKind, ViewerEvent};
pub use rtc::{Coordinator, RtcError};
