pub mod connections;
pub mod directory;
pub mod signalling;
pub mod streams;

pub use connections::ConnectionManager;
pub use directory::PeerDirectory;
pub use signalling::SignallingRelay;
pub use streams::{StreamPool, StreamRouter};
