pub mod frames;
mod signalling;

pub use signalling::SignallingClient;
