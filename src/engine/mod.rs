// Streaming engine: origin resolution, upstream transports, session lifecycle and the relay.

pub mod origin;
pub mod proxy;
pub mod relay;
pub mod session;
pub mod stats;
pub mod transport;
