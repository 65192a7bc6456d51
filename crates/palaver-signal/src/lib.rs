// Signaling channel: one persistent bidirectional connection multiplexing
// chat events and WebRTC negotiation as typed events over a pluggable
// transport.

pub mod backoff;
pub mod channel;
pub mod mock;
pub mod transport;

pub use channel::{spawn_channel, ConnectionState, SignalConfig, SignalHandle};
pub use mock::MockTransport;
pub use transport::{Transport, TransportError};
