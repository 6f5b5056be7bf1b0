//! Connection to the voice server: wire protocol, reconnection policy and
//! the WebSocket client task.

pub mod client;
pub mod protocol;
pub mod reconnect;

pub use client::{Transport, TransportConfig, TransportEvent, TransportStats};
pub use protocol::{ControlMessage, PendingConnection};
pub use reconnect::ReconnectPolicy;
