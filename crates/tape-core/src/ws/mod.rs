//! WebSocket transport and per-venue connection supervision.

pub mod supervisor;
pub mod transport;

pub use supervisor::{StreamHandle, StreamProtocol, StreamSupervisor, WATCH_PERIOD};
pub use transport::{ControlFrame, TransportCallbacks, WsTransport};
