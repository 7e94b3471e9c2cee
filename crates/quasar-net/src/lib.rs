//! Transport layer for the Quasar room server: message framing, the wire
//! protocol, per-connection handles with best-effort delivery, and the TCP
//! listener that routes fresh connections into the join handshake.

pub mod connection;
pub mod framing;
pub mod listener;
pub mod routing;
pub mod wire;

pub use connection::{
    ConnectionHandle, ConnectionId, DeliveryStats, DropReason, IdGenerator, Liveness, SendOutcome,
    WriterConfig,
};
pub use framing::{FrameConfig, FrameError, read_frame, write_frame};
pub use listener::{ConnectionDispatcher, ConnectionSink, Listener, ListenerConfig};
pub use routing::{RouteError, RouteInfo, parse_target};
pub use wire::{WireError, WireMessage, decode_message, encode_message, error_code};
