//! Room-side connection layer: client session state machine, join
//! handshake coordination, seat reservations, and the deferred
//! broadcast-boundary queue.

pub mod deferred;
pub mod error;
pub mod join;
pub mod payload;
pub mod room;
pub mod session;

pub use deferred::DeferredQueue;
pub use error::{JoinError, JoinRejection};
pub use join::JoinCoordinator;
pub use payload::{EncodeError, ErasedMessage, MessageEncoder, Payload, WireEncoder};
pub use room::{DEFAULT_SEAT_TTL, Room, RoomRegistry, SeatMap};
pub use session::{ClientSession, SessionPhase, SessionSummary};
