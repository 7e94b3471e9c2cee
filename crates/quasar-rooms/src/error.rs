//! Join-handshake error taxonomy.

use quasar_net::wire::error_code;

/// A room's own refusal to admit a session, raised from
/// [`Room::on_join`](crate::room::Room::on_join).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRejection {
    /// Wire error code; defaults to [`error_code::JOIN_REJECTED`] when unset.
    pub code: Option<u16>,
    /// Human-readable reason, forwarded to the peer.
    pub message: String,
}

impl JoinRejection {
    /// Reject with the default code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Reject with a room-specific code.
    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

/// Why a join handshake failed. All variants are terminal for the
/// connection: the peer receives one error frame, then the socket closes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    /// The room identifier does not resolve.
    #[error("room not found")]
    RoomNotFound,

    /// No live, unexpired seat reservation for the session. Also produced
    /// when a reservation was already consumed by an earlier attempt.
    #[error("seat reservation expired")]
    SeatExpired,

    /// The room's own join logic rejected the session.
    #[error("join rejected: {message}")]
    JoinRejected {
        /// Wire error code carried by the error frame.
        code: u16,
        /// Reason supplied by the room.
        message: String,
    },
}

impl JoinError {
    /// Wire error code for the error frame.
    pub fn code(&self) -> u16 {
        match self {
            JoinError::RoomNotFound => error_code::ROOM_NOT_FOUND,
            JoinError::SeatExpired => error_code::SEAT_EXPIRED,
            JoinError::JoinRejected { code, .. } => *code,
        }
    }

    /// Message carried by the error frame.
    pub fn message(&self) -> &str {
        match self {
            JoinError::RoomNotFound => "room not found",
            JoinError::SeatExpired => "seat reservation expired",
            JoinError::JoinRejected { message, .. } => message,
        }
    }
}

impl From<JoinRejection> for JoinError {
    fn from(rejection: JoinRejection) -> Self {
        JoinError::JoinRejected {
            code: rejection.code.unwrap_or(error_code::JOIN_REJECTED),
            message: rejection.message,
        }
    }
}
