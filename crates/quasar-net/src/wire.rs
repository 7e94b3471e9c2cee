//! Wire protocol messages and serialization.
//!
//! All messages are serialized with [`postcard`] and prefixed with a protocol
//! version byte. Use [`encode_message`] and [`decode_message`] for
//! encoding/decoding. Application payloads travel opaquely inside
//! [`WireMessage::Data`]; their schema is the application's business.

use serde::{Deserialize, Serialize};

/// Current wire-protocol version. Prepended to every serialized message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Wire error codes carried by [`ErrorFrame`] on a failed join.
pub mod error_code {
    /// Unspecified failure.
    pub const GENERIC: u16 = 4000;
    /// The requested room identifier does not resolve.
    pub const ROOM_NOT_FOUND: u16 = 4001;
    /// No live, unexpired seat reservation for the session.
    pub const SEAT_EXPIRED: u16 = 4002;
    /// The room's own join logic rejected the session.
    pub const JOIN_REJECTED: u16 = 4003;
}

// ---------------------------------------------------------------------------
// Top-level enum
// ---------------------------------------------------------------------------

/// Top-level wire message. The enum discriminant is the type tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WireMessage {
    // --- Handshake ---
    /// First frame sent by a client after the TCP connect.
    Connect(Connect),
    /// Join succeeded; buffered join-time messages follow, in order.
    JoinAccepted(JoinAccepted),
    /// Error notice; on a failed join this is the only frame the peer sees.
    Error(ErrorFrame),

    // --- Application ---
    /// Opaque application payload.
    Data(Vec<u8>),

    // --- Keepalive ---
    /// Heartbeat ping. Sender expects a Pong in response.
    Ping(Ping),
    /// Heartbeat pong. Response to a Ping.
    Pong(Pong),
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Connection request carrying the routing target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connect {
    /// URL-style routing string: `/<process>/<roomId>?sessionId=<id>`.
    pub target: String,
}

/// Join-success notice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinAccepted {
    /// The session identifier the seat was reserved for.
    pub session_id: String,
}

/// Error notice sent before the server closes the connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorFrame {
    /// Error code, see [`error_code`].
    pub code: u16,
    /// Human-readable message.
    pub message: String,
}

/// Heartbeat ping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ping {
    /// Sequence number.
    pub sequence: u32,
}

/// Heartbeat pong (response to [`Ping`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pong {
    /// Echoed sequence number.
    pub sequence: u32,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during wire-message deserialization.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The payload was empty (no version byte).
    #[error("empty payload — no version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Postcard (de)serialization failed.
    #[error("serialization error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

/// Serialize a [`WireMessage`] into a versioned binary payload.
///
/// Wire format: `[version: u8] [postcard-encoded WireMessage]`
pub fn encode_message(msg: &WireMessage) -> Result<Vec<u8>, WireError> {
    let body = postcard::to_allocvec(msg)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize a versioned binary payload into a [`WireMessage`].
pub fn decode_message(bytes: &[u8]) -> Result<WireMessage, WireError> {
    let (&version, body) = bytes.split_first().ok_or(WireError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(body)?)
}
