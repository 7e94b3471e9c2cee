//! Outbound payload model and the encode boundary.
//!
//! Room logic hands a [`Payload`] to the session; the injected
//! [`MessageEncoder`] resolves it to wire bytes *before* the message enters
//! any queue, so the buffering discipline only ever moves plain byte
//! vectors. [`WireEncoder`] is the default, postcard-backed implementation.

use serde::Serialize;

use quasar_net::wire::{self, ErrorFrame, JoinAccepted, WireError, WireMessage};

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// A schema-typed message, serializable at the encode boundary.
pub trait ErasedMessage: Send + Sync {
    /// Serialize the message into application payload bytes.
    fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error>;
}

impl<T: Serialize + Send + Sync> ErasedMessage for T {
    fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }
}

/// An outbound application message.
pub enum Payload {
    /// Pre-encoded bytes, passed through untouched.
    Raw(Vec<u8>),
    /// A schema-typed message, resolved to bytes by the encoder.
    Typed(Box<dyn ErasedMessage>),
}

impl Payload {
    /// Wrap a serializable message.
    pub fn typed<T>(message: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Payload::Typed(Box::new(message))
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Raw(bytes) => f.debug_tuple("Raw").field(&bytes.len()).finish(),
            Payload::Typed(_) => f.debug_tuple("Typed").finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Errors produced at the encode boundary.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The typed payload could not be serialized.
    #[error("payload serialization failed: {0}")]
    Payload(#[from] postcard::Error),

    /// The wire frame could not be encoded.
    #[error("wire encoding failed: {0}")]
    Wire(#[from] WireError),
}

/// Resolves payloads, error notices, and the join-accepted frame to wire
/// bytes. Injected into every session so the wire format stays swappable.
pub trait MessageEncoder: Send + Sync {
    /// Encode an application payload into a wire frame.
    fn encode_payload(&self, payload: &Payload) -> Result<Vec<u8>, EncodeError>;

    /// Encode an error notice into a wire frame.
    fn encode_error(&self, code: u16, message: &str) -> Result<Vec<u8>, EncodeError>;

    /// Encode the join-success frame.
    fn encode_join_accepted(&self, session_id: &str) -> Result<Vec<u8>, EncodeError>;
}

/// Default encoder producing quasar wire frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireEncoder;

impl MessageEncoder for WireEncoder {
    fn encode_payload(&self, payload: &Payload) -> Result<Vec<u8>, EncodeError> {
        let bytes = match payload {
            Payload::Raw(bytes) => bytes.clone(),
            Payload::Typed(message) => message.to_bytes()?,
        };
        Ok(wire::encode_message(&WireMessage::Data(bytes))?)
    }

    fn encode_error(&self, code: u16, message: &str) -> Result<Vec<u8>, EncodeError> {
        Ok(wire::encode_message(&WireMessage::Error(ErrorFrame {
            code,
            message: message.to_string(),
        }))?)
    }

    fn encode_join_accepted(&self, session_id: &str) -> Result<Vec<u8>, EncodeError> {
        Ok(wire::encode_message(&WireMessage::JoinAccepted(
            JoinAccepted {
                session_id: session_id.to_string(),
            },
        ))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Greeting {
        text: String,
        round: u32,
    }

    #[test]
    fn test_raw_payload_passes_through() {
        let frame = WireEncoder
            .encode_payload(&Payload::Raw(b"opaque".to_vec()))
            .unwrap();
        match wire::decode_message(&frame).unwrap() {
            WireMessage::Data(bytes) => assert_eq!(bytes, b"opaque"),
            other => panic!("expected Data frame, got {:?}", other),
        }
    }

    #[test]
    fn test_typed_payload_resolves_at_encode_boundary() {
        let greeting = Greeting {
            text: "hello".to_string(),
            round: 3,
        };
        let frame = WireEncoder
            .encode_payload(&Payload::typed(greeting))
            .unwrap();

        match wire::decode_message(&frame).unwrap() {
            WireMessage::Data(bytes) => {
                let decoded: Greeting = postcard::from_bytes(&bytes).unwrap();
                assert_eq!(decoded.text, "hello");
                assert_eq!(decoded.round, 3);
            }
            other => panic!("expected Data frame, got {:?}", other),
        }
    }

    #[test]
    fn test_error_frame_encoding() {
        let frame = WireEncoder.encode_error(4002, "seat reservation expired").unwrap();
        match wire::decode_message(&frame).unwrap() {
            WireMessage::Error(error) => {
                assert_eq!(error.code, 4002);
                assert_eq!(error.message, "seat reservation expired");
            }
            other => panic!("expected Error frame, got {:?}", other),
        }
    }
}
