//! Per-connection client session: join-phase state machine and the
//! message-queueing discipline.
//!
//! ## State machine
//!
//! ```text
//! Joining -> Joined -> Left
//!     \________________^
//! ```
//!
//! `Joining` is the initial phase, entered when a connection is bound to a
//! room seat. While joining, outbound application messages accumulate in a
//! per-session FIFO buffer: the remote peer cannot process room messages
//! before it has seen the join-accepted frame. The join coordinator calls
//! [`ClientSession::confirm_joined`] on success, which emits the
//! join-accepted frame and then flushes the buffer in enqueue order. `Left`
//! is terminal and reachable from either phase.
//!
//! Sends never raise for a dead peer. A room broadcasts to many sessions;
//! one closed connection must degrade to a logged [`SendOutcome::Dropped`]
//! without aborting delivery to the rest. The room learns about the death
//! through the connection's closed signal, not through send results.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;

use quasar_net::connection::{ConnectionHandle, DropReason, Liveness, SendOutcome};

use crate::deferred::DeferredQueue;
use crate::payload::{MessageEncoder, Payload};

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Join-phase of a session, independent of the connection's liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// Bound to a seat; the join procedure is still running.
    Joining,
    /// Admitted by the room; messages flow directly.
    Joined,
    /// Disconnected or evicted. Terminal.
    Left,
}

const PHASE_JOINING: u8 = 0;
const PHASE_JOINED: u8 = 1;
const PHASE_LEFT: u8 = 2;

impl SessionPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            PHASE_JOINING => SessionPhase::Joining,
            PHASE_JOINED => SessionPhase::Joined,
            _ => SessionPhase::Left,
        }
    }
}

/// Serializable diagnostic summary of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub session_id: String,
    /// Physical connection state.
    pub liveness: Liveness,
    /// Join-phase.
    pub phase: SessionPhase,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct SessionShared {
    session_id: String,
    phase: AtomicU8,
    /// FIFO buffer for messages sent while `Joining`. Guarded by a mutex so
    /// the joined-transition flush and concurrent sends serialize: a message
    /// enqueued during the flush lands *after* every buffered one.
    pending: Mutex<Vec<Vec<u8>>>,
    connection: ConnectionHandle,
    encoder: Arc<dyn MessageEncoder>,
}

/// Cheaply clonable handle to one client session.
///
/// The room owns the set of joined sessions; the session exclusively owns
/// its connection handle.
#[derive(Clone)]
pub struct ClientSession {
    shared: Arc<SessionShared>,
}

impl ClientSession {
    /// Bind a session to a connection, starting in [`SessionPhase::Joining`].
    pub fn new(
        session_id: impl Into<String>,
        connection: ConnectionHandle,
        encoder: Arc<dyn MessageEncoder>,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                session_id: session_id.into(),
                phase: AtomicU8::new(PHASE_JOINING),
                pending: Mutex::new(Vec::new()),
                connection,
                encoder,
            }),
        }
    }

    /// The session identifier the seat was reserved for.
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Current join-phase.
    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    /// Physical connection liveness.
    pub fn liveness(&self) -> Liveness {
        self.shared.connection.liveness()
    }

    /// The underlying connection handle.
    pub fn connection(&self) -> &ConnectionHandle {
        &self.shared.connection
    }

    /// Subscribe to the connection's closed signal.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.shared.connection.closed_signal()
    }

    /// Diagnostic summary (session id + liveness + phase).
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.shared.session_id.clone(),
            liveness: self.liveness(),
            phase: self.phase(),
        }
    }

    /// Send an application payload to the peer.
    ///
    /// While `Joining` the encoded message is buffered and delivered, in
    /// order, once the join completes. Best-effort after that: a dead peer
    /// yields [`SendOutcome::Dropped`], never an error.
    pub fn send(&self, payload: Payload) -> SendOutcome {
        match self.shared.encoder.encode_payload(&payload) {
            Ok(bytes) => self.enqueue(bytes),
            Err(e) => {
                tracing::warn!(
                    session = %self.shared.session_id,
                    error = %e,
                    "failed to encode payload"
                );
                SendOutcome::Dropped(DropReason::EncodeFailed)
            }
        }
    }

    /// Hold a payload in the room's deferred queue until the next broadcast
    /// boundary.
    ///
    /// The queue handle is scoped to the current broadcast cycle and passed
    /// in by the room per call; the session keeps no reference to it. The
    /// deferral applies even while `Joining`.
    pub fn send_deferred(&self, queue: &DeferredQueue, payload: Payload) -> SendOutcome {
        match self.shared.encoder.encode_payload(&payload) {
            Ok(bytes) => {
                queue.push(self, bytes);
                SendOutcome::Deferred
            }
            Err(e) => {
                tracing::warn!(
                    session = %self.shared.session_id,
                    error = %e,
                    "failed to encode deferred payload"
                );
                SendOutcome::Dropped(DropReason::EncodeFailed)
            }
        }
    }

    /// Send an error notice, bypassing the joining buffer: error frames must
    /// reach the peer immediately, including during a failed handshake.
    pub fn send_error(&self, code: u16, message: &str) -> SendOutcome {
        match self.shared.encoder.encode_error(code, message) {
            Ok(bytes) => self.raw_send(bytes),
            Err(e) => {
                tracing::warn!(
                    session = %self.shared.session_id,
                    error = %e,
                    "failed to encode error frame"
                );
                SendOutcome::Dropped(DropReason::EncodeFailed)
            }
        }
    }

    /// Initiate disconnection.
    ///
    /// No-op unless the connection is still open, so a double leave produces
    /// exactly one disconnect. The `Joining/Joined -> Left` transition is not
    /// taken here — the room drives it when it observes the closed signal.
    pub fn leave(&self) {
        if !self.shared.connection.is_open() {
            return;
        }
        self.shared.connection.begin_close();
    }

    /// Route encoded bytes through the joining-buffer discipline.
    fn enqueue(&self, bytes: Vec<u8>) -> SendOutcome {
        let mut pending = self.shared.pending.lock().expect("pending buffer lock");
        if self.phase() == SessionPhase::Joining {
            pending.push(bytes);
            return SendOutcome::Buffered;
        }
        drop(pending);
        self.raw_send(bytes)
    }

    /// Write straight to the connection. Degrades to a logged drop when the
    /// peer is gone — see the module docs on fan-out isolation.
    pub(crate) fn raw_send(&self, bytes: Vec<u8>) -> SendOutcome {
        self.shared.connection.write(bytes)
    }

    /// Complete the join: emit the join-accepted frame, transition to
    /// `Joined`, and flush the pending buffer in enqueue order.
    ///
    /// Invoked by the join coordinator exactly once per successful
    /// handshake; a repeat call is a no-op.
    pub(crate) fn confirm_joined(&self) {
        let mut pending = self.shared.pending.lock().expect("pending buffer lock");
        if self
            .shared
            .phase
            .compare_exchange(
                PHASE_JOINING,
                PHASE_JOINED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        match self
            .shared
            .encoder
            .encode_join_accepted(&self.shared.session_id)
        {
            Ok(bytes) => {
                let _ = self.raw_send(bytes);
            }
            Err(e) => {
                tracing::error!(
                    session = %self.shared.session_id,
                    error = %e,
                    "failed to encode join-accepted frame"
                );
            }
        }

        let buffered = pending.len();
        for bytes in pending.drain(..) {
            let _ = self.raw_send(bytes);
        }
        if buffered > 0 {
            tracing::debug!(
                session = %self.shared.session_id,
                count = buffered,
                "flushed join-time messages"
            );
        }
    }

    /// Transition to `Left`. Monotonic; safe to call more than once.
    pub(crate) fn mark_left(&self) {
        self.shared.phase.fetch_max(PHASE_LEFT, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("session_id", &self.shared.session_id)
            .field("phase", &self.phase())
            .field("liveness", &self.liveness())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::WireEncoder;
    use std::time::Duration;
    use quasar_net::connection::{ConnectionId, WriterConfig};
    use quasar_net::framing::{FrameConfig, read_frame};
    use quasar_net::wire::{WireMessage, decode_message};
    use tokio::io::DuplexStream;

    fn test_session(id: &str) -> (ClientSession, DuplexStream) {
        let (local, remote) = tokio::io::duplex(16384);
        let handle = ConnectionHandle::spawn(ConnectionId(1), local, WriterConfig::default());
        let session = ClientSession::new(id, handle, Arc::new(WireEncoder));
        (session, remote)
    }

    async fn recv_wire(remote: &mut DuplexStream) -> WireMessage {
        let bytes = read_frame(remote, &FrameConfig::default()).await.unwrap();
        decode_message(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_messages_buffer_while_joining() {
        let (session, mut remote) = test_session("abc");

        let outcome = session.send(Payload::Raw(b"m1".to_vec()));
        assert_eq!(outcome, SendOutcome::Buffered);

        // Nothing reaches the wire before the join completes.
        let peeked = tokio::time::timeout(
            Duration::from_millis(50),
            read_frame(&mut remote, &FrameConfig::default()),
        )
        .await;
        assert!(peeked.is_err(), "no frame may arrive while joining");
    }

    #[tokio::test]
    async fn test_join_accepted_precedes_flushed_messages() {
        let (session, mut remote) = test_session("abc");

        assert_eq!(session.send(Payload::Raw(b"m1".to_vec())), SendOutcome::Buffered);
        assert_eq!(session.send(Payload::Raw(b"m2".to_vec())), SendOutcome::Buffered);

        session.confirm_joined();
        assert_eq!(session.phase(), SessionPhase::Joined);

        match recv_wire(&mut remote).await {
            WireMessage::JoinAccepted(frame) => assert_eq!(frame.session_id, "abc"),
            other => panic!("expected JoinAccepted first, got {:?}", other),
        }
        assert_eq!(recv_wire(&mut remote).await, WireMessage::Data(b"m1".to_vec()));
        assert_eq!(recv_wire(&mut remote).await, WireMessage::Data(b"m2".to_vec()));
    }

    #[tokio::test]
    async fn test_flush_clears_buffer() {
        let (session, mut remote) = test_session("abc");

        let _ = session.send(Payload::Raw(b"m1".to_vec()));
        session.confirm_joined();

        let _ = recv_wire(&mut remote).await; // JoinAccepted
        let _ = recv_wire(&mut remote).await; // m1

        // A second confirm is a no-op and re-flushes nothing.
        session.confirm_joined();
        let peeked = tokio::time::timeout(
            Duration::from_millis(50),
            read_frame(&mut remote, &FrameConfig::default()),
        )
        .await;
        assert!(peeked.is_err());
    }

    #[tokio::test]
    async fn test_sends_after_join_go_direct() {
        let (session, mut remote) = test_session("abc");
        session.confirm_joined();
        let _ = recv_wire(&mut remote).await; // JoinAccepted

        assert_eq!(session.send(Payload::Raw(b"live".to_vec())), SendOutcome::Sent);
        assert_eq!(recv_wire(&mut remote).await, WireMessage::Data(b"live".to_vec()));
    }

    #[tokio::test]
    async fn test_error_frame_bypasses_joining_buffer() {
        let (session, mut remote) = test_session("abc");

        let _ = session.send(Payload::Raw(b"held".to_vec()));
        let outcome = session.send_error(4002, "seat reservation expired");
        assert_eq!(outcome, SendOutcome::Sent);

        // The error frame arrives even though the session never joined.
        match recv_wire(&mut remote).await {
            WireMessage::Error(frame) => {
                assert_eq!(frame.code, 4002);
                assert_eq!(frame.message, "seat reservation expired");
            }
            other => panic!("expected Error frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_double_leave_single_disconnect() {
        let (session, mut remote) = test_session("abc");

        session.leave();
        session.leave();

        // Exactly one disconnect effect: the peer sees EOF once.
        let result = read_frame(&mut remote, &FrameConfig::default()).await;
        assert!(result.is_err());
        assert_ne!(session.liveness(), Liveness::Open);
    }

    #[tokio::test]
    async fn test_send_to_dead_peer_never_raises() {
        let (session, remote) = test_session("abc");
        session.confirm_joined();
        session.connection().mark_closed();
        drop(remote);

        let outcome = session.send(Payload::Raw(b"void".to_vec()));
        assert_eq!(outcome, SendOutcome::Dropped(DropReason::PeerUnavailable));
    }

    #[tokio::test]
    async fn test_typed_payload_sends() {
        #[derive(Serialize)]
        struct Tick {
            round: u32,
        }

        let (session, mut remote) = test_session("abc");
        session.confirm_joined();
        let _ = recv_wire(&mut remote).await; // JoinAccepted

        let outcome = session.send(Payload::typed(Tick { round: 9 }));
        assert_eq!(outcome, SendOutcome::Sent);
        match recv_wire(&mut remote).await {
            WireMessage::Data(bytes) => {
                assert!(!bytes.is_empty());
            }
            other => panic!("expected Data frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mark_left_is_terminal() {
        let (session, _remote) = test_session("abc");
        session.mark_left();
        assert_eq!(session.phase(), SessionPhase::Left);

        // A late join confirmation cannot resurrect the session.
        session.confirm_joined();
        assert_eq!(session.phase(), SessionPhase::Left);
    }

    #[tokio::test]
    async fn test_summary_serializes() {
        let (session, _remote) = test_session("abc");
        let value = serde_json::to_value(session.summary()).unwrap();
        assert_eq!(value["session_id"], "abc");
        assert_eq!(value["liveness"], "open");
        assert_eq!(value["phase"], "joining");
    }
}
