//! Connection handle: liveness state machine and best-effort outbound writes.
//!
//! Each accepted socket gets a [`ConnectionHandle`] plus a background writer
//! task that owns the write half. The handle is cheap to clone and safe to
//! share with room logic: every send degrades to a logged no-op once the peer
//! is gone, so a room can fan out to many connections without one dead peer
//! aborting delivery to the rest.
//!
//! ## Liveness
//!
//! ```text
//! Open -> Closing -> Closed
//! ```
//!
//! Transitions are monotonic and never run backward. `Closed` is reached at
//! most once and is broadcast through a [`watch`] channel so any number of
//! observers can react without polling.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::framing::{self, FrameConfig};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique identifier for a connection within one server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

/// Physical connection lifecycle, independent of any higher-level join state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// Connected; writes are accepted.
    Open,
    /// Disconnect initiated; no further writes are accepted.
    Closing,
    /// The peer is gone. Terminal.
    Closed,
}

const LIVENESS_OPEN: u8 = 0;
const LIVENESS_CLOSING: u8 = 1;
const LIVENESS_CLOSED: u8 = 2;

impl Liveness {
    fn from_u8(value: u8) -> Self {
        match value {
            LIVENESS_OPEN => Liveness::Open,
            LIVENESS_CLOSING => Liveness::Closing,
            _ => Liveness::Closed,
        }
    }
}

// ---------------------------------------------------------------------------
// Send outcome
// ---------------------------------------------------------------------------

/// Why an outbound message was not handed to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The connection is closing or closed. Delivery is best-effort once the
    /// peer has died; the owning room reacts through the closed signal, not
    /// through send results.
    PeerUnavailable,
    /// The payload could not be encoded into a wire frame.
    EncodeFailed,
}

/// Result of a send-family operation. Never an error: the send path must not
/// raise for a dead peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a dropped send is silent unless the outcome is inspected"]
pub enum SendOutcome {
    /// Handed to the writer task in FIFO order.
    Sent,
    /// Held in the session's pending buffer until the join completes.
    Buffered,
    /// Held in the room's deferred queue until the next broadcast boundary.
    Deferred,
    /// Not delivered; see [`DropReason`].
    Dropped(DropReason),
}

/// Lifetime delivery counters for one connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeliveryStats {
    /// Frames handed to the writer task.
    pub sent: u64,
    /// Frames dropped because the connection was not open.
    pub dropped: u64,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Configuration for a connection's writer task.
#[derive(Debug, Clone, Default)]
pub struct WriterConfig {
    /// Framing limits for outbound frames.
    pub frame: FrameConfig,
    /// Delay every outbound write by this fixed duration without reordering.
    /// Test/debug aid; `None` disables it.
    pub simulated_latency: Option<Duration>,
}

enum WriteCommand {
    Frame { bytes: Vec<u8>, enqueued_at: Instant },
    Shutdown,
}

struct ConnectionShared {
    id: ConnectionId,
    liveness: AtomicU8,
    writer_tx: mpsc::UnboundedSender<WriteCommand>,
    closed_tx: watch::Sender<bool>,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl ConnectionShared {
    /// Transition to `Closed` and notify observers. Idempotent: repeated
    /// disconnect signals are no-ops after the first.
    fn mark_closed(&self) {
        let prev = self.liveness.swap(LIVENESS_CLOSED, Ordering::AcqRel);
        if prev != LIVENESS_CLOSED {
            self.closed_tx.send_replace(true);
            // Wake the writer task so it releases the socket.
            let _ = self.writer_tx.send(WriteCommand::Shutdown);
        }
    }
}

/// Cheaply clonable handle to one physical connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
}

impl ConnectionHandle {
    /// Wrap the write half of an accepted socket and spawn its writer task.
    pub fn spawn<W>(id: ConnectionId, writer: W, config: WriterConfig) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(ConnectionShared {
            id,
            liveness: AtomicU8::new(LIVENESS_OPEN),
            writer_tx,
            closed_tx,
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        });

        tokio::spawn(write_loop(Arc::clone(&shared), writer, config, writer_rx));

        Self { shared }
    }

    /// Return this connection's identifier.
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Return the current liveness state.
    pub fn liveness(&self) -> Liveness {
        Liveness::from_u8(self.shared.liveness.load(Ordering::Acquire))
    }

    /// Whether writes are currently accepted.
    pub fn is_open(&self) -> bool {
        self.liveness() == Liveness::Open
    }

    /// Queue a wire frame for the peer.
    ///
    /// Best-effort: when the connection is not open the frame is dropped with
    /// a warning and the call reports [`SendOutcome::Dropped`] instead of
    /// raising. Queued frames reach the socket in FIFO order.
    pub fn write(&self, bytes: Vec<u8>) -> SendOutcome {
        if !self.is_open() {
            tracing::warn!(
                id = ?self.shared.id,
                liveness = ?self.liveness(),
                "dropping frame for inactive connection"
            );
            self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return SendOutcome::Dropped(DropReason::PeerUnavailable);
        }

        let command = WriteCommand::Frame {
            bytes,
            enqueued_at: Instant::now(),
        };
        match self.shared.writer_tx.send(command) {
            Ok(()) => {
                self.shared.frames_sent.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Sent
            }
            Err(_) => {
                // Writer task already exited; the peer is gone.
                self.shared.mark_closed();
                self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Dropped(DropReason::PeerUnavailable)
            }
        }
    }

    /// Transition `Open -> Closing` and initiate peer disconnection.
    ///
    /// Idempotent: calling it when the connection is not open is a no-op.
    /// Frames queued before this call are still flushed first.
    pub fn begin_close(&self) {
        if self
            .shared
            .liveness
            .compare_exchange(
                LIVENESS_OPEN,
                LIVENESS_CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        let _ = self.shared.writer_tx.send(WriteCommand::Shutdown);
    }

    /// Record that the underlying peer disconnected (EOF, error, timeout).
    ///
    /// Transitions to `Closed` and fires the closed signal exactly once.
    pub fn mark_closed(&self) {
        self.shared.mark_closed();
    }

    /// Subscribe to the closed signal. The receiver observes `true` exactly
    /// once, when the connection reaches `Closed`.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.shared.closed_tx.subscribe()
    }

    /// Snapshot of this connection's delivery counters.
    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            sent: self.shared.frames_sent.load(Ordering::Relaxed),
            dropped: self.shared.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("liveness", &self.liveness())
            .finish()
    }
}

/// Drain the command queue and write frames to the socket.
///
/// Exits on shutdown, write error, or when every handle clone is gone. The
/// simulated-latency knob holds each frame until `enqueue time + latency`,
/// which delays all writes equally and can never reorder them.
async fn write_loop<W>(
    shared: Arc<ConnectionShared>,
    mut writer: W,
    config: WriterConfig,
    mut writer_rx: mpsc::UnboundedReceiver<WriteCommand>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    while let Some(command) = writer_rx.recv().await {
        match command {
            WriteCommand::Frame { bytes, enqueued_at } => {
                if let Some(latency) = config.simulated_latency {
                    tokio::time::sleep_until(enqueued_at + latency).await;
                }
                if let Err(e) = framing::write_frame(&mut writer, &bytes, &config.frame).await {
                    tracing::warn!(id = ?shared.id, error = %e, "outbound write failed");
                    break;
                }
            }
            WriteCommand::Shutdown => {
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
    shared.mark_closed();
}
