//! Room contracts, seat reservations, and the room registry.
//!
//! The room/matchmaking subsystem is an external collaborator; this module
//! specifies the narrow surface the connection layer needs from it. A room
//! implements [`Room`]; matchmaking reserves seats (usually via a
//! [`SeatMap`]) before the client ever connects, and the join coordinator
//! resolves rooms through the [`RoomRegistry`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use quasar_net::routing::RouteInfo;

use crate::error::JoinRejection;
use crate::session::ClientSession;

/// Default seat-reservation lifetime.
pub const DEFAULT_SEAT_TTL: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Room contract
// ---------------------------------------------------------------------------

/// The surface a room exposes to the connection layer.
#[async_trait]
pub trait Room: Send + Sync {
    /// Stable identifier this room is registered under.
    fn room_id(&self) -> &str;

    /// Atomically consume the seat reserved for `session_id`.
    ///
    /// Returns `false` when no live, unexpired reservation exists. A seat is
    /// consumed exactly once: the join may still fail afterwards, but a
    /// retry with the same session id must come back `false`.
    fn consume_reservation(&self, session_id: &str) -> bool;

    /// Admit a session. Runs during the handshake while the session is still
    /// `Joining`, so messages sent from here are buffered and flushed after
    /// the join-accepted frame. May suspend on room logic, storage, or other
    /// I/O; the listener keeps accepting in the meantime.
    async fn on_join(
        &self,
        session: ClientSession,
        route: &RouteInfo,
    ) -> Result<(), JoinRejection>;

    /// An application payload arrived from a joined session.
    async fn on_message(&self, session: &ClientSession, payload: Vec<u8>);

    /// The session's connection is gone or the room evicted it. The session
    /// is already `Left` when this fires.
    async fn on_leave(&self, session: &ClientSession);
}

// ---------------------------------------------------------------------------
// Seat reservations
// ---------------------------------------------------------------------------

/// Time-bounded seat reservations, keyed by session identifier.
///
/// Consume-once semantics: a consumed or expired seat is gone, and a second
/// join attempt with the same session id fails deterministically.
#[derive(Default)]
pub struct SeatMap {
    /// Expiry deadline per reserved session id.
    seats: Mutex<HashMap<String, Instant>>,
}

impl SeatMap {
    /// Create an empty seat map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a seat for `session_id`, valid for `ttl`. Re-reserving
    /// refreshes the deadline.
    pub fn reserve(&self, session_id: impl Into<String>, ttl: Duration) {
        let deadline = Instant::now() + ttl;
        self.seats
            .lock()
            .expect("seat map lock")
            .insert(session_id.into(), deadline);
    }

    /// Consume the seat for `session_id`. Returns `true` when a live,
    /// unexpired reservation existed; either way the seat is gone afterwards.
    pub fn consume(&self, session_id: &str) -> bool {
        match self.seats.lock().expect("seat map lock").remove(session_id) {
            Some(deadline) => Instant::now() <= deadline,
            None => false,
        }
    }

    /// Drop expired reservations. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut seats = self.seats.lock().expect("seat map lock");
        let before = seats.len();
        seats.retain(|_, deadline| *deadline >= now);
        before - seats.len()
    }

    /// Number of reservations currently held (including expired ones not
    /// yet swept).
    pub fn len(&self) -> usize {
        self.seats.lock().expect("seat map lock").len()
    }

    /// Whether no reservations are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Concurrent room lookup keyed by room id.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<String, Arc<dyn Room>>,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a room under its own id, replacing any previous holder.
    pub fn register(&self, room: Arc<dyn Room>) {
        self.rooms.insert(room.room_id().to_string(), room);
    }

    /// Resolve a room by id.
    pub fn resolve(&self, room_id: &str) -> Option<Arc<dyn Room>> {
        self.rooms.get(room_id).map(|entry| entry.value().clone())
    }

    /// Remove a room. Returns `true` when it was registered.
    pub fn unregister(&self, room_id: &str) -> bool {
        self.rooms.remove(room_id).is_some()
    }

    /// Number of registered rooms.
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Whether no rooms are registered.
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
