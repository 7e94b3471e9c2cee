//! Relay room: a minimal [`Room`] implementation for running the server
//! end to end.
//!
//! Incoming data is rebroadcast to every other joined session. Join and
//! leave announcements go through the deferred queue, so they batch up and
//! flush together at the room's broadcast tick — the broadcast boundary.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use quasar_net::routing::RouteInfo;
use quasar_rooms::{ClientSession, DeferredQueue, JoinRejection, Payload, Room, SeatMap};

/// Announcement sent to room members.
#[derive(Debug, Serialize)]
struct RoomNotice {
    text: String,
}

/// A room that relays every payload to all other joined sessions.
pub struct RelayRoom {
    room_id: String,
    /// Admit sessions without a prior reservation.
    open_seating: bool,
    seats: SeatMap,
    clients: Mutex<Vec<ClientSession>>,
    deferred: DeferredQueue,
}

impl RelayRoom {
    /// Create a room requiring explicit seat reservations.
    pub fn new(room_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            room_id: room_id.into(),
            open_seating: false,
            seats: SeatMap::new(),
            clients: Mutex::new(Vec::new()),
            deferred: DeferredQueue::new(),
        })
    }

    /// Create a room that admits anyone (demo mode).
    pub fn with_open_seating(room_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            room_id: room_id.into(),
            open_seating: true,
            seats: SeatMap::new(),
            clients: Mutex::new(Vec::new()),
            deferred: DeferredQueue::new(),
        })
    }

    /// Reserve a seat for `session_id`.
    pub fn reserve_seat(&self, session_id: impl Into<String>, ttl: Duration) {
        self.seats.reserve(session_id, ttl);
    }

    /// Number of currently joined sessions.
    pub fn joined_count(&self) -> usize {
        self.clients.lock().expect("client list lock").len()
    }

    /// The broadcast boundary: flush all deferred messages in enqueue order.
    pub fn broadcast_boundary(&self) -> usize {
        self.deferred.flush()
    }

    /// Drive the broadcast boundary on a fixed tick.
    pub fn spawn_broadcast_tick(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let room = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                room.broadcast_boundary();
            }
        })
    }

    /// Queue a notice for every current member, delivered at the next
    /// broadcast boundary.
    fn announce(&self, text: String) {
        let clients = self.clients.lock().expect("client list lock");
        for client in clients.iter() {
            let _ = client.send_deferred(
                &self.deferred,
                Payload::typed(RoomNotice { text: text.clone() }),
            );
        }
    }
}

#[async_trait]
impl Room for RelayRoom {
    fn room_id(&self) -> &str {
        &self.room_id
    }

    fn consume_reservation(&self, session_id: &str) -> bool {
        self.seats.consume(session_id) || self.open_seating
    }

    async fn on_join(
        &self,
        session: ClientSession,
        _route: &RouteInfo,
    ) -> Result<(), JoinRejection> {
        // Greeting rides the pending buffer: the peer sees it right after
        // the join-accepted frame.
        let _ = session.send(Payload::typed(RoomNotice {
            text: format!("welcome to {}", self.room_id),
        }));

        self.announce(format!("{} joined", session.session_id()));
        self.clients.lock().expect("client list lock").push(session);
        Ok(())
    }

    async fn on_message(&self, session: &ClientSession, payload: Vec<u8>) {
        let clients = self.clients.lock().expect("client list lock");
        for client in clients.iter() {
            if client.session_id() != session.session_id() {
                let _ = client.send(Payload::Raw(payload.clone()));
            }
        }
    }

    async fn on_leave(&self, session: &ClientSession) {
        let mut clients = self.clients.lock().expect("client list lock");
        clients.retain(|client| client.session_id() != session.session_id());
        drop(clients);

        tracing::info!(room = %self.room_id, session = %session.session_id(), "session left");
        self.announce(format!("{} left", session.session_id()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use quasar_net::connection::{ConnectionHandle, ConnectionId, WriterConfig};
    use quasar_net::framing::{FrameConfig, read_frame};
    use quasar_net::listener::{ConnectionDispatcher, ConnectionSink};
    use quasar_net::wire::{WireMessage, decode_message};
    use quasar_rooms::{JoinCoordinator, RoomRegistry};
    use tokio::io::DuplexStream;

    fn handle(id: u64) -> (ConnectionHandle, DuplexStream) {
        let (local, remote) = tokio::io::duplex(16384);
        let handle = ConnectionHandle::spawn(ConnectionId(id), local, WriterConfig::default());
        (handle, remote)
    }

    fn route(room_id: &str, session_id: &str) -> RouteInfo {
        RouteInfo {
            process_id: "game".to_string(),
            room_id: room_id.to_string(),
            session_id: session_id.to_string(),
            target: format!("/game/{}?sessionId={}", room_id, session_id),
        }
    }

    async fn recv_wire(remote: &mut DuplexStream) -> WireMessage {
        let bytes = read_frame(remote, &FrameConfig::default()).await.unwrap();
        decode_message(&bytes).unwrap()
    }

    fn coordinator_for(room: &Arc<RelayRoom>) -> JoinCoordinator {
        let registry = Arc::new(RoomRegistry::new());
        registry.register(Arc::clone(room) as Arc<dyn Room>);
        JoinCoordinator::new(registry)
    }

    #[tokio::test]
    async fn test_greeting_follows_join_accepted() {
        let room = RelayRoom::with_open_seating("lobby");
        let coordinator = coordinator_for(&room);

        let (conn, mut remote) = handle(1);
        let sink = coordinator.connect(conn, route("lobby", "alice")).await;
        assert!(sink.is_some());
        assert_eq!(room.joined_count(), 1);

        assert!(matches!(
            recv_wire(&mut remote).await,
            WireMessage::JoinAccepted(_)
        ));
        assert!(matches!(recv_wire(&mut remote).await, WireMessage::Data(_)));
    }

    #[tokio::test]
    async fn test_announcements_wait_for_broadcast_boundary() {
        let room = RelayRoom::with_open_seating("lobby");
        let coordinator = coordinator_for(&room);

        let (alice_conn, mut alice_remote) = handle(1);
        coordinator
            .connect(alice_conn, route("lobby", "alice"))
            .await
            .unwrap();
        let _ = recv_wire(&mut alice_remote).await; // JoinAccepted
        let _ = recv_wire(&mut alice_remote).await; // greeting

        let (bob_conn, _bob_remote) = handle(2);
        coordinator
            .connect(bob_conn, route("lobby", "bob"))
            .await
            .unwrap();

        // Bob's join announcement is deferred until the boundary fires.
        assert_eq!(room.broadcast_boundary(), 1);
        assert!(matches!(
            recv_wire(&mut alice_remote).await,
            WireMessage::Data(_)
        ));

        // Nothing new: a boundary with no deferred messages delivers nothing.
        assert_eq!(room.broadcast_boundary(), 0);
    }

    #[tokio::test]
    async fn test_relay_skips_the_sender() {
        let room = RelayRoom::with_open_seating("lobby");
        let coordinator = coordinator_for(&room);

        let (alice_conn, mut alice_remote) = handle(1);
        let alice_sink = coordinator
            .connect(alice_conn, route("lobby", "alice"))
            .await
            .unwrap();
        let _ = recv_wire(&mut alice_remote).await;
        let _ = recv_wire(&mut alice_remote).await;

        let (bob_conn, mut bob_remote) = handle(2);
        coordinator
            .connect(bob_conn, route("lobby", "bob"))
            .await
            .unwrap();
        let _ = recv_wire(&mut bob_remote).await; // JoinAccepted
        let _ = recv_wire(&mut bob_remote).await; // greeting

        alice_sink.on_data(b"hi all".to_vec()).await;

        assert_eq!(
            recv_wire(&mut bob_remote).await,
            WireMessage::Data(b"hi all".to_vec())
        );
    }

    #[tokio::test]
    async fn test_reserved_seating_rejects_strangers() {
        let room = RelayRoom::new("vip");
        room.reserve_seat("alice", Duration::from_secs(15));
        let coordinator = coordinator_for(&room);

        let (alice_conn, _alice_remote) = handle(1);
        assert!(
            coordinator
                .connect(alice_conn, route("vip", "alice"))
                .await
                .is_some()
        );

        let (mallory_conn, _mallory_remote) = handle(2);
        assert!(
            coordinator
                .connect(mallory_conn, route("vip", "mallory"))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_leave_removes_from_roster() {
        let room = RelayRoom::with_open_seating("lobby");
        let coordinator = coordinator_for(&room);

        let (conn, _remote) = handle(1);
        let sink = coordinator
            .connect(conn.clone(), route("lobby", "alice"))
            .await
            .unwrap();
        assert_eq!(room.joined_count(), 1);

        conn.mark_closed();
        sink.on_closed().await;
        assert_eq!(room.joined_count(), 0);
    }
}
