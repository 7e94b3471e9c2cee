//! Join coordinator: binds incoming connections to reserved room seats.
//!
//! Implements the listener's [`ConnectionDispatcher`] contract. Per
//! connection: resolve the room, consume the seat reservation, build a
//! `Joining` session, await the room's join procedure, then either confirm
//! the join (flushing buffered messages) or send a single error frame and
//! close. The reservation is consumed whether the join succeeds or fails —
//! a retry with the same session id fails with `SeatExpired`.
//!
//! A peer that disconnects mid-handshake needs no special casing: every
//! write on the failure and success paths degrades to a logged no-op once
//! the connection handle reports closed.

use std::sync::Arc;

use async_trait::async_trait;

use quasar_net::connection::ConnectionHandle;
use quasar_net::listener::{ConnectionDispatcher, ConnectionSink};
use quasar_net::routing::RouteInfo;

use crate::error::JoinError;
use crate::payload::{MessageEncoder, WireEncoder};
use crate::room::{Room, RoomRegistry};
use crate::session::ClientSession;

/// Runs the connection-to-room handshake for every accepted connection.
pub struct JoinCoordinator {
    registry: Arc<RoomRegistry>,
    encoder: Arc<dyn MessageEncoder>,
}

impl JoinCoordinator {
    /// Create a coordinator using the default wire encoder.
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self::with_encoder(registry, Arc::new(WireEncoder))
    }

    /// Create a coordinator with a custom encoder.
    pub fn with_encoder(registry: Arc<RoomRegistry>, encoder: Arc<dyn MessageEncoder>) -> Self {
        Self { registry, encoder }
    }

    /// The handshake proper. Failure at any step is terminal for the
    /// connection; success leaves the session `Joined` with its join-time
    /// buffer flushed.
    async fn admit(
        &self,
        handle: ConnectionHandle,
        route: &RouteInfo,
    ) -> Result<(ClientSession, Arc<dyn Room>), JoinError> {
        let room = self
            .registry
            .resolve(&route.room_id)
            .ok_or(JoinError::RoomNotFound)?;

        if !room.consume_reservation(&route.session_id) {
            return Err(JoinError::SeatExpired);
        }

        let session = ClientSession::new(
            route.session_id.clone(),
            handle,
            Arc::clone(&self.encoder),
        );

        room.on_join(session.clone(), route).await?;
        session.confirm_joined();

        Ok((session, room))
    }
}

#[async_trait]
impl ConnectionDispatcher for JoinCoordinator {
    async fn connect(
        &self,
        handle: ConnectionHandle,
        route: RouteInfo,
    ) -> Option<Box<dyn ConnectionSink>> {
        match self.admit(handle.clone(), &route).await {
            Ok((session, room)) => {
                tracing::info!(
                    room = %route.room_id,
                    session = %route.session_id,
                    "session joined"
                );
                Some(Box::new(RoomSink { session, room }))
            }
            Err(error) => {
                tracing::warn!(
                    room = %route.room_id,
                    session = %route.session_id,
                    %error,
                    "join handshake failed"
                );
                // Best-effort error notice, then forced close. The frame is
                // queued ahead of the shutdown so it flushes first.
                match self.encoder.encode_error(error.code(), error.message()) {
                    Ok(bytes) => {
                        let _ = handle.write(bytes);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to encode error frame");
                    }
                }
                handle.begin_close();
                None
            }
        }
    }
}

/// Post-handshake bridge from the listener to the owning room.
struct RoomSink {
    session: ClientSession,
    room: Arc<dyn Room>,
}

#[async_trait]
impl ConnectionSink for RoomSink {
    async fn on_data(&self, payload: Vec<u8>) {
        self.room.on_message(&self.session, payload).await;
    }

    async fn on_closed(&self) {
        self.session.mark_left();
        self.room.on_leave(&self.session).await;
    }
}
