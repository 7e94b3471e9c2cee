//! TCP listener: accept loop, handshake dispatch, and per-connection I/O.
//!
//! The listener accepts raw connections, reads the initial [`Connect`] frame,
//! extracts routing identifiers, and hands the connection to an injected
//! [`ConnectionDispatcher`] (the join coordinator). Each connection runs in
//! its own task: a slow or erroring join never blocks the accept loop, and a
//! malformed connection is logged and abandoned without affecting its
//! neighbours.
//!
//! After a successful handshake the same task runs the read loop: answering
//! pings, enforcing the receive timeout, forwarding `Data` frames to the
//! dispatcher's sink, and reporting the eventual disconnect exactly once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::connection::{ConnectionHandle, IdGenerator, WriterConfig};
use crate::framing::{self, FrameConfig, FrameError};
use crate::routing::{self, RouteError, RouteInfo};
use crate::wire::{self, ErrorFrame, Pong, WireMessage, error_code};

// ---------------------------------------------------------------------------
// Dispatcher contract
// ---------------------------------------------------------------------------

/// Handles the join handshake for newly connected peers.
///
/// Implemented by the room layer's join coordinator. The listener never
/// learns what a "room" is; it only routes connections here.
#[async_trait]
pub trait ConnectionDispatcher: Send + Sync + 'static {
    /// Run the join handshake for a connection.
    ///
    /// May suspend on room logic for as long as it likes; other accepts
    /// proceed concurrently. Returns a sink for post-handshake events, or
    /// `None` when the join was rejected — in that case the dispatcher has
    /// already sent the error frame and initiated the close.
    async fn connect(
        &self,
        handle: ConnectionHandle,
        route: RouteInfo,
    ) -> Option<Box<dyn ConnectionSink>>;
}

/// Receives post-handshake events for one connection.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    /// An application data frame arrived from the peer.
    async fn on_data(&self, payload: Vec<u8>);

    /// The connection is gone (EOF, read error, or keepalive timeout).
    /// Invoked exactly once, after the handle reports `Closed`.
    async fn on_closed(&self);
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for [`Listener`].
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to. Default: `0.0.0.0:2567`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections. Default: 256.
    pub max_connections: usize,
    /// Interval between server-initiated pings. Default: 25 s.
    pub keepalive_interval: Duration,
    /// Drop the connection when nothing was received for this long. Must
    /// exceed the keepalive interval by at least one round trip. Default: 50 s.
    pub connection_timeout: Duration,
    /// How long a fresh connection may take to send its `Connect` frame.
    /// Default: 10 s.
    pub handshake_timeout: Duration,
    /// Framing limits (maximum message size).
    pub frame: FrameConfig,
    /// Delay every outbound write by a fixed duration. Debug aid.
    pub simulated_latency: Option<Duration>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:2567".parse().unwrap(),
            max_connections: 256,
            keepalive_interval: Duration::from_secs(25),
            connection_timeout: Duration::from_secs(50),
            handshake_timeout: Duration::from_secs(10),
            frame: FrameConfig::default(),
            simulated_latency: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Accepts connections and routes them through the handshake.
pub struct Listener {
    config: ListenerConfig,
    dispatcher: Arc<dyn ConnectionDispatcher>,
    id_gen: Arc<IdGenerator>,
    active: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Listener {
    /// Create a listener with the given configuration and dispatcher.
    pub fn new(config: ListenerConfig, dispatcher: Arc<dyn ConnectionDispatcher>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            dispatcher,
            id_gen: Arc::new(IdGenerator::new()),
            active: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("listening on {}", self.config.bind_addr);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = result?;

                    if self.active.load(Ordering::Acquire) >= self.config.max_connections {
                        tracing::warn!(peer = %peer_addr, "connection limit reached, rejecting");
                        continue;
                    }

                    let id = self.id_gen.next_id();
                    tracing::debug!(id = ?id, peer = %peer_addr, "accepted connection");

                    let config = self.config.clone();
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let task_shutdown = self.shutdown_rx.clone();
                    let guard = ActiveGuard::enter(Arc::clone(&self.active));

                    tokio::spawn(async move {
                        handle_connection(stream, id, config, dispatcher, task_shutdown).await;
                        drop(guard);
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Signal the accept loop to stop and connection tasks to wind down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// RAII guard for the active-connection counter.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// Per-connection task
// ---------------------------------------------------------------------------

enum HandshakeFailure {
    /// No `Connect` frame within the handshake timeout.
    Timeout,
    /// Frame- or wire-level breakage; the peer is abandoned silently.
    Transport(String),
    /// The target parsed but its identifiers are unusable. Mapped onto the
    /// regular join-failure path so the peer sees a proper error frame.
    Route(RouteError),
}

async fn handle_connection(
    stream: TcpStream,
    id: crate::connection::ConnectionId,
    config: ListenerConfig,
    dispatcher: Arc<dyn ConnectionDispatcher>,
    shutdown_rx: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(id = ?id, error = %e, "failed to set TCP_NODELAY");
    }

    let (mut reader, writer) = stream.into_split();
    let handle = ConnectionHandle::spawn(
        id,
        writer,
        WriterConfig {
            frame: config.frame.clone(),
            simulated_latency: config.simulated_latency,
        },
    );

    let route = match read_connect(&mut reader, &config).await {
        Ok(route) => route,
        Err(failure) => {
            reject_handshake(&handle, failure);
            return;
        }
    };

    let Some(sink) = dispatcher.connect(handle.clone(), route).await else {
        // Rejected; the dispatcher already sent the error frame and began
        // the close. The writer task flushes and shuts the socket down.
        return;
    };

    // Bridge inbound frames onto a channel: `read_frame` is not safe to
    // cancel mid-frame, so the keepalive select loop must never drop it.
    let (frame_tx, frame_rx) = mpsc::channel(32);
    let pump_frame_config = config.frame.clone();
    let pump = tokio::spawn(async move {
        loop {
            let result = framing::read_frame(&mut reader, &pump_frame_config).await;
            let failed = result.is_err();
            if frame_tx.send(result).await.is_err() || failed {
                break;
            }
        }
    });

    read_loop(frame_rx, &handle, sink.as_ref(), &config, shutdown_rx).await;

    pump.abort();
    handle.mark_closed();
    sink.on_closed().await;
}

/// Read and parse the initial `Connect` frame.
async fn read_connect(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    config: &ListenerConfig,
) -> Result<RouteInfo, HandshakeFailure> {
    let frame = tokio::time::timeout(
        config.handshake_timeout,
        framing::read_frame(reader, &config.frame),
    )
    .await
    .map_err(|_| HandshakeFailure::Timeout)?
    .map_err(|e| HandshakeFailure::Transport(e.to_string()))?;

    match wire::decode_message(&frame) {
        Ok(WireMessage::Connect(connect)) => {
            routing::parse_target(&connect.target).map_err(HandshakeFailure::Route)
        }
        Ok(other) => Err(HandshakeFailure::Transport(format!(
            "expected Connect frame, got {:?}",
            other
        ))),
        Err(e) => Err(HandshakeFailure::Transport(e.to_string())),
    }
}

/// Close a connection that never completed its handshake.
fn reject_handshake(handle: &ConnectionHandle, failure: HandshakeFailure) {
    match failure {
        HandshakeFailure::Timeout => {
            tracing::warn!(id = ?handle.id(), "handshake timed out");
        }
        HandshakeFailure::Transport(reason) => {
            tracing::warn!(id = ?handle.id(), %reason, "abandoning broken connection");
        }
        HandshakeFailure::Route(e) => {
            // Same failure path as an unresolvable room / expired seat.
            let (code, message) = match e {
                RouteError::MalformedPath => (error_code::ROOM_NOT_FOUND, "room not found"),
                RouteError::MissingSessionId => {
                    (error_code::SEAT_EXPIRED, "seat reservation expired")
                }
            };
            tracing::warn!(id = ?handle.id(), error = %e, "rejecting unroutable connection");
            if let Ok(bytes) = wire::encode_message(&WireMessage::Error(ErrorFrame {
                code,
                message: message.to_string(),
            })) {
                let _ = handle.write(bytes);
            }
        }
    }
    handle.begin_close();
}

/// Post-handshake read loop: keepalive, data forwarding, disconnect detection.
async fn read_loop(
    mut frames: mpsc::Receiver<Result<Vec<u8>, FrameError>>,
    handle: &ConnectionHandle,
    sink: &dyn ConnectionSink,
    config: &ListenerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut last_recv = Instant::now();
    let mut ping_sequence: u32 = 0;
    let mut keepalive = tokio::time::interval_at(
        Instant::now() + config.keepalive_interval,
        config.keepalive_interval,
    );

    loop {
        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Some(Ok(bytes)) => {
                        last_recv = Instant::now();
                        match wire::decode_message(&bytes) {
                            Ok(WireMessage::Ping(ping)) => {
                                let pong = WireMessage::Pong(Pong { sequence: ping.sequence });
                                if let Ok(out) = wire::encode_message(&pong) {
                                    let _ = handle.write(out);
                                }
                            }
                            Ok(WireMessage::Pong(_)) => {}
                            Ok(WireMessage::Data(payload)) => {
                                sink.on_data(payload).await;
                            }
                            Ok(other) => {
                                tracing::debug!(id = ?handle.id(), frame = ?other, "ignoring unexpected frame");
                            }
                            Err(e) => {
                                tracing::warn!(id = ?handle.id(), error = %e, "undecodable frame, dropping connection");
                                break;
                            }
                        }
                    }
                    Some(Err(FrameError::ConnectionClosed)) | None => {
                        tracing::debug!(id = ?handle.id(), "peer disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(id = ?handle.id(), error = %e, "read failed, dropping connection");
                        break;
                    }
                }
            }
            _ = keepalive.tick() => {
                if last_recv.elapsed() > config.connection_timeout {
                    tracing::warn!(id = ?handle.id(), "keepalive timeout");
                    break;
                }
                ping_sequence = ping_sequence.wrapping_add(1);
                let ping = WireMessage::Ping(wire::Ping { sequence: ping_sequence });
                if let Ok(out) = wire::encode_message(&ping) {
                    let _ = handle.write(out);
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(id = ?handle.id(), "closing connection for shutdown");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Connect;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;

    /// Dispatcher that admits everyone and records what it sees.
    struct RecordingDispatcher {
        routes: Mutex<Vec<RouteInfo>>,
        events: Arc<SinkEvents>,
    }

    #[derive(Default)]
    struct SinkEvents {
        data: Mutex<Vec<Vec<u8>>>,
        closed: AtomicUsize,
    }

    struct RecordingSink {
        events: Arc<SinkEvents>,
    }

    #[async_trait]
    impl ConnectionSink for RecordingSink {
        async fn on_data(&self, payload: Vec<u8>) {
            self.events.data.lock().unwrap().push(payload);
        }

        async fn on_closed(&self) {
            self.events.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ConnectionDispatcher for RecordingDispatcher {
        async fn connect(
            &self,
            _handle: ConnectionHandle,
            route: RouteInfo,
        ) -> Option<Box<dyn ConnectionSink>> {
            self.routes.lock().unwrap().push(route);
            Some(Box::new(RecordingSink {
                events: Arc::clone(&self.events),
            }))
        }
    }

    async fn start_server(config: ListenerConfig) -> (SocketAddr, Arc<Listener>, Arc<RecordingDispatcher>) {
        let dispatcher = Arc::new(RecordingDispatcher {
            routes: Mutex::new(Vec::new()),
            events: Arc::new(SinkEvents::default()),
        });
        let listener = Arc::new(Listener::new(
            config,
            Arc::clone(&dispatcher) as Arc<dyn ConnectionDispatcher>,
        ));
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let srv = Arc::clone(&listener);
        tokio::spawn(async move {
            srv.run_with_listener(socket).await.unwrap();
        });
        (addr, listener, dispatcher)
    }

    async fn send_wire(stream: &mut TcpStream, msg: &WireMessage, config: &FrameConfig) {
        let bytes = wire::encode_message(msg).unwrap();
        framing::write_frame(stream, &bytes, config).await.unwrap();
    }

    async fn recv_wire(stream: &mut TcpStream, config: &FrameConfig) -> WireMessage {
        let bytes = framing::read_frame(stream, config).await.unwrap();
        wire::decode_message(&bytes).unwrap()
    }

    fn connect_msg(target: &str) -> WireMessage {
        WireMessage::Connect(Connect {
            target: target.to_string(),
        })
    }

    #[tokio::test]
    async fn test_connect_frame_is_routed_to_dispatcher() {
        let (addr, _listener, dispatcher) = start_server(ListenerConfig::default()).await;
        let frame_config = FrameConfig::default();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_wire(&mut stream, &connect_msg("/game/r1?sessionId=abc"), &frame_config).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let routes = dispatcher.routes.lock().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].room_id, "r1");
        assert_eq!(routes[0].session_id, "abc");
    }

    #[tokio::test]
    async fn test_data_frames_reach_sink_and_close_reported_once() {
        let (addr, _listener, dispatcher) = start_server(ListenerConfig::default()).await;
        let frame_config = FrameConfig::default();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_wire(&mut stream, &connect_msg("/game/r1?sessionId=abc"), &frame_config).await;
        send_wire(&mut stream, &WireMessage::Data(b"m1".to_vec()), &frame_config).await;
        send_wire(&mut stream, &WireMessage::Data(b"m2".to_vec()), &frame_config).await;
        drop(stream);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let data = dispatcher.events.data.lock().unwrap();
        assert_eq!(*data, vec![b"m1".to_vec(), b"m2".to_vec()]);
        assert_eq!(dispatcher.events.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_path_yields_room_not_found() {
        let (addr, _listener, dispatcher) = start_server(ListenerConfig::default()).await;
        let frame_config = FrameConfig::default();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_wire(&mut stream, &connect_msg("/nopath?sessionId=abc"), &frame_config).await;

        match recv_wire(&mut stream, &frame_config).await {
            WireMessage::Error(frame) => assert_eq!(frame.code, error_code::ROOM_NOT_FOUND),
            other => panic!("expected Error frame, got {:?}", other),
        }
        // The error frame is the only thing the peer sees before closure.
        let next = framing::read_frame(&mut stream, &frame_config).await;
        assert!(matches!(next, Err(FrameError::ConnectionClosed)));
        assert!(dispatcher.routes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_session_id_yields_seat_expired() {
        let (addr, _listener, _dispatcher) = start_server(ListenerConfig::default()).await;
        let frame_config = FrameConfig::default();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_wire(&mut stream, &connect_msg("/game/r1"), &frame_config).await;

        match recv_wire(&mut stream, &frame_config).await {
            WireMessage::Error(frame) => assert_eq!(frame.code, error_code::SEAT_EXPIRED),
            other => panic!("expected Error frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_connect_first_frame_is_abandoned() {
        let (addr, _listener, dispatcher) = start_server(ListenerConfig::default()).await;
        let frame_config = FrameConfig::default();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_wire(&mut stream, &WireMessage::Data(b"rude".to_vec()), &frame_config).await;

        let next = framing::read_frame(&mut stream, &frame_config).await;
        assert!(matches!(next, Err(FrameError::ConnectionClosed)));
        assert!(dispatcher.routes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broken_connection_does_not_affect_others() {
        let (addr, _listener, dispatcher) = start_server(ListenerConfig::default()).await;
        let frame_config = FrameConfig::default();

        // First client sends raw garbage with an absurd length prefix.
        let mut broken = TcpStream::connect(addr).await.unwrap();
        broken.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        broken.flush().await.unwrap();

        // Second client completes a normal handshake regardless.
        let mut fine = TcpStream::connect(addr).await.unwrap();
        send_wire(&mut fine, &connect_msg("/game/r1?sessionId=ok"), &frame_config).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let routes = dispatcher.routes.lock().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].session_id, "ok");
    }

    #[tokio::test]
    async fn test_server_pings_idle_connections() {
        let config = ListenerConfig {
            keepalive_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let (addr, _listener, _dispatcher) = start_server(config).await;
        let frame_config = FrameConfig::default();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_wire(&mut stream, &connect_msg("/game/r1?sessionId=abc"), &frame_config).await;

        match recv_wire(&mut stream, &frame_config).await {
            WireMessage::Ping(_) => {}
            other => panic!("expected Ping frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_keepalive_timeout_drops_silent_peer() {
        let config = ListenerConfig {
            keepalive_interval: Duration::from_millis(40),
            connection_timeout: Duration::from_millis(60),
            ..Default::default()
        };
        let (addr, _listener, dispatcher) = start_server(config).await;
        let frame_config = FrameConfig::default();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_wire(&mut stream, &connect_msg("/game/r1?sessionId=abc"), &frame_config).await;

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(dispatcher.events.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_connection_tasks() {
        let (addr, listener, dispatcher) = start_server(ListenerConfig::default()).await;
        let frame_config = FrameConfig::default();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_wire(&mut stream, &connect_msg("/game/r1?sessionId=abc"), &frame_config).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        listener.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dispatcher.events.closed.load(Ordering::SeqCst), 1);
    }
}
