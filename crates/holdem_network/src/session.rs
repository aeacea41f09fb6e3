//! Connection sessions — one per active peer.
//!
//! A [`Connection`] is the shareable write side of a peer stream; a
//! [`Session`] owns the read side and drives it until the stream fails or the
//! node shuts down. Frames written through a connection never interleave:
//! prefix, payload and flush happen under a single lock acquisition, bounded
//! by the write timeout. A failed write closes the connection, which ends its
//! read loop and so its registration.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::command::{Command, encode};
use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::events::NetworkEvent;
use crate::framing::read_frame;
use crate::identity::PeerId;
use crate::mesh::{Mesh, Shutdown};
use crate::router;
use crate::transport::{BoxedReader, BoxedWriter, Direction, PeerStream};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of one connection, distinguishing successive or
/// duplicate connections to the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Write handle to one peer.
pub struct Connection {
    id: ConnectionId,
    peer_id: PeerId,
    direction: Direction,
    addrs: Vec<String>,
    writer: Mutex<BufWriter<BoxedWriter>>,
    max_frame_size: usize,
    write_timeout: Duration,
    /// Wakes the read loop once the connection is closed locally.
    closed: Notify,
}

impl Connection {
    pub fn new(
        peer_id: PeerId,
        direction: Direction,
        addrs: Vec<String>,
        writer: BoxedWriter,
        max_frame_size: usize,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id: ConnectionId::next(),
            peer_id,
            direction,
            addrs,
            writer: Mutex::new(BufWriter::new(writer)),
            max_frame_size,
            write_timeout,
            closed: Notify::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Addresses the remote advertised during its handshake.
    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    /// The peer that opened this connection.
    pub fn dialer<'a>(&'a self, local: &'a PeerId) -> &'a PeerId {
        match self.direction {
            Direction::Outbound => local,
            Direction::Inbound => &self.peer_id,
        }
    }

    /// Write one frame carrying `payload`.
    ///
    /// Fails with [`NetworkError::Timeout`] when the frame cannot be written
    /// within the write timeout. Any failure leaves the stream unusable, so
    /// the read loop is told to stop.
    pub async fn send_bytes(&self, payload: &[u8]) -> Result<(), NetworkError> {
        let write = async {
            let mut writer = self.writer.lock().await;
            crate::framing::write_frame(&mut *writer, payload, self.max_frame_size).await
        };
        let result = match tokio::time::timeout(self.write_timeout, write).await {
            Ok(written) => written.map_err(NetworkError::from),
            Err(_) => Err(NetworkError::Timeout(self.write_timeout)),
        };
        if result.is_err() {
            self.closed.notify_one();
        }
        result
    }

    /// Encode and write one command.
    pub async fn send(&self, command: &Command) -> Result<(), NetworkError> {
        let bytes = encode(command)?;
        self.send_bytes(&bytes).await
    }

    /// Write an empty frame. Fails once the stream is dead.
    pub async fn keepalive(&self) -> Result<(), NetworkError> {
        self.send_bytes(&[]).await
    }

    /// Stop the read loop and shut down the write side. The remote sees
    /// end-of-stream.
    pub async fn close(&self) {
        self.closed.notify_one();
        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        };
        match tokio::time::timeout(self.write_timeout, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Closing connection {} to {}: {e}", self.id, self.peer_id),
            Err(_) => debug!("Connection {} to {} did not drain before close", self.id, self.peer_id),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("direction", &self.direction)
            .field("addrs", &self.addrs)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Stream obtained, not yet registered.
    Established,
    /// Registered, read loop running.
    Active,
    /// Read loop finished, no longer registered.
    Closed,
}

/// Read side of one peer stream plus its lifecycle.
pub struct Session {
    conn: Arc<Connection>,
    reader: BoxedReader,
    state: SessionState,
    max_frame_size: usize,
}

impl Session {
    pub fn new(stream: PeerStream, config: &NetworkConfig) -> Self {
        let PeerStream {
            remote,
            direction,
            reader,
            writer,
        } = stream;
        let conn = Connection::new(
            remote.peer_id,
            direction,
            remote.addrs,
            writer,
            config.max_frame_size,
            config.write_timeout,
        );
        Self {
            conn: Arc::new(conn),
            reader,
            state: SessionState::Established,
            max_frame_size: config.max_frame_size,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Register with the mesh. A session that loses a duplicate tie-break is
    /// closed instead.
    pub(crate) async fn activate(&mut self, mesh: &Mesh, lead: Option<NetworkEvent>) -> bool {
        if self.state != SessionState::Established {
            return false;
        }
        self.state = if mesh.activate(&self.conn, lead).await {
            SessionState::Active
        } else {
            SessionState::Closed
        };
        self.state == SessionState::Active
    }

    /// Read frames until the stream fails, the connection is closed locally,
    /// or the node shuts down.
    async fn run(mut self, mesh: Arc<Mesh>, mut shutdown: Shutdown) {
        let peer = self.conn.peer_id().clone();
        info!("Session {} with {peer} active ({})", self.conn.id(), self.conn.direction());

        let failure = loop {
            tokio::select! {
                frame = read_frame(&mut self.reader, self.max_frame_size) => match frame {
                    // Keep-alive.
                    Ok(payload) if payload.is_empty() => continue,
                    Ok(payload) => {
                        router::dispatch(&mesh, &peer, &payload).await;
                    }
                    Err(e) => break Some(NetworkError::from(e)),
                },
                _ = self.conn.closed.notified() => break None,
                _ = shutdown.wait() => break None,
            }
        };

        self.state = SessionState::Closed;
        mesh.registry.remove(&peer, self.conn.id());

        match failure {
            Some(e) if e.is_clean_close() => info!("Session with {peer} closed by remote"),
            Some(e) => {
                warn!("Session with {peer} failed: {e}");
                mesh.events.emit(NetworkEvent::error(e));
            }
            None => debug!("Session with {peer} ended locally"),
        }
    }
}

/// Turn `stream` into an active session and start its read loop.
///
/// Returns `None` when the stream lost a duplicate tie-break or the node has
/// stopped; the stream is closed either way.
pub(crate) async fn spawn_session(mesh: &Arc<Mesh>, stream: PeerStream) -> Option<Arc<Connection>> {
    let session = Session::new(stream, &mesh.config);
    start_session(mesh, session, None).await
}

/// Activate `session` and hand its read loop to the mesh's task set. `lead`
/// is emitted just before the registration's `PeersChanged`.
pub(crate) async fn start_session(
    mesh: &Arc<Mesh>,
    mut session: Session,
    lead: Option<NetworkEvent>,
) -> Option<Arc<Connection>> {
    let shutdown = mesh.subscribe_shutdown();
    if !session.activate(mesh, lead).await {
        return None;
    }
    let conn = Arc::clone(session.connection());
    mesh.spawn(read_loop(session, Arc::clone(mesh), shutdown));
    Some(conn)
}

/// Boxed so the read loop's type does not depend on itself: dispatching an
/// announcement may start another session.
fn read_loop(session: Session, mesh: Arc<Mesh>, shutdown: Shutdown) -> BoxFuture<'static, ()> {
    Box::pin(session.run(mesh, shutdown))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
