//! GameNode — top-level controller for the networking layer.
//!
//! [`GameNode`] is the primary public API for holdem_network. It manages:
//! - the listener and its accept loop (every node accepts, host or not)
//! - the initial dial when joining an existing table
//! - the keep-alive loop
//! - the consumer-facing send operations
//!
//! Everything the node learns is reported through its [`EventBridge`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::config::NetworkConfig;
use crate::discovery::announce_new_peer;
use crate::error::NetworkError;
use crate::events::{EventBridge, EventReceiver, NetworkEvent};
use crate::identity::{NodeIdentity, PeerAddr, PeerId};
use crate::mesh::Mesh;
use crate::session::{Session, spawn_session, start_session};
use crate::transport::{Direction, TcpTransport, Transport};

/// How long `stop` waits for a connection's writer before giving up on it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A snapshot of one active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub peer_id: PeerId,
    pub direction: Direction,
    pub addrs: Vec<String>,
}

/// A participant in the game's peer-to-peer mesh.
///
/// Create one per process. Call [`start()`](GameNode::start) to listen and,
/// when a dial target is configured, join the table it belongs to.
pub struct GameNode {
    /// Our identity; gains its listen addresses on start.
    identity: NodeIdentity,
    config: NetworkConfig,
    events: EventBridge,
    /// Shared state, present while running.
    mesh: Option<Arc<Mesh>>,
    local_addr: Option<SocketAddr>,
}

impl GameNode {
    pub fn new(identity: NodeIdentity, config: NetworkConfig, events: EventBridge) -> Self {
        Self {
            identity,
            config,
            events,
            mesh: None,
            local_addr: None,
        }
    }

    /// Create a node together with the receiving end of its event bridge,
    /// sized from `config.event_queue_capacity`.
    pub fn with_events(identity: NodeIdentity, config: NetworkConfig) -> (Self, EventReceiver) {
        let (events, rx) = EventBridge::new(config.event_queue_capacity);
        (Self::new(identity, config, events), rx)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.identity.peer_id
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.mesh.is_some()
    }

    /// Host mode: started without a peer to join.
    pub fn is_host(&self) -> bool {
        self.config.is_host()
    }

    /// The bound listen address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Peers with an active session, sorted.
    pub fn peers(&self) -> Vec<PeerId> {
        self.mesh
            .as_ref()
            .map(|mesh| mesh.registry.snapshot())
            .unwrap_or_default()
    }

    /// Details of every active session, sorted by peer.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let Some(mesh) = &self.mesh else {
            return Vec::new();
        };
        let mut sessions: Vec<SessionInfo> = mesh
            .registry
            .connections()
            .iter()
            .map(|conn| SessionInfo {
                peer_id: conn.peer_id().clone(),
                direction: conn.direction(),
                addrs: conn.addrs().to_vec(),
            })
            .collect();
        sessions.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        sessions
    }

    /// Start the node.
    ///
    /// Binds the listener, then in dialer mode connects to the configured
    /// target and registers that session, queuing `Ready` just ahead of the
    /// `PeersChanged` it causes. Either failure is terminal: it is reported as
    /// an `Error` event, returned, and `Ready` is never emitted. Starting a
    /// running node is a no-op.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.mesh.is_some() {
            return Ok(());
        }

        let target = match self.config.dial_target.as_deref().map(PeerAddr::parse) {
            Some(Ok(target)) => Some(target),
            Some(Err(e)) => return Err(self.fail(e)),
            None => None,
        };

        let transport = match TcpTransport::bind(self.identity.clone(), &self.config).await {
            Ok(transport) => transport,
            Err(e) => return Err(self.fail(e)),
        };
        self.local_addr = Some(transport.local_addr());
        self.identity = transport.local_identity().clone();

        let mesh = Arc::new(Mesh::new(
            self.config.clone(),
            Arc::new(transport),
            self.events.clone(),
        ));

        let initial = match &target {
            Some(target) => {
                info!("Joining table via {target}");
                match mesh.transport.dial(target).await {
                    Ok(stream) => Some(stream),
                    Err(e) => return Err(self.fail(e)),
                }
            }
            None => None,
        };

        let ready = NetworkEvent::Ready {
            is_host: initial.is_none(),
            identity: self.identity.clone(),
        };
        match initial {
            None => self.events.emit(ready),
            Some(stream) => {
                let session = Session::new(stream, &mesh.config);
                let peer = session.connection().peer_id().clone();
                if start_session(&mesh, session, Some(ready)).await.is_none() {
                    warn!("Initial session with {peer} was not registered");
                    mesh.shutdown();
                    mesh.abort_tasks();
                    return Err(self.fail(NetworkError::ConnectFailed {
                        peer: peer.to_string(),
                        reason: "session was not registered".to_string(),
                    }));
                }
            }
        }
        info!(
            "GameNode '{}' ready (peer_id: {}, host: {})",
            self.identity.name,
            self.identity.peer_id,
            self.is_host()
        );

        mesh.spawn(accept_loop(Arc::clone(&mesh)));
        mesh.spawn(keepalive_loop(Arc::clone(&mesh)));
        self.mesh = Some(mesh);
        Ok(())
    }

    /// Stop the node, ending every session and background task.
    ///
    /// The stop is latched: a handshake that completes afterwards is refused
    /// rather than registered.
    pub async fn stop(&mut self) {
        let Some(mesh) = self.mesh.take() else {
            return;
        };
        mesh.shutdown();
        mesh.abort_tasks();

        let closing = mesh.registry.clear();
        join_all(closing.iter().map(|conn| async move {
            if tokio::time::timeout(CLOSE_TIMEOUT, conn.close()).await.is_err() {
                debug!("Gave up closing connection to {}", conn.peer_id());
            }
        }))
        .await;
        info!("GameNode '{}' stopped", self.identity.name);
    }

    /// Start, run until `signal` completes, then stop.
    pub async fn run_until<F>(&mut self, signal: F) -> Result<(), NetworkError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        self.stop().await;
        Ok(())
    }

    /// Send `command` to every active peer. Returns how many were reached.
    pub async fn broadcast(&self, command: &Command) -> Result<usize, NetworkError> {
        self.broadcast_except(command, &[]).await
    }

    /// Send `command` to every active peer not listed in `exclude`.
    pub async fn broadcast_except(
        &self,
        command: &Command,
        exclude: &[PeerId],
    ) -> Result<usize, NetworkError> {
        self.running()?.broadcast_except(command, exclude).await
    }

    /// Send `command` to a single peer.
    pub async fn send_to(&self, peer: &PeerId, command: &Command) -> Result<(), NetworkError> {
        self.running()?.send_to(peer, command).await
    }

    fn running(&self) -> Result<&Arc<Mesh>, NetworkError> {
        self.mesh.as_ref().ok_or(NetworkError::NotRunning)
    }

    fn fail(&self, cause: NetworkError) -> NetworkError {
        error!("GameNode '{}' failed to start: {cause}", self.identity.name);
        self.events.emit(NetworkEvent::error(cause.clone()));
        cause
    }
}

/// Accept inbound streams until shutdown. Each handshake runs in its own
/// task; a completed one becomes a session and is announced to the mesh.
async fn accept_loop(mesh: Arc<Mesh>) {
    let mut shutdown = mesh.subscribe_shutdown();
    loop {
        tokio::select! {
            accepted = mesh.transport.accept() => match accepted {
                Ok(handshaking) => {
                    let task_mesh = Arc::clone(&mesh);
                    mesh.spawn(async move {
                        let mesh = task_mesh;
                        match handshaking.await {
                            Ok(stream) => {
                                if let Some(conn) = spawn_session(&mesh, stream).await {
                                    announce_new_peer(&mesh, &conn).await;
                                }
                            }
                            Err(e) => {
                                warn!("Inbound handshake failed: {e}");
                                mesh.events.emit(NetworkEvent::error(e));
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.wait() => {
                debug!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Write an empty frame to every session at the configured interval. Peers
/// are written concurrently, so one stalled peer only costs its own write
/// timeout; a failed write closes that connection and is reported.
async fn keepalive_loop(mesh: Arc<Mesh>) {
    let interval = mesh.config.keepalive_interval;
    if interval.is_zero() {
        return;
    }
    let mut shutdown = mesh.subscribe_shutdown();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let conns = mesh.registry.connections();
                let mesh = &mesh;
                join_all(conns.iter().map(|conn| async move {
                    if let Err(e) = conn.keepalive().await {
                        warn!("Keep-alive to {} failed: {e}", conn.peer_id());
                        conn.close().await;
                        mesh.events.emit(NetworkEvent::error(e));
                    }
                }))
                .await;
            }
            _ = shutdown.wait() => {
                debug!("Keep-alive loop shutting down");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use crate::command::encode;
    use crate::framing::{DEFAULT_MAX_FRAME_SIZE, read_frame, write_frame};
    use crate::mesh::test_mesh_with;
    use crate::transport::mock::duplex_stream;

    fn loopback_config() -> NetworkConfig {
        NetworkConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            connect_timeout: Duration::from_secs(2),
            ..NetworkConfig::default()
        }
    }

    async fn next_event(rx: &mut EventReceiver) -> NetworkEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bridge closed")
    }

    #[test]
    fn test_node_creation() {
        let (node, _rx) = GameNode::with_events(NodeIdentity::generate("test-node"), NetworkConfig::default());
        assert!(!node.is_running());
        assert!(node.is_host());
        assert_eq!(node.identity().name, "test-node");
        assert!(node.local_addr().is_none());
        assert!(node.peers().is_empty());
    }

    #[tokio::test]
    async fn test_host_start_emits_ready() {
        let (mut node, mut rx) = GameNode::with_events(NodeIdentity::generate("host"), loopback_config());
        node.start().await.unwrap();
        assert!(node.is_running());

        let addr = node.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(node.identity().addrs, vec![addr.to_string()]);

        match next_event(&mut rx).await {
            NetworkEvent::Ready { is_host, identity } => {
                assert!(is_host);
                assert_eq!(identity.peer_id, *node.peer_id());
            }
            other => panic!("expected Ready, got {other:?}"),
        }

        node.stop().await;
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_double_start_is_noop() {
        let (mut node, mut rx) = GameNode::with_events(NodeIdentity::generate("twice"), loopback_config());
        node.start().await.unwrap();
        let addr = node.local_addr();
        node.start().await.unwrap();
        assert_eq!(node.local_addr(), addr);

        next_event(&mut rx).await;
        assert!(rx.try_recv().is_none());
        node.stop().await;
    }

    #[tokio::test]
    async fn test_send_when_not_running() {
        let (node, _rx) = GameNode::with_events(NodeIdentity::generate("stopped"), NetworkConfig::default());
        let tick = Command::tick("t");
        assert!(matches!(
            node.broadcast(&tick).await,
            Err(NetworkError::NotRunning)
        ));
        assert!(matches!(
            node.send_to(&PeerId::from_string("x"), &tick).await,
            Err(NetworkError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_bind_failure_is_terminal() {
        let (mut first, _rx1) = GameNode::with_events(NodeIdentity::generate("first"), loopback_config());
        first.start().await.unwrap();

        let config = NetworkConfig {
            listen_addr: first.local_addr().unwrap(),
            ..loopback_config()
        };
        let (mut second, mut rx) = GameNode::with_events(NodeIdentity::generate("second"), config);
        assert!(matches!(
            second.start().await,
            Err(NetworkError::Bind { .. })
        ));
        assert!(!second.is_running());
        assert!(matches!(
            next_event(&mut rx).await,
            NetworkEvent::Error { cause: NetworkError::Bind { .. } }
        ));
        assert!(rx.try_recv().is_none());

        first.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_target_is_terminal() {
        let port = {
            let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            spare.local_addr().unwrap().port()
        };
        let config = NetworkConfig {
            dial_target: Some(format!("127.0.0.1:{port}")),
            ..loopback_config()
        };
        let (mut node, mut rx) = GameNode::with_events(NodeIdentity::generate("joiner"), config);
        assert!(matches!(
            node.start().await,
            Err(NetworkError::ConnectFailed { .. })
        ));
        assert!(!node.is_running());
        assert!(matches!(
            next_event(&mut rx).await,
            NetworkEvent::Error { cause: NetworkError::ConnectFailed { .. } }
        ));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_invalid_target_is_terminal() {
        let config = NetworkConfig {
            dial_target: Some("not an address".to_string()),
            ..loopback_config()
        };
        let (mut node, mut rx) = GameNode::with_events(NodeIdentity::generate("joiner"), config);
        assert!(matches!(
            node.start().await,
            Err(NetworkError::InvalidAddress(_))
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            NetworkEvent::Error { cause: NetworkError::InvalidAddress(_) }
        ));
    }

    #[tokio::test]
    async fn test_two_nodes_exchange_commands() {
        let (mut host, mut host_rx) = GameNode::with_events(NodeIdentity::generate("host"), loopback_config());
        host.start().await.unwrap();
        next_event(&mut host_rx).await;

        let config = NetworkConfig {
            dial_target: Some(host.identity().dial_targets()[0].to_string()),
            ..loopback_config()
        };
        let (mut guest, mut guest_rx) = GameNode::with_events(NodeIdentity::generate("guest"), config);
        guest.start().await.unwrap();
        // The initial session is registered by the time start returns.
        assert_eq!(guest.peers(), vec![host.peer_id().clone()]);

        assert!(matches!(
            next_event(&mut guest_rx).await,
            NetworkEvent::Ready { is_host: false, .. }
        ));
        match next_event(&mut guest_rx).await {
            NetworkEvent::PeersChanged { peers } => assert_eq!(peers, vec![host.peer_id().clone()]),
            other => panic!("expected PeersChanged, got {other:?}"),
        }
        match next_event(&mut host_rx).await {
            NetworkEvent::PeersChanged { peers } => assert_eq!(peers, vec![guest.peer_id().clone()]),
            other => panic!("expected PeersChanged, got {other:?}"),
        }

        let sessions = host.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].direction, Direction::Inbound);
        assert_eq!(guest.sessions()[0].direction, Direction::Outbound);

        let sent = guest
            .broadcast(&Command::chat(guest.peer_id(), "hello table"))
            .await
            .unwrap();
        assert_eq!(sent, 1);
        match next_event(&mut host_rx).await {
            NetworkEvent::CommandReceived { from, tag, payload } => {
                assert_eq!(from, *guest.peer_id());
                assert_eq!(tag, crate::command::CommandTag::Chat);
                match crate::command::decode(&payload).unwrap() {
                    Command::Chat(chat) => assert_eq!(chat.content, "hello table"),
                    other => panic!("expected chat, got {other:?}"),
                }
            }
            other => panic!("expected CommandReceived, got {other:?}"),
        }

        host.send_to(guest.peer_id(), &Command::tick("t1")).await.unwrap();
        assert!(matches!(
            next_event(&mut guest_rx).await,
            NetworkEvent::CommandReceived { tag: crate::command::CommandTag::Tick, .. }
        ));

        // The guest leaving shows up on the host.
        guest.stop().await;
        match next_event(&mut host_rx).await {
            NetworkEvent::PeersChanged { peers } => assert!(peers.is_empty()),
            other => panic!("expected PeersChanged, got {other:?}"),
        }
        host.stop().await;
    }

    #[tokio::test]
    async fn test_run_until_stops_on_signal() {
        let (mut node, mut rx) = GameNode::with_events(NodeIdentity::generate("runner"), loopback_config());
        node.run_until(async {}).await.unwrap();
        assert!(!node.is_running());
        assert!(matches!(next_event(&mut rx).await, NetworkEvent::Ready { .. }));
    }

    #[tokio::test]
    async fn test_handshake_finishing_after_stop_is_refused() {
        let (mut node, mut rx) = GameNode::with_events(NodeIdentity::generate("host"), loopback_config());
        node.start().await.unwrap();
        next_event(&mut rx).await;

        let mut raw = tokio::net::TcpStream::connect(node.local_addr().unwrap())
            .await
            .unwrap();
        // The host speaks first, so its handshake is under way.
        let hello = read_frame(&mut raw, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert!(!hello.is_empty());

        node.stop().await;

        let latecomer = PeerId::from_string("latecomer");
        let ours = serde_json::json!({"peer_id": "latecomer", "addrs": [], "version": "test"});
        let _ = write_frame(&mut raw, &serde_json::to_vec(&ours).unwrap(), DEFAULT_MAX_FRAME_SIZE).await;
        let chat = encode(&Command::chat(&latecomer, "anyone there?")).unwrap();
        let _ = write_frame(&mut raw, &chat, DEFAULT_MAX_FRAME_SIZE).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_none());
        assert!(node.peers().is_empty());
    }

    #[tokio::test]
    async fn test_stop_aborts_background_tasks() {
        let (mut node, _rx) = GameNode::with_events(NodeIdentity::generate("host"), loopback_config());
        node.start().await.unwrap();
        let mesh = Arc::clone(node.mesh.as_ref().unwrap());
        assert_eq!(mesh.task_count(), 2);

        node.stop().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mesh.task_count(), 0);
        assert!(mesh.is_shut_down());
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_starve_keepalives() {
        let config = NetworkConfig {
            keepalive_interval: Duration::from_millis(50),
            write_timeout: Duration::from_millis(200),
            ..NetworkConfig::default()
        };
        let (mesh, _transport, _rx) = test_mesh_with("local", config);
        let stalled_id = PeerId::from_string("a");
        let healthy_id = PeerId::from_string("b");
        let (stalled, _stalled_far) = duplex_stream(&stalled_id, Direction::Inbound);
        let (healthy, mut healthy_far) = duplex_stream(&healthy_id, Direction::Inbound);
        let stalled = spawn_session(&mesh, stalled).await.unwrap();
        spawn_session(&mesh, healthy).await.unwrap();

        // Far more than the pipe holds; nobody reads the stalled end.
        let big = Command::chat(&stalled_id, "x".repeat(200 * 1024));
        let blocked = tokio::spawn(async move { stalled.send(&big).await });
        mesh.spawn(keepalive_loop(Arc::clone(&mesh)));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut keepalives = 0;
        while let Ok(frame) =
            tokio::time::timeout_at(deadline, read_frame(&mut healthy_far, DEFAULT_MAX_FRAME_SIZE)).await
        {
            if frame.unwrap().is_empty() {
                keepalives += 1;
            }
        }
        assert!(keepalives >= 5, "only {keepalives} keep-alives in a second");

        assert!(matches!(
            blocked.await.unwrap(),
            Err(NetworkError::Timeout(_))
        ));
        assert!(!mesh.registry.has(&stalled_id));
        assert!(mesh.registry.has(&healthy_id));

        mesh.shutdown();
        mesh.abort_tasks();
    }
}
