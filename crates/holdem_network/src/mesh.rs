//! Shared state of a running node.
//!
//! Every task the node spawns (accept loop, handshakes, session read loops,
//! keep-alive) holds an `Arc<Mesh>` and lives in the mesh's task set, so
//! stopping the node reaches all of them.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::command::{Command, encode};
use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::events::{EventBridge, NetworkEvent};
use crate::identity::{NodeIdentity, PeerId};
use crate::registry::PeerRegistry;
use crate::session::Connection;
use crate::transport::Transport;

pub(crate) struct Mesh {
    pub identity: NodeIdentity,
    pub config: NetworkConfig,
    pub transport: Arc<dyn Transport>,
    pub registry: PeerRegistry,
    pub events: EventBridge,
    /// Peers with an announcement-triggered dial in flight.
    dialing: Mutex<HashSet<PeerId>>,
    /// Latched to `true` on stop; late subscribers still see it.
    shutdown: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

/// Receiving side of the node-wide stop flag.
pub(crate) struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    /// Resolve once the node has stopped, immediately if it already has.
    pub async fn wait(&mut self) {
        // A closed channel means the mesh is gone, which is a stop as well.
        let _ = self.0.wait_for(|stopped| *stopped).await;
    }
}

/// Marks a dial as in flight until dropped.
pub(crate) struct DialGuard<'a> {
    mesh: &'a Mesh,
    peer: PeerId,
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        self.mesh.dialing.lock().remove(&self.peer);
    }
}

impl Mesh {
    pub fn new(
        config: NetworkConfig,
        transport: Arc<dyn Transport>,
        events: EventBridge,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            identity: transport.local_identity().clone(),
            config,
            transport,
            registry: PeerRegistry::new(events.clone()),
            events,
            dialing: Mutex::new(HashSet::new()),
            shutdown,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.identity.peer_id
    }

    pub fn subscribe_shutdown(&self) -> Shutdown {
        Shutdown(self.shutdown.subscribe())
    }

    /// Latch the stop flag. Every current and future [`Shutdown`] resolves.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run `task` in the mesh's task set, reaping finished tasks first.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Abort every task spawned through [`Mesh::spawn`].
    pub fn abort_tasks(&self) {
        self.tasks.lock().abort_all();
    }

    /// Number of spawned tasks not yet reaped.
    #[cfg(test)]
    pub fn task_count(&self) -> usize {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Claim the right to dial `peer`. `None` if a dial is already running.
    pub fn begin_dial(&self, peer: &PeerId) -> Option<DialGuard<'_>> {
        if !self.dialing.lock().insert(peer.clone()) {
            return None;
        }
        Some(DialGuard {
            mesh: self,
            peer: peer.clone(),
        })
    }

    /// Register `conn`, resolving a duplicate connection to the same peer.
    ///
    /// Of two connections between the same pair of nodes, the one opened by
    /// the node with the smaller peer id survives. Both ends compute the same
    /// verdict. Returns whether `conn` is now the registered connection; a
    /// losing connection is closed here. Once the node has stopped nothing is
    /// registered any more.
    ///
    /// `lead` is emitted just ahead of the `PeersChanged` a fresh
    /// registration causes.
    pub async fn activate(&self, conn: &Arc<Connection>, lead: Option<NetworkEvent>) -> bool {
        if self.is_shut_down() {
            debug!("Node stopped, refusing connection to {}", conn.peer_id());
            conn.close().await;
            return false;
        }

        if self.registry.put_leading(Arc::clone(conn), lead) {
            if self.is_shut_down() {
                // Stop cleared the registry while we were inserting.
                self.registry.remove(conn.peer_id(), conn.id());
                conn.close().await;
                return false;
            }
            return true;
        }

        let local = self.local_id();
        let Some(existing) = self.registry.get(conn.peer_id()) else {
            // Removed between the two calls.
            return self.registry.put(Arc::clone(conn));
        };

        if conn.dialer(local) < existing.dialer(local) {
            if let Some(displaced) = self.registry.replace(Arc::clone(conn), existing.id()) {
                info!(
                    "Replacing connection {} to {} with {}",
                    displaced.id(),
                    conn.peer_id(),
                    conn.id()
                );
                displaced.close().await;
                return true;
            }
        }

        debug!(
            "Dropping duplicate connection {} to {}",
            conn.id(),
            conn.peer_id()
        );
        conn.close().await;
        false
    }

    /// Send `command` to every active peer not in `exclude`.
    ///
    /// Returns the number of peers the frame was written to. A peer whose
    /// write fails is closed; its session then ends on its own.
    pub async fn broadcast_except(
        &self,
        command: &Command,
        exclude: &[PeerId],
    ) -> Result<usize, NetworkError> {
        let bytes = encode(command)?;
        let targets: Vec<Arc<Connection>> = self
            .registry
            .connections()
            .into_iter()
            .filter(|conn| !exclude.contains(conn.peer_id()))
            .collect();

        let results = join_all(targets.iter().map(|conn| conn.send_bytes(&bytes))).await;

        let mut delivered = 0;
        for (conn, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("{} to {} failed: {e}", command.tag(), conn.peer_id());
                    conn.close().await;
                }
            }
        }
        debug!("Sent {} to {delivered} peers", command.tag());
        Ok(delivered)
    }

    /// Send `command` to one active peer.
    pub async fn send_to(&self, peer: &PeerId, command: &Command) -> Result<(), NetworkError> {
        let conn = self
            .registry
            .get(peer)
            .ok_or_else(|| NetworkError::PeerNotFound(peer.to_string()))?;
        if let Err(e) = conn.send(command).await {
            warn!("{} to {peer} failed: {e}", command.tag());
            conn.close().await;
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_mesh(
    name: &str,
) -> (
    Arc<Mesh>,
    Arc<crate::transport::mock::MockTransport>,
    crate::events::EventReceiver,
) {
    test_mesh_with(name, NetworkConfig::default())
}

#[cfg(test)]
pub(crate) fn test_mesh_with(
    name: &str,
    config: NetworkConfig,
) -> (
    Arc<Mesh>,
    Arc<crate::transport::mock::MockTransport>,
    crate::events::EventReceiver,
) {
    let identity = NodeIdentity {
        peer_id: PeerId::from_string(name),
        name: name.to_string(),
        version: "test".to_string(),
        addrs: Vec::new(),
    };
    let transport = Arc::new(crate::transport::mock::MockTransport::new(identity));
    let (events, rx) = EventBridge::new(config.event_queue_capacity);
    let mesh = Mesh::new(
        config,
        Arc::clone(&transport) as Arc<dyn Transport>,
        events,
    );
    (Arc::new(mesh), transport, rx)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::io::DuplexStream;

    use super::*;
    use crate::command::{CommandTag, decode};
    use crate::framing::{DEFAULT_MAX_FRAME_SIZE, read_frame};
    use crate::session::spawn_session;
    use crate::transport::Direction;
    use crate::transport::mock::duplex_stream;

    async fn connect(mesh: &Arc<Mesh>, peer: &str, direction: Direction) -> DuplexStream {
        let (stream, far) = duplex_stream(&PeerId::from_string(peer), direction);
        spawn_session(mesh, stream).await.unwrap();
        far
    }

    async fn next_tag(far: &mut DuplexStream) -> CommandTag {
        let frame = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            read_frame(far, DEFAULT_MAX_FRAME_SIZE),
        )
        .await
        .unwrap()
        .unwrap();
        decode(&frame).unwrap().tag()
    }

    async fn nothing_pending(far: &mut DuplexStream) -> bool {
        tokio::time::timeout(
            std::time::Duration::from_millis(100),
            read_frame(far, DEFAULT_MAX_FRAME_SIZE),
        )
        .await
        .is_err()
    }

    #[tokio::test]
    async fn test_broadcast_except_skips_excluded() {
        let (mesh, _transport, _rx) = test_mesh("local");
        let mut a = connect(&mesh, "a", Direction::Inbound).await;
        let mut b = connect(&mesh, "b", Direction::Inbound).await;
        let mut c = connect(&mesh, "c", Direction::Outbound).await;
        let mut d = connect(&mesh, "d", Direction::Outbound).await;

        let sent = mesh
            .broadcast_except(&Command::tick("t1"), &[PeerId::from_string("b")])
            .await
            .unwrap();
        assert_eq!(sent, 3);

        assert_eq!(next_tag(&mut a).await, CommandTag::Tick);
        assert_eq!(next_tag(&mut c).await, CommandTag::Tick);
        assert_eq!(next_tag(&mut d).await, CommandTag::Tick);
        assert!(nothing_pending(&mut b).await);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_peers() {
        let (mesh, _transport, _rx) = test_mesh("local");
        assert_eq!(
            mesh.broadcast_except(&Command::tick("t"), &[]).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let (mesh, _transport, _rx) = test_mesh("local");
        let result = mesh
            .send_to(&PeerId::from_string("ghost"), &Command::tick("t"))
            .await;
        assert!(matches!(result, Err(NetworkError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_send_to_reaches_only_target() {
        let (mesh, _transport, _rx) = test_mesh("local");
        let mut a = connect(&mesh, "a", Direction::Inbound).await;
        let mut b = connect(&mesh, "b", Direction::Inbound).await;

        mesh.send_to(
            &PeerId::from_string("a"),
            &Command::chat(&PeerId::from_string("local"), "psst"),
        )
        .await
        .unwrap();
        assert_eq!(next_tag(&mut a).await, CommandTag::Chat);
        assert!(nothing_pending(&mut b).await);
    }

    #[tokio::test]
    async fn test_dial_guard_dedups_until_dropped() {
        let (mesh, _transport, _rx) = test_mesh("local");
        let peer = PeerId::from_string("x");
        let guard = mesh.begin_dial(&peer).unwrap();
        assert!(mesh.begin_dial(&peer).is_none());
        drop(guard);
        assert!(mesh.begin_dial(&peer).is_some());
    }

    #[tokio::test]
    async fn test_duplicate_tie_break_keeps_smaller_dialer() {
        // Local id "m" sits between the two remotes.
        let (mesh, _transport, _rx) = test_mesh("m");

        // Remote "a" < "m": the connection "a" opened wins.
        let (ours, _ours_far) = duplex_stream(&PeerId::from_string("a"), Direction::Outbound);
        let (theirs, _theirs_far) = duplex_stream(&PeerId::from_string("a"), Direction::Inbound);
        let ours = spawn_session(&mesh, ours).await.unwrap();
        let theirs = spawn_session(&mesh, theirs).await.unwrap();
        assert_eq!(
            mesh.registry.get(&PeerId::from_string("a")).unwrap().id(),
            theirs.id()
        );
        assert_ne!(ours.id(), theirs.id());

        // Remote "z" > "m": the connection we opened wins, arriving second
        // does not matter.
        let (ours, _ours_far) = duplex_stream(&PeerId::from_string("z"), Direction::Outbound);
        let (theirs, _theirs_far) = duplex_stream(&PeerId::from_string("z"), Direction::Inbound);
        let theirs_conn = spawn_session(&mesh, theirs).await.unwrap();
        let ours_conn = spawn_session(&mesh, ours).await.unwrap();
        assert_eq!(
            mesh.registry.get(&PeerId::from_string("z")).unwrap().id(),
            ours_conn.id()
        );
        assert_ne!(theirs_conn.id(), ours_conn.id());
        assert_eq!(mesh.registry.len(), 2);
    }

    #[tokio::test]
    async fn test_same_direction_duplicate_keeps_existing() {
        let (mesh, _transport, _rx) = test_mesh("local");
        let (first, _first_far) = duplex_stream(&PeerId::from_string("p"), Direction::Inbound);
        let (second, mut second_far) = duplex_stream(&PeerId::from_string("p"), Direction::Inbound);
        let first = spawn_session(&mesh, first).await.unwrap();
        assert!(spawn_session(&mesh, second).await.is_none());
        assert_eq!(
            mesh.registry.get(&PeerId::from_string("p")).unwrap().id(),
            first.id()
        );

        // The loser's stream was shut down.
        let mut buf = [0u8; 1];
        let n = tokio::io::AsyncReadExt::read(&mut second_far, &mut buf)
            .await
            .unwrap();
        assert_eq!(n, 0);
    }
}
