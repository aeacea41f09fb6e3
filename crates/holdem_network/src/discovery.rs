//! Gossip discovery — growing a star or chain of connections into a full
//! mesh.
//!
//! When a node accepts a new peer it announces that peer to everyone else it
//! is connected to. A node receiving an announcement for a peer it has no
//! session with dials it. Repeating this for every new edge converges on
//! full connectivity without a central directory. Announcements may arrive
//! several times from different intermediaries, so handling them is
//! idempotent.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::command::{AnnouncementPayload, Command, CommandTag};
use crate::error::NetworkError;
use crate::events::NetworkEvent;
use crate::identity::PeerId;
use crate::mesh::Mesh;
use crate::session::{Connection, spawn_session};

/// Result of handling one announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncementOutcome {
    /// It named this node.
    SelfAnnouncement,
    /// It carried no usable peer id.
    Invalid,
    /// A session to the peer already exists.
    AlreadyConnected,
    /// Another announcement already triggered a dial to the peer.
    AlreadyDialing,
    /// A new session to the peer was established.
    Connected,
    /// The dial failed; an error event was emitted.
    Failed,
}

/// Tell every other active peer about `conn`'s peer.
///
/// Called once an accepted inbound session is active.
pub(crate) async fn announce_new_peer(mesh: &Mesh, conn: &Connection) {
    let peer = conn.peer_id();
    let mut addrs = mesh.transport.address_book().addrs(peer);
    if addrs.is_empty() {
        addrs = conn.addrs().to_vec();
    }

    let announcement = Command::announcement(peer, addrs);
    match mesh
        .broadcast_except(&announcement, std::slice::from_ref(peer))
        .await
    {
        Ok(0) => debug!("No one to announce {peer} to"),
        Ok(n) => info!("Announced {peer} to {n} peers"),
        Err(e) => warn!("Failed to announce {peer}: {e}"),
    }
}

/// React to an announcement received from `from`.
pub(crate) async fn handle_announcement(
    mesh: &Arc<Mesh>,
    from: &PeerId,
    announcement: AnnouncementPayload,
) -> AnnouncementOutcome {
    let peer = announcement.peer.peer_id();
    if peer == *mesh.local_id() {
        return AnnouncementOutcome::SelfAnnouncement;
    }
    if peer.as_str().is_empty() {
        mesh.events.emit(NetworkEvent::error(NetworkError::MalformedPayload {
            tag: CommandTag::Announcement,
            reason: "empty peer id".to_string(),
        }));
        return AnnouncementOutcome::Invalid;
    }

    mesh.transport
        .address_book()
        .add_addrs(&peer, announcement.peer.addrs);

    if mesh.registry.has(&peer) {
        debug!("{from} announced {peer}, already connected");
        return AnnouncementOutcome::AlreadyConnected;
    }
    let Some(_dialing) = mesh.begin_dial(&peer) else {
        debug!("{from} announced {peer}, dial already in flight");
        return AnnouncementOutcome::AlreadyDialing;
    };
    // A dial that finished just before we claimed the slot.
    if mesh.registry.has(&peer) {
        return AnnouncementOutcome::AlreadyConnected;
    }

    info!("{from} announced {peer}, connecting");
    let timeout = mesh.config.connect_timeout;
    let result = match tokio::time::timeout(timeout, mesh.transport.dial_peer(&peer)).await {
        Ok(Ok(stream)) if stream.peer_id() == &peer => Ok(stream),
        Ok(Ok(stream)) => Err(format!("reached {} instead", stream.peer_id())),
        Ok(Err(NetworkError::ConnectFailed { reason, .. })) => Err(reason),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {timeout:?}")),
    };

    match result {
        Ok(stream) => match spawn_session(mesh, stream).await {
            Some(_) => AnnouncementOutcome::Connected,
            None => AnnouncementOutcome::AlreadyConnected,
        },
        Err(reason) => {
            warn!("Connect to announced peer {peer} failed: {reason}");
            mesh.events.emit(NetworkEvent::error(NetworkError::ConnectFailed {
                peer: peer.to_string(),
                reason,
            }));
            AnnouncementOutcome::Failed
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::command::{PeerDto, decode};
    use crate::events::EventReceiver;
    use crate::framing::{DEFAULT_MAX_FRAME_SIZE, read_frame};
    use crate::mesh::test_mesh;
    use crate::transport::mock::duplex_stream;
    use crate::transport::{Direction, Transport};

    fn announcement(peer: &str, addrs: &[&str]) -> AnnouncementPayload {
        AnnouncementPayload {
            peer: PeerDto {
                id: peer.to_string(),
                addrs: addrs.iter().map(|a| a.to_string()).collect(),
            },
        }
    }

    fn drain(rx: &mut EventReceiver) -> Vec<NetworkEvent> {
        std::iter::from_fn(|| rx.try_recv()).collect()
    }

    #[tokio::test]
    async fn test_announcement_of_self_is_ignored() {
        let (mesh, transport, mut rx) = test_mesh("local");
        let outcome = handle_announcement(
            &mesh,
            &PeerId::from_string("a"),
            announcement("local", &["1.2.3.4:5"]),
        )
        .await;
        assert_eq!(outcome, AnnouncementOutcome::SelfAnnouncement);
        assert_eq!(transport.dial_count(), 0);
        assert!(transport.address_book().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_announcement_of_unknown_peer_connects() {
        let (mesh, transport, mut rx) = test_mesh("local");
        let outcome = handle_announcement(
            &mesh,
            &PeerId::from_string("a"),
            announcement("c", &["10.0.0.3:3000"]),
        )
        .await;

        assert_eq!(outcome, AnnouncementOutcome::Connected);
        assert_eq!(transport.dial_count(), 1);
        assert!(mesh.registry.has(&PeerId::from_string("c")));
        assert_eq!(
            transport.address_book().addrs(&PeerId::from_string("c")),
            vec!["10.0.0.3:3000"]
        );
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [NetworkEvent::PeersChanged { .. }]
        ));
    }

    #[tokio::test]
    async fn test_duplicate_announcements_are_idempotent() {
        let (mesh, transport, _rx) = test_mesh("local");
        let (stream, _far) = duplex_stream(&PeerId::from_string("b"), Direction::Inbound);
        spawn_session(&mesh, stream).await.unwrap();

        for _ in 0..2 {
            let outcome = handle_announcement(
                &mesh,
                &PeerId::from_string("a"),
                announcement("b", &["10.0.0.2:3000"]),
            )
            .await;
            assert_eq!(outcome, AnnouncementOutcome::AlreadyConnected);
        }
        assert_eq!(transport.dial_count(), 0);
        assert_eq!(mesh.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_repeat_after_connect_does_not_redial() {
        let (mesh, transport, _rx) = test_mesh("local");
        let from = PeerId::from_string("a");
        let first = handle_announcement(&mesh, &from, announcement("c", &["h:1"])).await;
        let second = handle_announcement(&mesh, &from, announcement("c", &["h:1"])).await;

        assert_eq!(first, AnnouncementOutcome::Connected);
        assert_eq!(second, AnnouncementOutcome::AlreadyConnected);
        assert_eq!(transport.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_in_flight_dial_is_not_repeated() {
        let (mesh, transport, _rx) = test_mesh("local");
        let peer = PeerId::from_string("c");
        let _guard = mesh.begin_dial(&peer).unwrap();

        let outcome = handle_announcement(
            &mesh,
            &PeerId::from_string("a"),
            announcement("c", &["h:1"]),
        )
        .await;
        assert_eq!(outcome, AnnouncementOutcome::AlreadyDialing);
        assert_eq!(transport.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_emits_connect_failed() {
        let (mesh, transport, mut rx) = test_mesh("local");
        // No addresses: the address book has nothing to dial.
        let outcome = handle_announcement(
            &mesh,
            &PeerId::from_string("a"),
            announcement("c", &[]),
        )
        .await;

        assert_eq!(outcome, AnnouncementOutcome::Failed);
        assert_eq!(transport.dial_count(), 0);
        assert!(!mesh.registry.has(&PeerId::from_string("c")));
        match drain(&mut rx).as_slice() {
            [NetworkEvent::Error {
                cause: NetworkError::ConnectFailed { peer, .. },
            }] => assert_eq!(peer, "c"),
            other => panic!("expected ConnectFailed, got {other:?}"),
        }

        // A later announcement with an address retries.
        let outcome = handle_announcement(
            &mesh,
            &PeerId::from_string("b"),
            announcement("c", &["h:1"]),
        )
        .await;
        assert_eq!(outcome, AnnouncementOutcome::Connected);
    }

    #[tokio::test]
    async fn test_empty_peer_id_is_invalid() {
        let (mesh, transport, mut rx) = test_mesh("local");
        let outcome =
            handle_announcement(&mesh, &PeerId::from_string("a"), announcement("", &["h:1"])).await;
        assert_eq!(outcome, AnnouncementOutcome::Invalid);
        assert_eq!(transport.dial_count(), 0);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [NetworkEvent::Error {
                cause: NetworkError::MalformedPayload { .. }
            }]
        ));
    }

    #[tokio::test]
    async fn test_new_peer_is_announced_to_everyone_else() {
        let (mesh, _transport, _rx) = test_mesh("host");
        let mut fars = Vec::new();
        for name in ["b", "c", "d"] {
            let (stream, far) = duplex_stream(&PeerId::from_string(name), Direction::Inbound);
            spawn_session(&mesh, stream).await.unwrap();
            fars.push(far);
        }
        let newcomer = mesh.registry.get(&PeerId::from_string("d")).unwrap();

        announce_new_peer(&mesh, &newcomer).await;

        for far in fars.iter_mut().take(2) {
            let frame = tokio::time::timeout(
                Duration::from_secs(2),
                read_frame(far, DEFAULT_MAX_FRAME_SIZE),
            )
            .await
            .unwrap()
            .unwrap();
            match decode(&frame).unwrap() {
                Command::Announcement(a) => assert_eq!(a.peer.id, "d"),
                other => panic!("expected announcement, got {other:?}"),
            }
        }
        // The subject of the announcement does not hear about itself.
        let subject = &mut fars[2];
        assert!(
            tokio::time::timeout(
                Duration::from_millis(100),
                read_frame(subject, DEFAULT_MAX_FRAME_SIZE)
            )
            .await
            .is_err()
        );
    }
}
