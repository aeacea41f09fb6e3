//! Frame router — decides what happens to each non-empty frame a session
//! reads.
//!
//! Announcements are handled by the discovery protocol and never reach the
//! consumer. Every other known command is validated against its payload
//! shape and handed to the consumer as raw bytes. Frames that fail to decode
//! are reported and dropped; the session keeps reading.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::command::{Command, CommandTag, decode_payload, decode_tag};
use crate::discovery::{self, AnnouncementOutcome};
use crate::error::NetworkError;
use crate::events::NetworkEvent;
use crate::identity::PeerId;
use crate::mesh::Mesh;

/// What became of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Forwarded to the consumer.
    Delivered(CommandTag),
    /// Consumed by the discovery protocol.
    Announcement(AnnouncementOutcome),
    /// Dropped after reporting a decode error.
    Rejected,
}

pub(crate) async fn dispatch(mesh: &Arc<Mesh>, from: &PeerId, frame: &[u8]) -> Dispatch {
    let tag = match decode_tag(frame) {
        Ok(tag) => tag,
        Err(e) => return reject(mesh, from, e.into()),
    };

    let command = match decode_payload(frame, tag) {
        Ok(command) => command,
        Err(e) => return reject(mesh, from, e.into()),
    };

    match command {
        Command::Announcement(announcement) => {
            let outcome = discovery::handle_announcement(mesh, from, announcement).await;
            Dispatch::Announcement(outcome)
        }
        _ => {
            debug!("{tag} from {from}");
            mesh.events.emit(NetworkEvent::CommandReceived {
                from: from.clone(),
                tag,
                payload: frame.to_vec(),
            });
            Dispatch::Delivered(tag)
        }
    }
}

fn reject(mesh: &Mesh, from: &PeerId, cause: NetworkError) -> Dispatch {
    warn!("Dropping frame from {from}: {cause}");
    mesh.events.emit(NetworkEvent::error(cause));
    Dispatch::Rejected
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
