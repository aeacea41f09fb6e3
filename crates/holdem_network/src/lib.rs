//! Holdem Network — peer-to-peer overlay for a multiplayer card game.
//!
//! Every player runs a node. The first one hosts a table; everyone else joins
//! by dialing any node already seated. Nodes announce newcomers to each other
//! until every pair holds a direct session, so game commands can be
//! broadcast without a central server.
//!
//! # Architecture
//!
//! - **Framing**: 4-byte big-endian length prefix per frame; empty frames are
//!   keep-alives.
//! - **Commands**: flat JSON documents tagged by a numeric `command` field,
//!   decoded tag first, payload second.
//! - **Transport**: TCP with a one-frame identity handshake, behind the
//!   [`transport::Transport`] trait.
//! - **Discovery**: gossip; accepted peers are announced to everyone else,
//!   announced peers are dialed.
//! - **Events**: a bounded, never-blocking queue towards a single consumer.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use holdem_network::{Command, GameNode, NetworkConfig, NetworkEvent};
//! use holdem_network::identity::NodeIdentity;
//!
//! # async fn example() {
//! let identity = NodeIdentity::generate("alice");
//! let (mut node, mut events) = GameNode::with_events(identity, NetworkConfig::default());
//!
//! node.start().await.unwrap();
//! while let Some(event) = events.recv().await {
//!     if let NetworkEvent::PeersChanged { .. } = event {
//!         node.broadcast(&Command::chat(node.peer_id(), "hi all")).await.unwrap();
//!     }
//! }
//! node.stop().await;
//! # }
//! ```

pub mod command;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod framing;
pub mod identity;
mod mesh;
pub mod node;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use command::{Command, CommandTag};
pub use config::NetworkConfig;
pub use error::NetworkError;
pub use events::{EventBridge, EventReceiver, NetworkEvent};
pub use identity::{NodeIdentity, PeerAddr, PeerId};
pub use node::{GameNode, SessionInfo};
pub use transport::Direction;
