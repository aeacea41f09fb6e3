//! Peer identity — unique node identification, persistence and dial targets.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use rand::{RngCore, SeedableRng};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// A unique identifier for a swarm participant.
///
/// Opaque and independent of any network address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a new random peer ID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Derive a peer ID from a seed. The same seed always yields the same ID,
    /// which makes local multi-node sessions reproducible.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        Self(uuid::Builder::from_random_bytes(bytes).into_uuid().to_string())
    }

    /// Create a PeerId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The full identity of a node on the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique peer identifier.
    pub peer_id: PeerId,
    /// Human-readable name for the node (player nickname, hostname).
    pub name: String,
    /// Software version string.
    pub version: String,
    /// Transport addresses the node can be reached on (`host:port`).
    #[serde(default)]
    pub addrs: Vec<String>,
}

impl NodeIdentity {
    /// Create a new identity with a fresh PeerId.
    pub fn generate(name: impl Into<String>) -> Self {
        Self::with_peer_id(PeerId::generate(), name)
    }

    /// Create an identity whose PeerId is derived from `seed`.
    /// A seed of zero means "no seed" and falls back to a random ID.
    pub fn from_seed(name: impl Into<String>, seed: u64) -> Self {
        if seed == 0 {
            return Self::generate(name);
        }
        Self::with_peer_id(PeerId::from_seed(seed), name)
    }

    fn with_peer_id(peer_id: PeerId, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            addrs: Vec::new(),
        }
    }

    /// Return a copy of this identity advertising the given addresses.
    pub fn with_addrs(mut self, addrs: Vec<String>) -> Self {
        self.addrs = addrs;
        self
    }

    /// Dial targets other players can use to reach this node.
    pub fn dial_targets(&self) -> Vec<PeerAddr> {
        self.addrs
            .iter()
            .map(|addr| PeerAddr {
                peer_id: Some(self.peer_id.clone()),
                addr: addr.clone(),
            })
            .collect()
    }

    /// Save the identity to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize identity: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write identity file: {e}"))
    }

    /// Load an identity from a JSON file, or generate a new one if the file
    /// does not exist. Persisted addresses are discarded; they are assigned
    /// again when the node binds.
    pub fn load_or_generate(path: &Path, name: impl Into<String>) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NodeIdentity>(&data) {
                    Ok(identity) => return identity.with_addrs(Vec::new()),
                    Err(e) => {
                        tracing::warn!("Corrupt identity file, generating new: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read identity file, generating new: {e}");
                }
            }
        }

        let identity = Self::generate(name);
        if let Err(e) = identity.save_to_file(path) {
            tracing::warn!("Failed to persist new identity: {e}");
        }
        identity
    }
}

/// A dial target: a `host:port` transport address, optionally pinned to the
/// peer expected on the other side.
///
/// Textual form is `host:port` or `<peer-id>@host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub peer_id: Option<PeerId>,
    pub addr: String,
}

impl PeerAddr {
    /// Build a target pinned to a known peer.
    pub fn new(peer_id: PeerId, addr: impl Into<String>) -> Self {
        Self {
            peer_id: Some(peer_id),
            addr: addr.into(),
        }
    }

    /// Parse `host:port` or `<peer-id>@host:port`.
    pub fn parse(s: &str) -> Result<Self, NetworkError> {
        let s = s.trim();
        let (peer_id, addr) = match s.split_once('@') {
            Some((id, addr)) if !id.is_empty() => (Some(PeerId::from_string(id)), addr),
            Some(_) => return Err(NetworkError::InvalidAddress(s.to_string())),
            None => (None, s),
        };

        let valid = addr
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !valid {
            return Err(NetworkError::InvalidAddress(s.to_string()));
        }

        Ok(Self {
            peer_id,
            addr: addr.to_string(),
        })
    }
}

impl FromStr for PeerAddr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.peer_id {
            Some(id) => write!(f, "{id}@{}", self.addr),
            None => write!(f, "{}", self.addr),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
