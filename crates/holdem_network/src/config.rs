//! Network configuration for a holdem node.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::framing::DEFAULT_MAX_FRAME_SIZE;

/// Default listen port, matching the game's historical `-l 3000`.
pub const DEFAULT_PORT: u16 = 3000;

/// Configuration for the networking layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on for incoming peer streams.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// Peer to join on startup (`host:port` or `<peer-id>@host:port`).
    /// `None` starts the node as the host of a new table.
    pub dial_target: Option<String>,

    /// Addresses to advertise instead of the bound listen address.
    pub advertise_addrs: Vec<String>,

    /// Bound on establishing an outbound stream, handshake included.
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Bound on writing one frame, waiting for the connection's writer
    /// included. A peer that stops reading fails its writes after this long.
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,

    /// Interval between keep-alive frames on every session.
    #[serde(with = "duration_serde")]
    pub keepalive_interval: Duration,

    /// Depth of the event queue towards the consumer.
    pub event_queue_capacity: usize,

    /// Largest accepted frame payload in bytes.
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            dial_target: None,
            advertise_addrs: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            event_queue_capacity: DEFAULT_EVENT_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl NetworkConfig {
    /// Host mode: no peer to dial.
    pub fn is_host(&self) -> bool {
        self.dial_target.is_none()
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetworkConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
