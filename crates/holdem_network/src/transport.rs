//! Transport seam — how peer streams are obtained.
//!
//! The rest of the crate only sees [`PeerStream`]s: a pair of boxed byte
//! stream halves with the remote identity already attached. [`TcpTransport`]
//! produces them from plain TCP, exchanging one `Hello` frame in each
//! direction before any command flows. Tests substitute in-memory streams.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::framing::{read_frame, write_frame};
use crate::identity::{NodeIdentity, PeerAddr, PeerId};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An inbound stream whose handshake has not completed yet.
///
/// Returned by [`Transport::accept`] so the accept loop can hand the
/// handshake to its own task and go straight back to accepting.
pub type Handshaking = BoxFuture<'static, Result<PeerStream, NetworkError>>;

/// Which side opened a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The remote dialed us.
    Inbound,
    /// We dialed the remote.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("inbound"),
            Self::Outbound => f.write_str("outbound"),
        }
    }
}

/// Who is on the other end of a stream, as learned from the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    pub peer_id: PeerId,
    /// Addresses the remote can be dialed on.
    pub addrs: Vec<String>,
    pub version: String,
}

/// A byte stream to an identified peer.
pub struct PeerStream {
    pub remote: RemotePeer,
    pub direction: Direction,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl PeerStream {
    pub fn new(
        remote: RemotePeer,
        direction: Direction,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> Self {
        Self {
            remote,
            direction,
            reader,
            writer,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.remote.peer_id
    }
}

impl fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerStream")
            .field("remote", &self.remote)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Address book
// ---------------------------------------------------------------------------

/// Known dialable addresses per peer, fed by handshakes and announcements.
#[derive(Debug, Default)]
pub struct AddressBook {
    entries: RwLock<HashMap<PeerId, Vec<String>>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `addrs` into the peer's entry. Returns how many were new.
    pub fn add_addrs<I>(&self, peer: &PeerId, addrs: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut entries = self.entries.write();
        let known = entries.entry(peer.clone()).or_default();
        let before = known.len();
        for addr in addrs {
            if !addr.is_empty() && !known.contains(&addr) {
                known.push(addr);
            }
        }
        known.len() - before
    }

    /// Addresses for `peer`, oldest first.
    pub fn addrs(&self, peer: &PeerId) -> Vec<String> {
        self.entries.read().get(peer).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Source of identified peer streams.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Our own identity, with the addresses we listen on.
    fn local_identity(&self) -> &NodeIdentity;

    /// Where dialable addresses of remote peers are kept.
    fn address_book(&self) -> &AddressBook;

    /// Wait for the next inbound stream.
    async fn accept(&self) -> Result<Handshaking, NetworkError>;

    /// Open a stream to `target`. A pinned peer id must match the remote.
    async fn dial(&self, target: &PeerAddr) -> Result<PeerStream, NetworkError>;

    /// Open a stream to `peer` using whatever the address book knows.
    async fn dial_peer(&self, peer: &PeerId) -> Result<PeerStream, NetworkError> {
        let addrs = self.address_book().addrs(peer);
        let mut last_error = None;
        for addr in addrs {
            match self.dial(&PeerAddr::new(peer.clone(), addr)).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Dial to {peer} failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| NetworkError::ConnectFailed {
            peer: peer.to_string(),
            reason: "no known addresses".to_string(),
        }))
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// First frame on every TCP stream, sent by both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Hello {
    peer_id: PeerId,
    #[serde(default)]
    addrs: Vec<String>,
    #[serde(default)]
    version: String,
}

/// Everything a handshake needs, detached from the transport so it can run
/// in another task.
#[derive(Clone)]
struct Handshaker {
    hello: Hello,
    book: Arc<AddressBook>,
    max_frame_size: usize,
}

impl Handshaker {
    async fn run(
        self,
        mut stream: TcpStream,
        remote_addr: SocketAddr,
        direction: Direction,
        expected: Option<PeerId>,
    ) -> Result<PeerStream, NetworkError> {
        let local = serde_json::to_vec(&self.hello)?;
        write_frame(&mut stream, &local, self.max_frame_size).await?;
        let reply = read_frame(&mut stream, self.max_frame_size).await?;
        let remote: Hello = serde_json::from_slice(&reply)
            .map_err(|e| NetworkError::Handshake(format!("unreadable hello: {e}")))?;

        if remote.peer_id.as_str().is_empty() {
            return Err(NetworkError::Handshake("empty peer id".to_string()));
        }
        if remote.peer_id == self.hello.peer_id {
            return Err(NetworkError::Handshake("connected to self".to_string()));
        }
        if let Some(expected) = expected {
            if expected != remote.peer_id {
                return Err(NetworkError::Handshake(format!(
                    "expected {expected}, got {}",
                    remote.peer_id
                )));
            }
        }

        let addrs = observed_addrs(&remote.addrs, remote_addr.ip());
        self.book.add_addrs(&remote.peer_id, addrs.iter().cloned());
        debug!(
            "Handshake with {} ({direction}, {remote_addr}) complete",
            remote.peer_id
        );

        let (reader, writer) = stream.into_split();
        Ok(PeerStream::new(
            RemotePeer {
                peer_id: remote.peer_id,
                addrs,
                version: remote.version,
            },
            direction,
            Box::new(reader),
            Box::new(writer),
        ))
    }
}

/// Rewrite advertised addresses whose host is a wildcard IP to the IP the
/// stream was actually observed from. Other addresses are kept as given.
fn observed_addrs(advertised: &[String], observed: IpAddr) -> Vec<String> {
    advertised
        .iter()
        .map(|addr| match addr.parse::<SocketAddr>() {
            Ok(sock) if sock.ip().is_unspecified() => {
                SocketAddr::new(observed, sock.port()).to_string()
            }
            _ => addr.clone(),
        })
        .collect()
}

/// Plain TCP transport with an identity handshake.
///
/// Streams are not encrypted.
pub struct TcpTransport {
    identity: NodeIdentity,
    listener: TcpListener,
    local_addr: SocketAddr,
    book: Arc<AddressBook>,
    connect_timeout: Duration,
    max_frame_size: usize,
}

impl TcpTransport {
    /// Bind the listener from `config` and take on the resulting addresses.
    pub async fn bind(identity: NodeIdentity, config: &NetworkConfig) -> Result<Self, NetworkError> {
        let listener =
            TcpListener::bind(config.listen_addr)
                .await
                .map_err(|e| NetworkError::Bind {
                    addr: config.listen_addr.to_string(),
                    reason: e.to_string(),
                })?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {local_addr}");

        let addrs = if config.advertise_addrs.is_empty() {
            vec![local_addr.to_string()]
        } else {
            config.advertise_addrs.clone()
        };

        Ok(Self {
            identity: identity.with_addrs(addrs),
            listener,
            local_addr,
            book: Arc::new(AddressBook::new()),
            connect_timeout: config.connect_timeout,
            max_frame_size: config.max_frame_size,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn handshaker(&self) -> Handshaker {
        Handshaker {
            hello: Hello {
                peer_id: self.identity.peer_id.clone(),
                addrs: self.identity.addrs.clone(),
                version: self.identity.version.clone(),
            },
            book: Arc::clone(&self.book),
            max_frame_size: self.max_frame_size,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_identity(&self) -> &NodeIdentity {
        &self.identity
    }

    fn address_book(&self) -> &AddressBook {
        &self.book
    }

    async fn accept(&self) -> Result<Handshaking, NetworkError> {
        let (stream, remote_addr) = self.listener.accept().await?;
        let _ = stream.set_nodelay(true);
        debug!("Accepted TCP stream from {remote_addr}");

        let handshaker = self.handshaker();
        let timeout = self.connect_timeout;
        Ok(Box::pin(async move {
            tokio::time::timeout(
                timeout,
                handshaker.run(stream, remote_addr, Direction::Inbound, None),
            )
            .await
            .map_err(|_| NetworkError::Timeout(timeout))?
        }))
    }

    async fn dial(&self, target: &PeerAddr) -> Result<PeerStream, NetworkError> {
        let handshaker = self.handshaker();
        let attempt = async {
            let stream = TcpStream::connect(target.addr.as_str()).await?;
            let _ = stream.set_nodelay(true);
            let remote_addr = stream.peer_addr()?;
            let stream = handshaker
                .run(stream, remote_addr, Direction::Outbound, target.peer_id.clone())
                .await?;
            Ok::<_, NetworkError>(stream)
        };

        let stream = match tokio::time::timeout(self.connect_timeout, attempt).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(NetworkError::ConnectFailed {
                    peer: target.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(NetworkError::ConnectFailed {
                    peer: target.to_string(),
                    reason: format!("timed out after {:?}", self.connect_timeout),
                });
            }
        };

        self.book
            .add_addrs(stream.peer_id(), std::iter::once(target.addr.clone()));
        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// In-memory transport for tests
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
