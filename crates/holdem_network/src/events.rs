//! Event bridge — bounded, non-blocking hand-off from network tasks to the
//! single consumer (the game UI or the headless app).
//!
//! Network tasks must never wait on a slow consumer. When the queue is full,
//! [`EventBridge::emit`] drops the event and, space permitting, leaves a
//! synthesized [`NetworkError::QueueOverflow`] in its place so the consumer
//! can tell the stream has gaps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

use crate::command::CommandTag;
use crate::error::NetworkError;
use crate::identity::{NodeIdentity, PeerId};

/// Default queue depth.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Something the network layer wants its consumer to know.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// The node is up. Emitted once, after listening (and dialing) succeeded.
    Ready { is_host: bool, identity: NodeIdentity },
    /// The set of active sessions changed; `peers` is the full new set.
    PeersChanged { peers: Vec<PeerId> },
    /// A non-fatal problem, or the fatal one that prevented `Ready`.
    Error { cause: NetworkError },
    /// A decoded, validated application command.
    CommandReceived {
        from: PeerId,
        tag: CommandTag,
        payload: Vec<u8>,
    },
}

impl NetworkEvent {
    pub fn error(cause: impl Into<NetworkError>) -> Self {
        Self::Error {
            cause: cause.into(),
        }
    }
}

/// What actually travels through the channel.
#[derive(Debug)]
enum Queued {
    Event(NetworkEvent),
    /// Stands in for the events dropped while the queue was full.
    Overflow { dropped: u64 },
}

/// Occupancy shared by both ends of the bridge.
#[derive(Debug)]
struct Slots {
    capacity: usize,
    /// Regular events sent and not yet received.
    queued: AtomicUsize,
    /// An overflow marker is sitting in the queue.
    marker: AtomicBool,
    dropped: AtomicU64,
}

impl Slots {
    /// Claim a regular slot. Fails once `capacity` events are queued.
    fn claim(&self) -> bool {
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Producer side of the bridge. Cheap to clone; every network task holds one.
#[derive(Debug, Clone)]
pub struct EventBridge {
    tx: mpsc::Sender<Queued>,
    slots: Arc<Slots>,
}

/// Consumer side of the bridge. There is exactly one per node.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<Queued>,
    slots: Arc<Slots>,
}

impl EventBridge {
    /// Create a bridge holding up to `capacity` regular events.
    ///
    /// One extra slot is reserved for the overflow marker.
    pub fn new(capacity: usize) -> (Self, EventReceiver) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity + 1);
        let slots = Arc::new(Slots {
            capacity,
            queued: AtomicUsize::new(0),
            marker: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        (
            Self {
                tx,
                slots: Arc::clone(&slots),
            },
            EventReceiver { rx, slots },
        )
    }

    /// Enqueue `event` without blocking.
    ///
    /// The regular/marker decision is a single atomic claim, so concurrent
    /// emitters never spend the marker slot on an event that had room.
    pub fn emit(&self, event: NetworkEvent) {
        if self.tx.is_closed() {
            trace!("Event consumer gone, discarding {event:?}");
            return;
        }

        if self.slots.claim() {
            match self.tx.try_send(Queued::Event(event)) {
                Ok(()) => return,
                Err(TrySendError::Closed(Queued::Event(event))) => {
                    self.slots.release();
                    trace!("Event consumer gone, discarding {event:?}");
                    return;
                }
                Err(TrySendError::Full(queued) | TrySendError::Closed(queued)) => {
                    // Unreachable while the counters hold; count it as dropped.
                    self.slots.release();
                    self.overflow(queued);
                    return;
                }
            }
        }
        self.overflow(Queued::Event(event));
    }

    fn overflow(&self, lost: Queued) {
        let dropped = self.slots.dropped.fetch_add(1, Ordering::AcqRel) + 1;
        if self
            .slots
            .marker
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("Event queue saturated, dropping {lost:?}");
            return;
        }

        debug!("Event queue full, dropping {lost:?}");
        if self.tx.try_send(Queued::Overflow { dropped }).is_err() {
            self.slots.marker.store(false, Ordering::Release);
        }
    }

    /// Total number of events discarded so far.
    pub fn dropped_count(&self) -> u64 {
        self.slots.dropped.load(Ordering::Acquire)
    }

    /// Whether the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl EventReceiver {
    /// Wait for the next event. `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<NetworkEvent> {
        let queued = self.rx.recv().await?;
        Some(self.unwrap_slot(queued))
    }

    /// Take the next event if one is queued.
    pub fn try_recv(&mut self) -> Option<NetworkEvent> {
        let queued = self.rx.try_recv().ok()?;
        Some(self.unwrap_slot(queued))
    }

    fn unwrap_slot(&self, queued: Queued) -> NetworkEvent {
        match queued {
            Queued::Event(event) => {
                self.slots.release();
                event
            }
            Queued::Overflow { dropped } => {
                self.slots.marker.store(false, Ordering::Release);
                NetworkEvent::Error {
                    cause: NetworkError::QueueOverflow { dropped },
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
