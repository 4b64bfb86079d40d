//! Channels: two-slot rendezvous points and the registry that owns them.
//!
//! - [`registry`] creates, resolves and garbage-collects channels.
//! - [`pairing`] fills and vacates the two peer slots and pushes connection
//!   events to both occupants.
//! - [`dispatch`] relays an opaque payload to the other occupant once it has
//!   a message subscription.
//!
//! Lock order is always registry map first, then a channel's slots. Sinks are
//! in-memory queues, so pushing to them while the slot lock is held keeps
//! per-join event ordering without holding a lock across network writes.

pub mod dispatch;
pub mod pairing;
pub mod registry;

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{mpsc, Notify};

use crate::error::ErrorKind;
use crate::ids::{ChannelId, PeerId};
use crate::protocol::{ConnectionEvent, RelayedMessage};

pub use pairing::{Membership, Subscription};
pub use registry::{ChannelRegistry, MAX_ID_ATTEMPTS};

/// Where connection events for one peer are pushed.
pub type EventSink = mpsc::UnboundedSender<ConnectionEvent>;

/// Where relayed payloads for one peer are pushed.
pub type MessageSink = mpsc::Sender<RelayedMessage>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    ChannelNotFound(ChannelId),
    ChannelInUse(ChannelId),
    UnknownPeer(PeerId),
    /// The sender is alone in the channel; there is nobody to relay to.
    PeerAbsent(ChannelId),
    IdSpaceExhausted { attempts: usize, live_channels: usize },
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::ChannelNotFound(_)
            | ChannelError::UnknownPeer(_)
            | ChannelError::PeerAbsent(_) => ErrorKind::NotFound,
            ChannelError::ChannelInUse(_) => ErrorKind::Conflict,
            ChannelError::IdSpaceExhausted { .. } => ErrorKind::ResourceExhausted,
        }
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::ChannelNotFound(_) => write!(f, "channel not found"),
            ChannelError::ChannelInUse(_) => write!(f, "channel already in use"),
            ChannelError::UnknownPeer(_) => write!(f, "unknown peer"),
            ChannelError::PeerAbsent(_) => write!(f, "unknown peer"),
            ChannelError::IdSpaceExhausted { attempts, .. } => {
                write!(f, "unable to draw a free channel id after {attempts} attempts")
            }
        }
    }
}

impl std::error::Error for ChannelError {}

/// Observable occupancy of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Empty,
    HalfOpen,
    Paired,
}

pub(crate) struct Peer {
    pub(crate) id: PeerId,
    pub(crate) public_key: Vec<u8>,
    pub(crate) events: EventSink,
    /// Absent until the peer opens a message subscription.
    pub(crate) messages: Option<MessageSink>,
}

#[derive(Default)]
pub(crate) struct Slots {
    pub(crate) a: Option<Peer>,
    pub(crate) b: Option<Peer>,
    /// Set once the registry dropped this channel; late joiners must not use it.
    pub(crate) removed: bool,
    pub(crate) joined_once: bool,
}

impl Slots {
    pub(crate) fn occupancy(&self) -> Occupancy {
        match (self.a.is_some(), self.b.is_some()) {
            (false, false) => Occupancy::Empty,
            (true, true) => Occupancy::Paired,
            _ => Occupancy::HalfOpen,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.occupancy() == Occupancy::Empty
    }

    pub(crate) fn find_mut(&mut self, peer_id: PeerId) -> Option<&mut Peer> {
        [self.a.as_mut(), self.b.as_mut()]
            .into_iter()
            .flatten()
            .find(|peer| peer.id == peer_id)
    }
}

/// A live channel: two optional peer slots behind the channel's own lock.
pub struct Channel {
    id: ChannelId,
    created_at: Instant,
    slots: Mutex<Slots>,
    /// Woken when a message sink is registered or cleared and when an
    /// occupant leaves, so pending sends re-resolve their recipient.
    changed: Notify,
}

impl Channel {
    pub(crate) fn new(id: ChannelId) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            slots: Mutex::new(Slots::default()),
            changed: Notify::new(),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn occupancy(&self) -> Occupancy {
        self.lock_slots().occupancy()
    }

    /// Ids of the current occupants, slot A first.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let slots = self.lock_slots();
        [slots.a.as_ref(), slots.b.as_ref()]
            .into_iter()
            .flatten()
            .map(|peer| peer.id)
            .collect()
    }

    pub(crate) fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("occupancy", &self.occupancy())
            .finish()
    }
}
