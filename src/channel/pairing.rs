//! Peer pairing: at most two occupants per channel.
//!
//! A channel moves `Empty → HalfOpen → Paired` as peers join and back down as
//! they leave. Joining hands out a [`Membership`]; dropping it vacates the
//! slot, tells the remaining occupant, and garbage-collects the channel once
//! both slots are empty. A message subscription is likewise a guard
//! ([`Subscription`]) that unregisters its sink when dropped.

use std::future::Future;
use std::sync::Arc;

use super::{Channel, ChannelError, ChannelRegistry, EventSink, MessageSink, Peer};
use crate::ids::{ChannelId, PeerId};
use crate::logging;
use crate::protocol::ConnectionEvent;

/// A peer's occupancy of one channel slot. Dropping it leaves the channel.
#[must_use = "dropping a Membership immediately leaves the channel"]
pub struct Membership {
    registry: ChannelRegistry,
    channel: Arc<Channel>,
    peer_id: PeerId,
}

impl Membership {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    /// Stay in the channel until `cancelled` resolves, then leave.
    pub async fn hold_until<F: Future<Output = ()>>(self, cancelled: F) {
        cancelled.await;
        drop(self);
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.registry.leave(&self.channel, self.peer_id);
    }
}

/// A registered message sink. Dropping it unregisters the sink.
#[must_use = "dropping a Subscription immediately unregisters the sink"]
pub struct Subscription {
    channel: Arc<Channel>,
    peer_id: PeerId,
    sink: MessageSink,
}

impl Subscription {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub async fn hold_until<F: Future<Output = ()>>(self, cancelled: F) {
        cancelled.await;
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        clear_sink(&self.channel, self.peer_id, &self.sink);
    }
}

/// Unregister `sink` from `peer_id` if it is still the registered one.
pub(crate) fn clear_sink(channel: &Channel, peer_id: PeerId, sink: &MessageSink) {
    let cleared = {
        let mut slots = channel.lock_slots();
        match slots.find_mut(peer_id) {
            Some(peer) if peer.messages.as_ref().is_some_and(|s| s.same_channel(sink)) => {
                peer.messages = None;
                true
            }
            _ => false,
        }
    };
    if cleared {
        channel.changed.notify_waiters();
    }
}

impl ChannelRegistry {
    /// Occupy the first free slot of `channel_id`.
    ///
    /// The new peer's sink receives its own id first, then (if the channel
    /// was half-open) the other occupant's presence; the other occupant is
    /// told about the newcomer on a best-effort basis.
    pub fn join(
        &self,
        channel_id: ChannelId,
        public_key: Vec<u8>,
        events: EventSink,
    ) -> Result<Membership, ChannelError> {
        let channel = self.get(channel_id)?;
        let peer_id = PeerId::random();
        let fingerprint = logging::key_fingerprint(&public_key);

        {
            let mut slots = channel.lock_slots();
            if slots.removed {
                return Err(ChannelError::ChannelNotFound(channel_id));
            }
            if slots.a.is_some() && slots.b.is_some() {
                return Err(ChannelError::ChannelInUse(channel_id));
            }

            let peer = Peer {
                id: peer_id,
                public_key: public_key.clone(),
                events: events.clone(),
                messages: None,
            };
            let other = if slots.a.is_none() {
                slots.a = Some(peer);
                slots.b.as_ref()
            } else {
                slots.b = Some(peer);
                slots.a.as_ref()
            };
            let other = other.map(|p| (p.id, p.public_key.clone(), p.events.clone()));
            slots.joined_once = true;

            // A closed own sink means the caller is already gone; the drop of
            // the returned membership cleans up.
            let _ = events.send(ConnectionEvent::own_id(peer_id));

            if let Some((other_id, other_key, other_events)) = other {
                let _ = events.send(ConnectionEvent::peer_present(other_id, other_key));
                if other_events
                    .send(ConnectionEvent::peer_present(peer_id, public_key))
                    .is_err()
                {
                    crate::tlog_warn!(
                        "pairing: could not notify {} that {} joined",
                        logging::peer_id(&other_id.to_string()),
                        logging::peer_id(&peer_id.to_string())
                    );
                }
            }
        }

        crate::tlog!(
            "pairing: {} joined {} ({})",
            logging::peer_id(&peer_id.to_string()),
            logging::channel_id(&channel_id.to_string()),
            fingerprint
        );

        Ok(Membership {
            registry: self.clone(),
            channel,
            peer_id,
        })
    }

    /// Join, stay until `cancelled` resolves, then leave.
    pub async fn connect<F: Future<Output = ()>>(
        &self,
        channel_id: ChannelId,
        public_key: Vec<u8>,
        events: EventSink,
        cancelled: F,
    ) -> Result<(), ChannelError> {
        let membership = self.join(channel_id, public_key, events)?;
        membership.hold_until(cancelled).await;
        Ok(())
    }

    /// Register `sink` as the message sink of `peer_id`, replacing any
    /// previous one.
    pub fn subscribe(
        &self,
        channel_id: ChannelId,
        peer_id: PeerId,
        sink: MessageSink,
    ) -> Result<Subscription, ChannelError> {
        let channel = self.get(channel_id)?;
        {
            let mut slots = channel.lock_slots();
            let peer = slots
                .find_mut(peer_id)
                .ok_or(ChannelError::UnknownPeer(peer_id))?;
            peer.messages = Some(sink.clone());
        }
        channel.changed.notify_waiters();

        crate::tlog!(
            "pairing: {} subscribed to messages on {}",
            logging::peer_id(&peer_id.to_string()),
            logging::channel_id(&channel_id.to_string())
        );

        Ok(Subscription {
            channel,
            peer_id,
            sink,
        })
    }

    /// Subscribe, stay subscribed until `cancelled` resolves, then unregister.
    pub async fn get_messages<F: Future<Output = ()>>(
        &self,
        channel_id: ChannelId,
        peer_id: PeerId,
        sink: MessageSink,
        cancelled: F,
    ) -> Result<(), ChannelError> {
        let subscription = self.subscribe(channel_id, peer_id, sink)?;
        subscription.hold_until(cancelled).await;
        Ok(())
    }

    fn leave(&self, channel: &Arc<Channel>, peer_id: PeerId) {
        let remaining = {
            let mut slots = channel.lock_slots();
            let remaining = if slots.a.as_ref().is_some_and(|p| p.id == peer_id) {
                slots.a = None;
                slots.b.as_ref()
            } else if slots.b.as_ref().is_some_and(|p| p.id == peer_id) {
                slots.b = None;
                slots.a.as_ref()
            } else {
                None
            };

            remaining.map(|other| {
                if other.events.send(ConnectionEvent::peer_left(peer_id)).is_err() {
                    crate::tlog_warn!(
                        "pairing: could not notify {} that {} left",
                        logging::peer_id(&other.id.to_string()),
                        logging::peer_id(&peer_id.to_string())
                    );
                }
                other.id
            })
        };
        channel.changed.notify_waiters();

        crate::tlog!(
            "pairing: {} left {}",
            logging::peer_id(&peer_id.to_string()),
            logging::channel_id(&channel.id().to_string())
        );

        if remaining.is_none() {
            self.remove_channel_if_empty(channel);
        }
    }
}
