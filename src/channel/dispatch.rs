//! Relay dispatch: hand an opaque payload to the other occupant.
//!
//! The sender must be one of the channel's occupants. If the other occupant
//! has not subscribed yet the send parks on the channel's change signal and
//! re-resolves whenever a sink is registered or an occupant leaves. There is
//! no timeout here; callers bound the wait with their own deadline.

use tokio::sync::mpsc::error::SendError;

use super::pairing::clear_sink;
use super::{Channel, ChannelError, ChannelRegistry, MessageSink};
use crate::ids::{ChannelId, PeerId};
use crate::logging;
use crate::protocol::RelayedMessage;

impl Channel {
    /// Resolve the recipient for a message from `sender`.
    ///
    /// `Ok(None)` means the recipient exists but has no message sink yet.
    fn recipient_sink(&self, sender: PeerId) -> Result<Option<(PeerId, MessageSink)>, ChannelError> {
        let slots = self.lock_slots();
        if slots.removed {
            return Err(ChannelError::ChannelNotFound(self.id()));
        }
        let other = match (&slots.a, &slots.b) {
            (Some(a), other) if a.id == sender => other,
            (other, Some(b)) if b.id == sender => other,
            _ => return Err(ChannelError::UnknownPeer(sender)),
        };
        let other = other
            .as_ref()
            .ok_or(ChannelError::PeerAbsent(self.id()))?;
        Ok(other.messages.clone().map(|sink| (other.id, sink)))
    }
}

impl ChannelRegistry {
    /// Relay `message` from `sender` to the other occupant of `channel_id`.
    ///
    /// Resolves once the payload is queued on the recipient's message
    /// stream. Delivery is fire-and-forget from there.
    pub async fn send(
        &self,
        channel_id: ChannelId,
        sender: PeerId,
        message: RelayedMessage,
    ) -> Result<(), ChannelError> {
        let channel = self.get(channel_id)?;
        let mut message = message;

        loop {
            let changed = channel.changed.notified();
            tokio::pin!(changed);
            // Register interest before looking, so a subscription that lands
            // between the lookup and the wait still wakes us.
            changed.as_mut().enable();

            match channel.recipient_sink(sender)? {
                Some((recipient, sink)) => match sink.send(message).await {
                    Ok(()) => {
                        crate::tlog!(
                            "relay: {} -> {} on {}",
                            logging::peer_id(&sender.to_string()),
                            logging::peer_id(&recipient.to_string()),
                            logging::channel_id(&channel_id.to_string())
                        );
                        return Ok(());
                    }
                    Err(SendError(returned)) => {
                        // The subscriber went away without unregistering yet.
                        message = returned;
                        clear_sink(&channel, recipient, &sink);
                    }
                },
                None => changed.await,
            }
        }
    }
}
