//! The set of live channels.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{Channel, ChannelError};
use crate::ids::ChannelId;
use crate::logging;

/// Attempts at drawing an unused channel id before giving up.
pub const MAX_ID_ATTEMPTS: usize = 10;

/// Explicitly owned channel registry. Cloning shares the same set.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: Arc<Mutex<HashMap<ChannelId, Arc<Channel>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_channels(&self) -> MutexGuard<'_, HashMap<ChannelId, Arc<Channel>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an empty channel under a fresh random id.
    pub fn create_channel(&self) -> Result<ChannelId, ChannelError> {
        self.create_channel_with(ChannelId::random)
    }

    pub(crate) fn create_channel_with(
        &self,
        mut next_id: impl FnMut() -> ChannelId,
    ) -> Result<ChannelId, ChannelError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = next_id();
            let mut channels = self.lock_channels();
            if let Entry::Vacant(slot) = channels.entry(id) {
                slot.insert(Arc::new(Channel::new(id)));
                drop(channels);
                crate::tlog!(
                    "relay: channel {} created",
                    logging::channel_id(&id.to_string())
                );
                return Ok(id);
            }
        }

        let live_channels = self.len();
        crate::tlog_crit!(
            "relay: no free channel id after {} attempts ({} live channels)",
            MAX_ID_ATTEMPTS,
            live_channels
        );
        Err(ChannelError::IdSpaceExhausted {
            attempts: MAX_ID_ATTEMPTS,
            live_channels,
        })
    }

    pub fn get(&self, id: ChannelId) -> Result<Arc<Channel>, ChannelError> {
        self.lock_channels()
            .get(&id)
            .cloned()
            .ok_or(ChannelError::ChannelNotFound(id))
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: ChannelId) -> bool {
        self.lock_channels().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock_channels().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the channel iff both of its slots are empty.
    pub fn remove_if_empty(&self, id: ChannelId) -> bool {
        match self.get(id) {
            Ok(channel) => self.remove_channel_if_empty(&channel),
            Err(_) => false,
        }
    }

    /// Remove exactly this channel instance if it is empty. A different
    /// channel registered under the same id is left alone.
    pub(crate) fn remove_channel_if_empty(&self, channel: &Arc<Channel>) -> bool {
        let mut channels = self.lock_channels();
        match channels.get(&channel.id()) {
            Some(current) if Arc::ptr_eq(current, channel) => {}
            _ => return false,
        }

        let mut slots = channel.lock_slots();
        if !slots.is_empty() {
            return false;
        }
        slots.removed = true;
        drop(slots);
        channels.remove(&channel.id());
        drop(channels);

        channel.changed.notify_waiters();
        crate::tlog!(
            "relay: channel {} removed",
            logging::channel_id(&channel.id().to_string())
        );
        true
    }

    /// Drop channels that were created but never joined and are older than
    /// `max_idle`. Returns how many were removed.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let mut channels = self.lock_channels();
        let before = channels.len();
        channels.retain(|_, channel| {
            if channel.created_at().elapsed() < max_idle {
                return true;
            }
            let mut slots = channel.lock_slots();
            if slots.joined_once || !slots.is_empty() {
                return true;
            }
            slots.removed = true;
            false
        });
        before - channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Occupancy;
    use tokio::sync::mpsc;

    #[test]
    fn created_channels_are_resolvable_and_empty() {
        let registry = ChannelRegistry::new();
        let id = registry.create_channel().unwrap();
        let channel = registry.get(id).unwrap();
        assert_eq!(channel.id(), id);
        assert_eq!(channel.occupancy(), Occupancy::Empty);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn ids_are_unique_among_live_channels() {
        let registry = ChannelRegistry::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            assert!(seen.insert(registry.create_channel().unwrap()));
        }
        assert_eq!(registry.len(), 200);
    }

    #[test]
    fn collisions_are_retried() {
        let registry = ChannelRegistry::new();
        let taken = ChannelId::from_bytes([7; 16]);
        let fresh = ChannelId::from_bytes([8; 16]);
        registry.create_channel_with(|| taken).unwrap();

        let mut candidates = vec![fresh, taken, taken].into_iter().rev();
        let id = registry
            .create_channel_with(|| candidates.next().unwrap())
            .unwrap();
        assert_eq!(id, fresh);
    }

    #[test]
    fn exhausted_id_space_fails_after_ten_attempts() {
        let registry = ChannelRegistry::new();
        let taken = ChannelId::from_bytes([1; 16]);
        registry.create_channel_with(|| taken).unwrap();

        let mut calls = 0;
        let err = registry
            .create_channel_with(|| {
                calls += 1;
                taken
            })
            .unwrap_err();
        assert_eq!(calls, MAX_ID_ATTEMPTS);
        assert_eq!(
            err,
            ChannelError::IdSpaceExhausted {
                attempts: MAX_ID_ATTEMPTS,
                live_channels: 1
            }
        );
    }

    #[test]
    fn unknown_channel_is_not_found() {
        let registry = ChannelRegistry::new();
        let id = ChannelId::random();
        assert_eq!(
            registry.get(id).unwrap_err(),
            ChannelError::ChannelNotFound(id)
        );
        assert!(!registry.remove_if_empty(id));
    }

    #[test]
    fn remove_if_empty_keeps_occupied_channels() {
        let registry = ChannelRegistry::new();
        let id = registry.create_channel().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let membership = registry.join(id, vec![1], tx).unwrap();

        assert!(!registry.remove_if_empty(id));
        assert!(registry.contains(id));

        drop(membership);
        assert!(!registry.contains(id));
    }

    #[test]
    fn remove_if_empty_drops_unjoined_channel() {
        let registry = ChannelRegistry::new();
        let id = registry.create_channel().unwrap();
        assert!(registry.remove_if_empty(id));
        assert!(registry.get(id).is_err());
    }

    #[test]
    fn sweep_only_touches_stale_unjoined_channels() {
        let registry = ChannelRegistry::new();
        let idle = registry.create_channel().unwrap();
        let busy = registry.create_channel().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let _membership = registry.join(busy, vec![2], tx).unwrap();

        assert_eq!(registry.sweep_idle(Duration::from_secs(3600)), 0);
        assert_eq!(registry.sweep_idle(Duration::ZERO), 1);
        assert!(!registry.contains(idle));
        assert!(registry.contains(busy));
    }
}
