//! Connection registry
//!
//! Gateway-local map from tunnel key to the live control channel. At most
//! one channel per key; inserting over an existing entry closes the old
//! channel first (last-writer-wins). Removal is compare-and-delete on the
//! channel identity so a stale session can never evict its replacement.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use tunlify_catalog::TunnelKey;

use crate::channel::{CloseReason, ControlChannel};

#[derive(Default)]
pub struct ConnectionRegistry {
    channels: DashMap<TunnelKey, Arc<ControlChannel>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel under its tunnel key. Any previous holder of the
    /// key is closed with a policy-violation code and returned.
    pub fn insert(&self, channel: Arc<ControlChannel>) -> Option<Arc<ControlChannel>> {
        let displaced = self.channels.insert(channel.key.clone(), channel.clone());

        if let Some(ref old) = displaced {
            warn!(
                tunnel = %channel.key,
                old_channel = old.channel_id(),
                new_channel = channel.channel_id(),
                "displacing existing control channel (last writer wins)"
            );
            old.close(CloseReason::Displaced);
        } else {
            info!(
                tunnel = %channel.key,
                channel_id = channel.channel_id(),
                "control channel registered"
            );
        }

        displaced
    }

    pub fn lookup(&self, key: &TunnelKey) -> Option<Arc<ControlChannel>> {
        self.channels.get(key).map(|entry| entry.value().clone())
    }

    /// Remove the entry for `key` only if it still points at the channel
    /// with `channel_id`. Returns whether an entry was removed.
    pub fn remove_if_current(&self, key: &TunnelKey, channel_id: u64) -> bool {
        self.channels
            .remove_if(key, |_, current| current.channel_id() == channel_id)
            .is_some()
    }

    /// Snapshot of all live channels, for the janitor.
    pub fn channels(&self) -> Vec<Arc<ControlChannel>> {
        self.channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.channels.len()
    }
}
