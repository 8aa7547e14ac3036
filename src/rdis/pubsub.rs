//! Channel-to-subscriber registry for `SUBSCRIBE`/`UNSUBSCRIBE`/`PUBLISH`.
//!
//! Same `HashMap<K, HashSet<V>>` reverse-index shape as the blocked-waiter
//! registry in `blocked.rs`.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use super::blocked::ClientId;

#[derive(Default)]
pub struct PubSub {
    channels: HashMap<Bytes, HashSet<ClientId>>,
    client_channels: HashMap<ClientId, HashSet<Bytes>>,
}

impl PubSub {
    pub fn new() -> PubSub {
        PubSub::default()
    }

    /// Returns the subscriber count for `channel` after subscribing. This is
    /// the *channel's* subscriber count, not the client's own subscription
    /// count — callers building the `SUBSCRIBE` reply want `subscriptions_of`
    /// instead (spec §4.E: the reply's third element is the client's `subCount`).
    pub fn subscribe(&mut self, client: ClientId, channel: Bytes) -> usize {
        let subs = self.channels.entry(channel.clone()).or_default();
        subs.insert(client);
        let count = subs.len();
        self.client_channels.entry(client).or_default().insert(channel);
        count
    }

    /// Unsubscribes `client` from `channel`, decrementing saturating-safe:
    /// unsubscribing from a channel never subscribed to is a no-op, not an
    /// underflow. Returns the *channel's* remaining subscriber count, not the
    /// client's — see `subscriptions_of` for the client-facing `subCount`.
    pub fn unsubscribe(&mut self, client: ClientId, channel: &[u8]) -> usize {
        if let Some(subs) = self.channels.get_mut(channel) {
            subs.remove(&client);
            let count = subs.len();
            if subs.is_empty() {
                self.channels.remove(channel);
            }
            if let Some(chans) = self.client_channels.get_mut(&client) {
                chans.remove(channel);
                if chans.is_empty() {
                    self.client_channels.remove(&client);
                }
            }
            count
        } else {
            0
        }
    }

    /// Unsubscribes `client` from every channel it's on (connection close,
    /// or bare `UNSUBSCRIBE` with no arguments). Returns the channels it left.
    pub fn unsubscribe_all(&mut self, client: ClientId) -> Vec<Bytes> {
        let channels: Vec<Bytes> = self
            .client_channels
            .remove(&client)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for channel in &channels {
            if let Some(subs) = self.channels.get_mut(channel) {
                subs.remove(&client);
                if subs.is_empty() {
                    self.channels.remove(channel);
                }
            }
        }
        channels
    }

    pub fn subscriber_count(&self, channel: &[u8]) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    pub fn subscriptions_of(&self, client: ClientId) -> usize {
        self.client_channels.get(&client).map(|s| s.len()).unwrap_or(0)
    }

    /// The channels `client` is currently subscribed to, without mutating
    /// anything — used by a bare `UNSUBSCRIBE` (no channel arguments) to know
    /// what to unsubscribe from one at a time, reporting a decrementing
    /// `subCount` per channel rather than dropping straight to zero.
    pub fn channels_of(&self, client: ClientId) -> Vec<Bytes> {
        self.client_channels
            .get(&client)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every client currently subscribed to `channel`, for `PUBLISH` fan-out.
    pub fn subscribers(&self, channel: &[u8]) -> Vec<ClientId> {
        self.channels
            .get(channel)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}
