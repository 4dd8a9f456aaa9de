// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel subscriptions and message routing.
//!
//! # How it works
//!
//! 1. Each connection registers an outbound queue under its connection id
//! 2. `subscribe` adds the connection to a channel's subscriber set
//! 3. `publish` pushes a `message` onto the queue of every subscriber
//!
//! Queues are bounded. A full queue drops the message for that subscriber
//! only; publishers never wait on slow readers. A message that would not fit
//! in one frame once wrapped for delivery is dropped for everyone.

use fleetcast::wire::{self, ServerMessage};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Connection identifier assigned by the server.
pub type ConnectionId = u64;

/// Routing counters.
#[derive(Debug, Default)]
pub struct RouterStats {
    /// Deliveries queued to a subscriber.
    pub messages_routed: AtomicU64,

    /// Deliveries lost to a full or closed subscriber queue.
    pub messages_dropped: AtomicU64,

    /// Publishes to a channel nobody subscribed to.
    pub messages_unrouted: AtomicU64,
}

impl RouterStats {
    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            messages_unrouted: self.messages_unrouted.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of routing counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStatsSnapshot {
    pub messages_routed: u64,
    pub messages_dropped: u64,
    pub messages_unrouted: u64,
}

/// Channel -> subscribed connections.
pub struct SubscriptionRouter {
    connections: HashMap<ConnectionId, mpsc::Sender<ServerMessage>>,
    channels: HashMap<String, HashSet<ConnectionId>>,
    max_message_size: usize,
    stats: RouterStats,
}

impl Default for SubscriptionRouter {
    fn default() -> Self {
        Self::with_max_message_size(wire::DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router that refuses deliveries larger than `max_message_size` bytes.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            connections: HashMap::new(),
            channels: HashMap::new(),
            max_message_size,
            stats: RouterStats::default(),
        }
    }

    /// Register a connection's outbound queue.
    pub fn register(&mut self, id: ConnectionId, tx: mpsc::Sender<ServerMessage>) {
        self.connections.insert(id, tx);
    }

    /// Drop a connection and every subscription it held.
    pub fn unregister(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
        self.channels.retain(|channel, subscribers| {
            if subscribers.remove(&id) {
                debug!("Connection {} left '{}'", id, channel);
            }
            !subscribers.is_empty()
        });
    }

    /// Subscribe a registered connection. Returns `false` if already subscribed
    /// or unknown.
    pub fn subscribe(&mut self, id: ConnectionId, channel: &str) -> bool {
        if !self.connections.contains_key(&id) {
            return false;
        }
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(id)
    }

    /// Returns `false` if the connection was not subscribed.
    pub fn unsubscribe(&mut self, id: ConnectionId, channel: &str) -> bool {
        let Some(subscribers) = self.channels.get_mut(channel) else {
            return false;
        };
        let removed = subscribers.remove(&id);
        if subscribers.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }

    /// Queue `payload` for every subscriber of `channel`.
    ///
    /// Returns the number of subscribers it was queued for.
    pub fn publish(&self, channel: &str, payload: Value) -> usize {
        let Some(subscribers) = self.channels.get(channel) else {
            self.stats.messages_unrouted.fetch_add(1, Ordering::Relaxed);
            return 0;
        };

        let message = ServerMessage::Message {
            channel: channel.to_string(),
            payload,
        };
        if let Err(e) = wire::encode(&message, self.max_message_size) {
            warn!("Dropping message on '{}': {}", channel, e);
            self.stats
                .messages_dropped
                .fetch_add(subscribers.len() as u64, Ordering::Relaxed);
            return 0;
        }

        let mut sent = 0;
        for id in subscribers {
            let Some(tx) = self.connections.get(id) else {
                continue;
            };
            match tx.try_send(message.clone()) {
                Ok(()) => {
                    sent += 1;
                    self.stats.messages_routed.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    warn!("Connection {} queue full, dropping message on '{}'", id, channel);
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Connection {} gone, dropping message on '{}'", id, channel);
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        sent
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, HashSet::len)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
