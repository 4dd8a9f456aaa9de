// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process broker.
//!
//! Every node holding a clone of the same [`MemoryBroker`] sees the same
//! channels and presence table, which makes it possible to run a whole fleet
//! inside one test.

use super::{Fanout, PresenceStore, Subscription, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Weak};
use tracing::trace;

/// In-process pub/sub broker and presence table.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    fanout: Fanout,
    presence: Mutex<HashMap<String, u64>>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Value) -> Result<(), TransportError> {
        let delivered = self.inner.fanout.deliver(channel, &payload);
        trace!("Published to '{}' ({} subscribers)", channel, delivered);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        let (id, rx) = self
            .inner
            .fanout
            .add(channel, || Ok::<_, Infallible>(()))
            .unwrap_or_else(|never| match never {});

        let weak: Weak<MemoryInner> = Arc::downgrade(&self.inner);
        let name = channel.to_string();
        Ok(Subscription::new(channel, rx, move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .fanout
                    .remove(&name, id, || Ok::<_, Infallible>(()))
                    .unwrap_or_else(|never| match never {});
            }
            Ok(())
        }))
    }
}

#[async_trait]
impl PresenceStore for MemoryBroker {
    async fn set(&self, host: &str, last_seen_ms: u64) -> Result<(), TransportError> {
        self.inner
            .presence
            .lock()
            .insert(host.to_string(), last_seen_ms);
        Ok(())
    }

    async fn delete(&self, host: &str) -> Result<(), TransportError> {
        self.inner.presence.lock().remove(host);
        Ok(())
    }

    async fn clear(&self) -> Result<(), TransportError> {
        self.inner.presence.lock().clear();
        Ok(())
    }

    async fn read_all(&self) -> Result<HashMap<String, u64>, TransportError> {
        Ok(self.inner.presence.lock().clone())
    }
}
