// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local subscriber table shared by the transports.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Channel name -> local subscribers.
///
/// `on_first` / `on_last` hooks run under the table lock so that broker-side
/// subscribe/unsubscribe requests go out in the same order as the local
/// transitions that caused them.
#[derive(Default)]
pub(crate) struct Fanout {
    next_id: AtomicU64,
    channels: Mutex<HashMap<String, HashMap<u64, mpsc::UnboundedSender<Value>>>>,
}

impl Fanout {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. `on_first` runs if this is the channel's first one.
    pub(crate) fn add<E>(
        &self,
        channel: &str,
        on_first: impl FnOnce() -> Result<(), E>,
    ) -> Result<(u64, mpsc::UnboundedReceiver<Value>), E> {
        let mut channels = self.channels.lock();
        let first = channels.get(channel).map_or(true, |subs| subs.is_empty());
        if first {
            on_first()?;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        channels.entry(channel.to_string()).or_default().insert(id, tx);
        Ok((id, rx))
    }

    /// Remove a subscriber. `on_last` runs if the channel has none left.
    pub(crate) fn remove<E>(
        &self,
        channel: &str,
        id: u64,
        on_last: impl FnOnce() -> Result<(), E>,
    ) -> Result<(), E> {
        let mut channels = self.channels.lock();
        let Some(subs) = channels.get_mut(channel) else {
            return Ok(());
        };
        if subs.remove(&id).is_none() {
            return Ok(());
        }
        if subs.is_empty() {
            channels.remove(channel);
            on_last()?;
        }
        Ok(())
    }

    /// Deliver a payload to every subscriber of `channel`; returns how many got it.
    pub(crate) fn deliver(&self, channel: &str, payload: &Value) -> usize {
        let channels = self.channels.lock();
        channels.get(channel).map_or(0, |subs| {
            subs.values()
                .filter(|tx| tx.send(payload.clone()).is_ok())
                .count()
        })
    }

    /// Drop every sender, ending all subscription streams.
    pub(crate) fn close_all(&self) {
        self.channels.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.lock().get(channel).map_or(0, |subs| subs.len())
    }
}
