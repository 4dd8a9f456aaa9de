// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pub/sub transports and the presence store.
//!
//! The core only needs two capabilities from a broker:
//! - publish a JSON payload to a named channel, delivered in publish order to
//!   every current subscriber of that channel (best effort, no queuing when
//!   nobody listens)
//! - a shared host -> last-seen table
//!
//! [`MemoryBroker`] provides both in-process, [`TcpTransport`] talks to a
//! `fleetcast-broker` over TCP.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

mod channel;
mod fanout;
mod memory;
mod tcp;

pub use channel::{Channel, ChannelError, Hub};
pub use memory::MemoryBroker;
pub use tcp::TcpTransport;

pub(crate) use fanout::Fanout;

/// Transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Timed out waiting for broker")]
    Timeout,

    #[error("Broker error {code}: {message}")]
    Broker { code: u32, message: String },

    #[error("Message too large: {size} > {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Encode error: {0}")]
    Encode(String),
}

/// Named pub/sub channels.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publish `payload` to every current subscriber of `channel`.
    ///
    /// Completion means the message left this node, not that anyone received it.
    async fn publish(&self, channel: &str, payload: Value) -> Result<(), TransportError>;

    /// Subscribe to `channel`. Messages published after this returns are delivered.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError>;
}

/// Shared presence table: host -> last-seen epoch milliseconds.
#[async_trait]
pub trait PresenceStore: Send + Sync + 'static {
    /// Upsert a host's last-seen timestamp.
    async fn set(&self, host: &str, last_seen_ms: u64) -> Result<(), TransportError>;

    /// Remove one host.
    async fn delete(&self, host: &str) -> Result<(), TransportError>;

    /// Remove every host.
    async fn clear(&self) -> Result<(), TransportError>;

    /// Read the whole table.
    async fn read_all(&self) -> Result<HashMap<String, u64>, TransportError>;
}

/// A broker is anything that provides both pub/sub and the presence table.
pub trait Broker: Transport + PresenceStore {}

impl<T: Transport + PresenceStore> Broker for T {}

type CancelFn = Box<dyn FnOnce() -> Result<(), TransportError> + Send + Sync>;

/// An active subscription to one channel.
///
/// Cancelling (or dropping) unsubscribes; no message is yielded afterwards,
/// even if some were already buffered.
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<Value>,
    on_cancel: Option<CancelFn>,
}

impl Subscription {
    pub(crate) fn new(
        channel: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Value>,
        on_cancel: impl FnOnce() -> Result<(), TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            channel: channel.into(),
            rx,
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once cancelled or the transport went away.
    pub async fn recv(&mut self) -> Option<Value> {
        if self.on_cancel.is_none() {
            return None;
        }
        self.rx.recv().await
    }

    /// Unsubscribe. Idempotent.
    pub fn cancel(&mut self) -> Result<(), TransportError> {
        match self.on_cancel.take() {
            Some(cancel) => {
                self.rx.close();
                cancel()
            }
            None => Ok(()),
        }
    }

    /// Whether [`cancel`](Self::cancel) has run.
    pub fn is_cancelled(&self) -> bool {
        self.on_cancel.is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Err(e) = self.cancel() {
            tracing::debug!("Unsubscribe from '{}' on drop failed: {}", self.channel, e);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Current wall clock as epoch milliseconds.
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
