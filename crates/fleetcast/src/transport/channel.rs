// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Named channel handles.
//!
//! A [`Channel`] is opened on demand from a node's [`Hub`], can send at any
//! time, and can listen at most once per name per node.

use super::{Subscription, Transport, TransportError};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Already listening on channel '{0}'")]
    AlreadyListening(String),

    #[error("Channel '{0}' is closed")]
    Closed(String),

    #[error("Serialize error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Per-node entry point to the transport.
///
/// Tracks which channel names this node is listening on; clones share that set.
#[derive(Clone)]
pub struct Hub {
    transport: Arc<dyn Transport>,
    listening: Arc<Mutex<HashSet<String>>>,
}

impl Hub {
    /// Create a hub over a transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            listening: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Open a handle on `name`. Nothing is subscribed until [`Channel::listen`].
    pub fn open(&self, name: impl Into<String>) -> Channel {
        Channel {
            hub: self.clone(),
            name: name.into(),
            subscription: None,
            closed: false,
        }
    }

    /// Whether some channel on this node is listening on `name`.
    pub fn is_listening(&self, name: &str) -> bool {
        self.listening.lock().contains(name)
    }

    /// Underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

/// A named pub/sub handle.
pub struct Channel {
    hub: Hub,
    name: String,
    subscription: Option<Subscription>,
    closed: bool,
}

impl Channel {
    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start receiving messages published on this channel.
    ///
    /// Fails if this node already listens on the same name.
    pub async fn listen(&mut self) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed(self.name.clone()));
        }
        if !self.hub.listening.lock().insert(self.name.clone()) {
            return Err(ChannelError::AlreadyListening(self.name.clone()));
        }

        match self.hub.transport.subscribe(&self.name).await {
            Ok(subscription) => {
                trace!("Listening on '{}'", self.name);
                self.subscription = Some(subscription);
                Ok(())
            }
            Err(e) => {
                self.hub.listening.lock().remove(&self.name);
                Err(e.into())
            }
        }
    }

    /// New send-only handle on the same name.
    pub fn reopen(&self) -> Channel {
        self.hub.open(self.name.clone())
    }

    /// Whether this handle is listening.
    pub fn is_listening(&self) -> bool {
        self.subscription.is_some()
    }

    /// Next received message. `None` when not listening, closed, or the
    /// transport went away.
    pub async fn recv(&mut self) -> Option<Value> {
        match self.subscription.as_mut() {
            Some(subscription) => subscription.recv().await,
            None => None,
        }
    }

    /// Serialize `message` and publish it on this channel.
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed(self.name.clone()));
        }
        let payload = serde_json::to_value(message)?;
        self.hub.transport.publish(&self.name, payload).await?;
        Ok(())
    }

    /// Stop listening and refuse further sends. Idempotent.
    pub fn close(&mut self) -> Result<(), ChannelError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.subscription.take() {
            Some(mut subscription) => {
                self.hub.listening.lock().remove(&self.name);
                subscription.cancel()?;
                trace!("Closed '{}'", self.name);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.subscription.is_some() {
            self.hub.listening.lock().remove(&self.name);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("listening", &self.is_listening())
            .field("closed", &self.closed)
            .finish()
    }
}
