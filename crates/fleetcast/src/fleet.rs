// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-node context.
//!
//! A [`Fleet`] owns everything one node needs: its host id, configuration,
//! channel hub, presence registry and (for workers) the heartbeat. Nothing is
//! global, so any number of contexts can share one broker in a single process.

use crate::broadcast::{self, BroadcastError, Conversation, RequestOptions, RequestStream};
use crate::config::{ConfigError, FleetConfig};
use crate::presence::{Heartbeat, Presence};
use crate::transport::{Broker, Hub, PresenceStore, TcpTransport, Transport, TransportError};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Fleet context errors.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),

    #[error("Heartbeat already running for {0}")]
    HeartbeatRunning(String),
}

/// One node's view of the fleet.
pub struct Fleet {
    host: String,
    config: FleetConfig,
    hub: Hub,
    presence: Arc<Presence>,
    heartbeat: Mutex<Option<Heartbeat>>,
}

impl Fleet {
    /// Build a context over an already-connected broker.
    pub fn init<B: Broker>(config: FleetConfig, broker: Arc<B>) -> Result<Self, FleetError> {
        config.validate()?;

        let host = config.host_id();
        let transport: Arc<dyn Transport> = broker.clone();
        let store: Arc<dyn PresenceStore> = broker;
        let presence = Arc::new(Presence::new(store, config.presence.timeout()));

        info!("Fleet context initialized for {}", host);

        Ok(Self {
            host,
            hub: Hub::new(transport),
            presence,
            heartbeat: Mutex::new(None),
            config,
        })
    }

    /// Connect to the broker at `config.broker.address` and build a context.
    pub async fn connect(config: FleetConfig) -> Result<Self, FleetError> {
        let transport =
            TcpTransport::connect(config.broker.address.as_str(), config.broker.max_message_size)
                .await?;
        info!("Connected to broker at {}", config.broker.address);
        Self::init(config, Arc::new(transport))
    }

    /// This node's host id.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn presence(&self) -> &Arc<Presence> {
        &self.presence
    }

    /// Announce this node every `presence.interval_ms` until [`destroy`](Self::destroy).
    pub fn start_heartbeat(&self) -> Result<(), FleetError> {
        let mut slot = self.heartbeat.lock();
        if slot.is_some() {
            return Err(FleetError::HeartbeatRunning(self.host.clone()));
        }
        *slot = Some(
            self.presence
                .spawn_heartbeat(self.host.clone(), self.config.presence.interval()),
        );
        Ok(())
    }

    /// Whether the heartbeat is running.
    pub fn is_heartbeating(&self) -> bool {
        self.heartbeat.lock().is_some()
    }

    /// Request options carrying the configured default timeouts.
    pub fn request_options(&self) -> RequestOptions {
        RequestOptions {
            expect: None,
            connect_timeout: self.config.broadcast.connect_timeout(),
            idle_timeout: self.config.broadcast.idle_timeout(),
        }
    }

    /// Start a conversation on `topic`.
    ///
    /// Without an explicit `options.expect`, the presence cache is refreshed
    /// and every host alive right now is expected.
    pub async fn request(
        &self,
        topic: &str,
        body: Value,
        mut options: RequestOptions,
    ) -> Result<Conversation, FleetError> {
        if options.expect.is_none() {
            self.presence.consume().await?;
            let hosts = self.presence.hosts();
            debug!("{} alive host(s) for '{}': {:?}", hosts.len(), topic, hosts);
            options.expect = Some(hosts);
        }
        Ok(broadcast::request(&self.hub, &self.host, topic, body, options).await?)
    }

    /// Receive requests on `topic`.
    pub async fn listen(&self, topic: &str) -> Result<RequestStream, FleetError> {
        Ok(RequestStream::open(&self.hub, topic, &self.host).await?)
    }

    /// Stop the heartbeat (marking this host absent) and release the context.
    pub async fn destroy(self) -> Result<(), FleetError> {
        let heartbeat = self.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await?;
        }
        info!("Fleet context for {} destroyed", self.host);
        Ok(())
    }
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("host", &self.host)
            .field("heartbeat", &self.is_heartbeating())
            .finish()
    }
}
