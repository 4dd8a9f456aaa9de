// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker core implementation.

use crate::config::{BrokerConfig, ConfigError};
use fleetcast::wire::{
    ClientMessage, ServerMessage, WireError, ERROR_BAD_REQUEST, ERROR_TOO_MANY_CONNECTIONS,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};

pub mod connection;
pub mod router;
pub mod store;

pub use connection::{ClientConnection, ConnectionError};
pub use router::{ConnectionId, RouterStatsSnapshot, SubscriptionRouter};
pub use store::PresenceTable;

/// Broker - pub/sub routing plus the shared presence table.
#[derive(Clone)]
pub struct BrokerServer {
    config: Arc<BrokerConfig>,
    router: Arc<RwLock<SubscriptionRouter>>,
    presence: Arc<RwLock<PresenceTable>>,
    shutdown: Arc<ShutdownSignal>,
    running: Arc<AtomicBool>,
    active_connections: Arc<AtomicUsize>,
    next_connection_id: Arc<AtomicU64>,
}

impl BrokerServer {
    /// Create a new broker.
    pub fn new(config: BrokerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let router = SubscriptionRouter::with_max_message_size(config.max_message_size);

        Ok(Self {
            config: Arc::new(config),
            router: Arc::new(RwLock::new(router)),
            presence: Arc::new(RwLock::new(PresenceTable::new())),
            shutdown: Arc::new(ShutdownSignal::default()),
            running: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicUsize::new(0)),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.serve(listener).await
    }

    /// Serve an already-bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }
        self.shutdown.reset();

        info!("Broker listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => self.accept(stream, peer_addr),
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.wait() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn accept(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let max_message_size = self.config.max_message_size;

        let active = self.active_connections.fetch_add(1, Ordering::SeqCst);
        if active >= self.config.max_connections {
            self.active_connections.fetch_sub(1, Ordering::SeqCst);
            warn!("Max connections reached, rejecting {}", peer_addr);
            tokio::spawn(connection::refuse(
                stream,
                ERROR_TOO_MANY_CONNECTIONS,
                "Max connections reached",
                max_message_size,
            ));
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", peer_addr, e);
        }

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        info!("New connection {} from {}", id, peer_addr);

        let conn = ClientConnection::new(
            id,
            stream,
            peer_addr,
            max_message_size,
            self.config.outbound_queue_depth,
        );
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = server.handle_connection(conn).await {
                warn!("Connection error from {}: {}", peer_addr, e);
            }
            server.active_connections.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Handle a node connection.
    async fn handle_connection(&self, mut conn: ClientConnection) -> Result<(), ServerError> {
        let id = conn.id();
        let peer_addr = conn.peer_addr();
        self.router.write().await.register(id, conn.outbound());

        let result = loop {
            tokio::select! {
                result = conn.read_message() => {
                    match result {
                        Ok(Some(msg)) => {
                            if let Err(e) = self.process_message(&conn, msg).await {
                                break Err(e);
                            }
                        }
                        Ok(None) => {
                            info!("Connection closed: {}", peer_addr);
                            break Ok(());
                        }
                        Err(ConnectionError::Wire(WireError::Json(e))) => {
                            // The frame was consumed whole, the stream is still in sync.
                            warn!("Bad message from {}: {}", peer_addr, e);
                            let reply = ServerMessage::Error {
                                code: ERROR_BAD_REQUEST,
                                message: format!("Invalid message: {}", e),
                            };
                            if let Err(e) = conn.send_message(reply).await {
                                break Err(e.into());
                            }
                        }
                        Err(e) => {
                            warn!("Read error from {}: {}", peer_addr, e);
                            break Ok(());
                        }
                    }
                }
                _ = self.shutdown.wait() => {
                    debug!("Connection handler shutting down: {}", peer_addr);
                    break Ok(());
                }
            }
        };

        self.router.write().await.unregister(id);
        conn.close().await;
        result
    }

    /// Process a received message.
    async fn process_message(
        &self,
        conn: &ClientConnection,
        msg: ClientMessage,
    ) -> Result<(), ServerError> {
        let id = conn.id();

        match msg {
            ClientMessage::Subscribe { channel } => {
                if self.router.write().await.subscribe(id, &channel) {
                    debug!("Connection {} subscribed to '{}'", id, channel);
                }
            }

            ClientMessage::Unsubscribe { channel } => {
                if self.router.write().await.unsubscribe(id, &channel) {
                    debug!("Connection {} unsubscribed from '{}'", id, channel);
                }
            }

            ClientMessage::Publish { channel, payload } => {
                let sent = self.router.read().await.publish(&channel, payload);
                debug!("Connection {} published on '{}' to {}", id, channel, sent);
            }

            ClientMessage::PresenceSet { host, last_seen } => {
                self.presence.write().await.set(host, last_seen);
            }

            ClientMessage::PresenceDelete { host } => {
                if self.presence.write().await.delete(&host) {
                    info!("{} left the presence table", host);
                }
            }

            ClientMessage::PresenceClear => {
                self.presence.write().await.clear();
                info!("Presence table cleared by connection {}", id);
            }

            ClientMessage::PresenceRead { request_id } => {
                let entries = self.presence.read().await.snapshot();
                conn.send_message(ServerMessage::PresenceSnapshot {
                    request_id,
                    entries,
                })
                .await?;
            }
        }

        Ok(())
    }

    /// Signal the broker to shutdown.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Check if the broker is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Connected nodes.
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Routing counters.
    pub async fn router_stats(&self) -> RouterStatsSnapshot {
        self.router.read().await.stats()
    }

    /// Number of hosts in the presence table.
    pub async fn presence_count(&self) -> usize {
        self.presence.read().await.len()
    }
}

/// Shutdown notification that is never missed by late waiters.
#[derive(Default)]
struct ShutdownSignal {
    notify: Notify,
    triggered: AtomicBool,
}

impl ShutdownSignal {
    fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn reset(&self) {
        self.triggered.store(false, Ordering::SeqCst);
    }

    async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.triggered.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bind error on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Server already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}
