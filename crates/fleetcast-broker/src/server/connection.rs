// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client connection handling for the broker.
//!
//! The socket is split: the handler reads on its own task, and a writer task
//! drains the connection's bounded outbound queue. Routed messages and direct
//! replies go through the same queue, so they leave in order.

use super::router::ConnectionId;
use fleetcast::wire::{self, ClientMessage, ServerMessage, WireError};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long [`ClientConnection::close`] waits for queued messages to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection error types.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Connection closed")]
    Closed,
}

/// A connected node.
pub struct ClientConnection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    reader: OwnedReadHalf,
    max_message_size: usize,
    outbound: mpsc::Sender<ServerMessage>,
    writer: JoinHandle<()>,
}

impl ClientConnection {
    /// Wrap an accepted stream and start its writer task.
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        peer_addr: SocketAddr,
        max_message_size: usize,
        queue_depth: usize,
    ) -> Self {
        let (reader, mut write_half) = stream.into_split();
        let (outbound, mut outbound_rx) = mpsc::channel::<ServerMessage>(queue_depth);

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let body = match wire::encode(&msg, max_message_size) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("Skipping message to {}: {}", peer_addr, e);
                        continue;
                    }
                };
                if let Err(e) = wire::write_frame(&mut write_half, &body).await {
                    warn!("Write to {} failed: {}", peer_addr, e);
                    break;
                }
            }
            if let Err(e) = write_half.shutdown().await {
                debug!("Shutdown of {} failed: {}", peer_addr, e);
            }
        });

        Self {
            id,
            peer_addr,
            reader,
            max_message_size,
            outbound,
            writer,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Sender feeding this connection's outbound queue.
    pub fn outbound(&self) -> mpsc::Sender<ServerMessage> {
        self.outbound.clone()
    }

    /// Read a message from the node.
    ///
    /// Returns `Ok(None)` if the connection is closed gracefully.
    pub async fn read_message(&mut self) -> Result<Option<ClientMessage>, ConnectionError> {
        Ok(wire::read_message(&mut self.reader, self.max_message_size).await?)
    }

    /// Queue a message for the node.
    pub async fn send_message(&self, msg: ServerMessage) -> Result<(), ConnectionError> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Flush queued messages and close the socket.
    ///
    /// Every other sender of the outbound queue must be dropped first.
    pub async fn close(self) {
        let Self {
            peer_addr,
            outbound,
            mut writer,
            ..
        } = self;
        drop(outbound);

        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            debug!("Writer for {} did not drain in time", peer_addr);
            writer.abort();
        }
    }
}

/// Tell a node it cannot be served, then hang up.
pub async fn refuse(mut stream: TcpStream, code: u32, message: &str, max_message_size: usize) {
    let msg = ServerMessage::Error {
        code,
        message: message.to_string(),
    };
    if let Err(e) = wire::write_message(&mut stream, &msg, max_message_size).await {
        debug!("Failed to send refusal: {}", e);
    }
    let _ = stream.shutdown().await;
}
