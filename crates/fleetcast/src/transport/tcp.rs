// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP client for `fleetcast-broker`.
//!
//! One connection per node. Outbound messages go through a queue drained by a
//! writer task so every caller observes a single, ordered stream; a reader task
//! fans inbound messages out to local subscribers.

use super::{Fanout, PresenceStore, Subscription, Transport, TransportError};
use crate::wire::{self, ClientMessage, ServerMessage, WireError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a presence read waits for the broker's snapshot.
const PRESENCE_READ_TIMEOUT: Duration = Duration::from_secs(5);

type Snapshot = HashMap<String, u64>;

/// Broker connection.
///
/// Dropping the transport closes the connection.
pub struct TcpTransport {
    inner: Arc<TcpInner>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct TcpInner {
    /// Encoded frame bodies; size limits are checked before queueing.
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    max_message_size: usize,
    fanout: Fanout,
    pending: DashMap<u64, oneshot::Sender<Snapshot>>,
    next_request: AtomicU64,
    closed: AtomicBool,
}

impl TcpInner {
    fn send(&self, msg: ClientMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let body = wire::encode(&msg, self.max_message_size).map_err(|e| match e {
            WireError::TooLarge { size, max } => TransportError::TooLarge { size, max },
            other => TransportError::Encode(other.to_string()),
        })?;
        self.outbound.send(body).map_err(|_| TransportError::Closed)
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.fanout.close_all();
            self.pending.clear();
        }
    }
}

impl TcpTransport {
    /// Connect to a broker.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        max_message_size: usize,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        stream.set_nodelay(true).ok();
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".into());
        let (mut read_half, mut write_half) = stream.into_split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let inner = Arc::new(TcpInner {
            outbound: outbound_tx,
            max_message_size,
            fanout: Fanout::new(),
            pending: DashMap::new(),
            next_request: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let writer_inner = Arc::downgrade(&inner);
        let writer = tokio::spawn(async move {
            while let Some(body) = outbound_rx.recv().await {
                if let Err(e) = wire::write_frame(&mut write_half, &body).await {
                    warn!("Broker write failed: {}", e);
                    break;
                }
            }
            if let Some(inner) = writer_inner.upgrade() {
                inner.mark_closed();
            }
        });

        let reader_inner = Arc::downgrade(&inner);
        let reader = tokio::spawn(async move {
            loop {
                let msg = match wire::read_message::<_, ServerMessage>(
                    &mut read_half,
                    max_message_size,
                )
                .await
                {
                    Ok(Some(msg)) => msg,
                    Ok(None) => {
                        info!("Broker closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("Broker read failed: {}", e);
                        break;
                    }
                };
                let Some(inner) = reader_inner.upgrade() else {
                    break;
                };
                Self::dispatch(&inner, msg);
            }
            if let Some(inner) = reader_inner.upgrade() {
                inner.mark_closed();
            }
        });

        info!("Connected to broker at {}", peer);

        Ok(Self {
            inner,
            reader,
            writer,
        })
    }

    fn dispatch(inner: &TcpInner, msg: ServerMessage) {
        match msg {
            ServerMessage::Message { channel, payload } => {
                inner.fanout.deliver(&channel, &payload);
            }
            ServerMessage::PresenceSnapshot {
                request_id,
                entries,
            } => {
                if let Some((_, tx)) = inner.pending.remove(&request_id) {
                    // Reader may have timed out and dropped the receiver.
                    drop(tx.send(entries));
                } else {
                    debug!("Unexpected presence snapshot {}", request_id);
                }
            }
            ServerMessage::Error { code, message } => {
                warn!("Broker error {}: {}", code, message);
            }
        }
    }

    /// Whether the connection is gone.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the connection. Local subscriptions end.
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
        self.inner.mark_closed();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn publish(&self, channel: &str, payload: Value) -> Result<(), TransportError> {
        self.inner.send(ClientMessage::Publish {
            channel: channel.to_string(),
            payload,
        })
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let (id, rx) = self.inner.fanout.add(channel, || {
            self.inner.send(ClientMessage::Subscribe {
                channel: channel.to_string(),
            })
        })?;

        let weak: Weak<TcpInner> = Arc::downgrade(&self.inner);
        let name = channel.to_string();
        Ok(Subscription::new(channel, rx, move || {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            inner.fanout.remove(&name, id, || {
                if inner.closed.load(Ordering::SeqCst) {
                    return Ok(());
                }
                inner.send(ClientMessage::Unsubscribe {
                    channel: name.clone(),
                })
            })
        }))
    }
}

#[async_trait]
impl PresenceStore for TcpTransport {
    async fn set(&self, host: &str, last_seen_ms: u64) -> Result<(), TransportError> {
        self.inner.send(ClientMessage::PresenceSet {
            host: host.to_string(),
            last_seen: last_seen_ms,
        })
    }

    async fn delete(&self, host: &str) -> Result<(), TransportError> {
        self.inner.send(ClientMessage::PresenceDelete {
            host: host.to_string(),
        })
    }

    async fn clear(&self) -> Result<(), TransportError> {
        self.inner.send(ClientMessage::PresenceClear)
    }

    async fn read_all(&self) -> Result<HashMap<String, u64>, TransportError> {
        let request_id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(request_id, tx);

        if let Err(e) = self.inner.send(ClientMessage::PresenceRead { request_id }) {
            self.inner.pending.remove(&request_id);
            return Err(e);
        }

        let result = tokio::time::timeout(PRESENCE_READ_TIMEOUT, rx).await;
        self.inner.pending.remove(&request_id);

        match result {
            Ok(Ok(entries)) => Ok(entries),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpTransport::connect(addr, wire::DEFAULT_MAX_MESSAGE_SIZE).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn test_subscribe_sends_once_per_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let transport = TcpTransport::connect(addr, wire::DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();

        let first = transport.subscribe("c").await.unwrap();
        let second = transport.subscribe("c").await.unwrap();
        drop(first);
        drop(second);

        let max = wire::DEFAULT_MAX_MESSAGE_SIZE;
        let m1: Option<ClientMessage> = wire::read_message(&mut server_side, max).await.unwrap();
        let m2: Option<ClientMessage> = wire::read_message(&mut server_side, max).await.unwrap();
        assert_eq!(
            m1,
            Some(ClientMessage::Subscribe {
                channel: "c".into()
            })
        );
        assert_eq!(
            m2,
            Some(ClientMessage::Unsubscribe {
                channel: "c".into()
            })
        );
    }

    #[tokio::test]
    async fn test_oversized_publish_fails_only_that_call() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let transport = TcpTransport::connect(addr, 256).await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();
        let _unrelated = transport.subscribe("other").await.unwrap();

        let err = transport
            .publish("c", Value::String("x".repeat(1024)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::TooLarge { max: 256, .. }));
        assert!(!transport.is_closed());

        transport.publish("c", Value::from("small")).await.unwrap();

        let m1: Option<ClientMessage> = wire::read_message(&mut server_side, 256).await.unwrap();
        let m2: Option<ClientMessage> = wire::read_message(&mut server_side, 256).await.unwrap();
        assert_eq!(
            m1,
            Some(ClientMessage::Subscribe {
                channel: "other".into()
            })
        );
        assert_eq!(
            m2,
            Some(ClientMessage::Publish {
                channel: "c".into(),
                payload: Value::from("small")
            })
        );
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_connection_loss_ends_subscriptions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let transport = TcpTransport::connect(addr, wire::DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        let mut sub = transport.subscribe("c").await.unwrap();

        drop(server_side);

        assert_eq!(sub.recv().await, None);
        assert!(transport.is_closed());
        assert_eq!(
            transport.read_all().await.unwrap_err(),
            TransportError::Closed
        );
    }
}
