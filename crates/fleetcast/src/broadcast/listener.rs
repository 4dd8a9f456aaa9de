// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Listener side of a broadcast conversation.

use super::{reply_channel, request_channel, BroadcastError, Frame, RequestFrame};
use crate::transport::{Channel, Hub};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

/// Inbound requests for one topic.
///
/// Each call to [`next`](Self::next) acknowledges one request before handing
/// it out, so every yielded [`IncomingRequest`] has already sent its `ack`.
pub struct RequestStream {
    topic: String,
    host: String,
    hub: Hub,
    channel: Channel,
}

impl RequestStream {
    /// Listen for requests on `topic`, replying as `host`.
    pub async fn open(hub: &Hub, topic: &str, host: &str) -> Result<Self, BroadcastError> {
        let mut channel = hub.open(request_channel(topic));
        channel.listen().await?;
        debug!("{} listening for '{}' requests", host, topic);

        Ok(Self {
            topic: topic.to_string(),
            host: host.to_string(),
            hub: hub.clone(),
            channel,
        })
    }

    /// Topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next acknowledged request, or `None` once closed.
    pub async fn next(&mut self) -> Option<IncomingRequest> {
        loop {
            let raw = self.channel.recv().await?;
            let request: RequestFrame = match serde_json::from_value(raw) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Ignoring malformed request on '{}': {}", self.topic, e);
                    continue;
                }
            };

            let reply = self.hub.open(reply_channel(&self.topic, &request.id));
            let ack = Frame::Ack {
                host: self.host.clone(),
            };
            if let Err(e) = reply.send(&ack).await {
                warn!(
                    "Failed to ack conversation {} on '{}': {}",
                    request.id, self.topic, e
                );
                continue;
            }
            trace!("Acked conversation {} from {}", request.id, request.host);

            return Some(IncomingRequest {
                id: request.id.clone(),
                from: request.host,
                body: request.body,
                responder: Responder {
                    topic: self.topic.clone(),
                    id: request.id,
                    host: self.host.clone(),
                    channel: reply,
                    ended: false,
                },
            });
        }
    }

    /// Stop listening. Conversations already handed out are unaffected.
    pub fn close(&mut self) -> Result<(), BroadcastError> {
        self.channel.close()?;
        Ok(())
    }
}

/// One acknowledged request.
#[derive(Debug)]
pub struct IncomingRequest {
    /// Conversation id.
    pub id: String,

    /// Requesting host.
    pub from: String,

    /// Request body.
    pub body: Value,

    /// Reply handle for this conversation.
    pub responder: Responder,
}

/// Reply side of one conversation.
///
/// Conversations are independent: a listener may hold any number of
/// responders at once.
#[derive(Debug)]
pub struct Responder {
    topic: String,
    id: String,
    host: String,
    channel: Channel,
    ended: bool,
}

impl Responder {
    /// Conversation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether [`end`](Self::end) has been called.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Send one `data` frame.
    pub async fn send_data<T: Serialize + ?Sized>(&mut self, body: &T) -> Result<(), BroadcastError> {
        if self.ended {
            return Err(BroadcastError::AlreadyEnded {
                topic: self.topic.clone(),
                id: self.id.clone(),
            });
        }
        let frame = Frame::Data {
            host: self.host.clone(),
            body: serde_json::to_value(body).map_err(crate::transport::ChannelError::from)?,
        };
        self.channel.send(&frame).await?;
        Ok(())
    }

    /// Send the `end` frame and close the reply channel.
    ///
    /// The close is attempted even when sending fails; both failures are reported.
    pub async fn end(&mut self) -> Result<(), BroadcastError> {
        if self.ended {
            return Err(BroadcastError::AlreadyEnded {
                topic: self.topic.clone(),
                id: self.id.clone(),
            });
        }
        self.ended = true;

        let frame = Frame::End {
            host: self.host.clone(),
        };
        let send = self.channel.send(&frame).await.err();
        if let Some(e) = &send {
            warn!("Failed to send end for conversation {}: {}", self.id, e);
        }
        let close = self.channel.close().err();

        match (send, close) {
            (None, None) => {
                trace!("Ended conversation {}", self.id);
                Ok(())
            }
            (send, close) => Err(BroadcastError::EndFailed {
                id: self.id.clone(),
                send,
                close,
            }),
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        // Without an end frame the requester would wait for its idle timeout.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Conversation {} dropped without end", self.id);
            return;
        };
        warn!("Conversation {} dropped without end, ending it", self.id);
        let channel = self.channel.reopen();
        let frame = Frame::End {
            host: self.host.clone(),
        };
        runtime.spawn(async move {
            if let Err(e) = channel.send(&frame).await {
                debug!("Late end for '{}' failed: {}", channel.name(), e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::new_conversation_id;
    use crate::transport::MemoryBroker;
    use serde_json::json;
    use std::sync::Arc;

    async fn send_request(hub: &Hub, topic: &str, id: &str, body: Value) -> Channel {
        let mut replies = hub.open(reply_channel(topic, id));
        replies.listen().await.unwrap();
        hub.open(request_channel(topic))
            .send(&RequestFrame {
                id: id.to_string(),
                host: "control".into(),
                body,
            })
            .await
            .unwrap();
        replies
    }

    async fn next_frame(channel: &mut Channel) -> Frame {
        serde_json::from_value(channel.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_ack_data_end_sequence() {
        let broker = Arc::new(MemoryBroker::new());
        let worker = Hub::new(broker.clone());
        let control = Hub::new(broker);

        let mut stream = RequestStream::open(&worker, "uptime", "w1").await.unwrap();
        let id = new_conversation_id();
        let mut replies = send_request(&control, "uptime", &id, json!({"verbose": true})).await;

        let mut request = stream.next().await.unwrap();
        assert_eq!(request.id, id);
        assert_eq!(request.from, "control");
        assert_eq!(request.body, json!({"verbose": true}));

        request.responder.send_data(&json!("up 3 days")).await.unwrap();
        request.responder.end().await.unwrap();

        assert_eq!(next_frame(&mut replies).await, Frame::Ack { host: "w1".into() });
        assert_eq!(
            next_frame(&mut replies).await,
            Frame::Data {
                host: "w1".into(),
                body: json!("up 3 days")
            }
        );
        assert_eq!(next_frame(&mut replies).await, Frame::End { host: "w1".into() });
    }

    #[tokio::test]
    async fn test_send_after_end_fails_and_is_never_published() {
        let broker = Arc::new(MemoryBroker::new());
        let worker = Hub::new(broker.clone());
        let control = Hub::new(broker);

        let mut stream = RequestStream::open(&worker, "t", "w1").await.unwrap();
        let mut replies = send_request(&control, "t", "c1", Value::Null).await;
        let mut request = stream.next().await.unwrap();

        request.responder.end().await.unwrap();
        let err = request.responder.send_data(&json!("late")).await.unwrap_err();
        assert!(matches!(err, BroadcastError::AlreadyEnded { ref id, .. } if id == "c1"));
        assert!(err.to_string().contains("already ended"));

        assert!(matches!(next_frame(&mut replies).await, Frame::Ack { .. }));
        assert!(matches!(next_frame(&mut replies).await, Frame::End { .. }));
        assert!(tokio::time::timeout(
            std::time::Duration::from_millis(50),
            replies.recv()
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_concurrent_conversations_are_independent() {
        let broker = Arc::new(MemoryBroker::new());
        let worker = Hub::new(broker.clone());
        let control = Hub::new(broker);

        let mut stream = RequestStream::open(&worker, "t", "w1").await.unwrap();
        let mut replies_a = send_request(&control, "t", "a", json!(1)).await;
        let mut replies_b = send_request(&control, "t", "b", json!(2)).await;

        let mut a = stream.next().await.unwrap();
        let mut b = stream.next().await.unwrap();

        b.responder.send_data(&json!("for b")).await.unwrap();
        a.responder.end().await.unwrap();
        b.responder.end().await.unwrap();

        assert!(matches!(next_frame(&mut replies_a).await, Frame::Ack { .. }));
        assert!(matches!(next_frame(&mut replies_a).await, Frame::End { .. }));

        assert!(matches!(next_frame(&mut replies_b).await, Frame::Ack { .. }));
        assert_eq!(
            next_frame(&mut replies_b).await,
            Frame::Data {
                host: "w1".into(),
                body: json!("for b")
            }
        );
        assert!(matches!(next_frame(&mut replies_b).await, Frame::End { .. }));
    }

    #[tokio::test]
    async fn test_malformed_request_skipped() {
        let broker = Arc::new(MemoryBroker::new());
        let worker = Hub::new(broker.clone());
        let control = Hub::new(broker);

        let mut stream = RequestStream::open(&worker, "t", "w1").await.unwrap();
        control
            .open(request_channel("t"))
            .send(&json!({"nonsense": true}))
            .await
            .unwrap();
        let _replies = send_request(&control, "t", "ok", Value::Null).await;

        let request = stream.next().await.unwrap();
        assert_eq!(request.id, "ok");
    }

    #[tokio::test]
    async fn test_dropped_responder_still_ends() {
        let broker = Arc::new(MemoryBroker::new());
        let worker = Hub::new(broker.clone());
        let control = Hub::new(broker);

        let mut stream = RequestStream::open(&worker, "t", "w1").await.unwrap();
        let mut replies = send_request(&control, "t", "c", Value::Null).await;
        drop(stream.next().await.unwrap());

        assert!(matches!(next_frame(&mut replies).await, Frame::Ack { .. }));
        assert!(matches!(next_frame(&mut replies).await, Frame::End { .. }));
    }

    #[tokio::test]
    async fn test_close_stops_requests() {
        let broker = Arc::new(MemoryBroker::new());
        let worker = Hub::new(broker);

        let mut stream = RequestStream::open(&worker, "t", "w1").await.unwrap();
        stream.close().unwrap();
        assert!(stream.next().await.is_none());
        assert!(!worker.is_listening(&request_channel("t")));
    }
}
