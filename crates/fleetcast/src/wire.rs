// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker wire protocol.
//!
//! Simple length-prefixed JSON protocol spoken between nodes and
//! `fleetcast-broker`.
//!
//! Wire format:
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | JSON payload      |
//! +----------------+-------------------+
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound for a single frame body.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Error code sent when the broker refuses a connection.
pub const ERROR_TOO_MANY_CONNECTIONS: u32 = 1;

/// Error code sent when a client message cannot be handled.
pub const ERROR_BAD_REQUEST: u32 = 2;

/// Node -> broker messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving messages published on `channel`.
    Subscribe { channel: String },

    /// Stop receiving messages published on `channel`.
    Unsubscribe { channel: String },

    /// Publish a payload to every current subscriber of `channel`.
    Publish { channel: String, payload: Value },

    /// Upsert a host's last-seen timestamp (epoch milliseconds).
    PresenceSet { host: String, last_seen: u64 },

    /// Remove a host from the presence table.
    PresenceDelete { host: String },

    /// Remove every host from the presence table.
    PresenceClear,

    /// Read the whole presence table.
    PresenceRead { request_id: u64 },
}

/// Broker -> node messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A payload published on a channel this connection subscribed to.
    Message { channel: String, payload: Value },

    /// Reply to [`ClientMessage::PresenceRead`].
    PresenceSnapshot {
        request_id: u64,
        entries: HashMap<String, u64>,
    },

    /// Error notification.
    Error { code: u32, message: String },
}

/// Wire codec errors.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Empty message")]
    Empty,

    #[error("Message too large: {size} > {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read one frame and decode it.
///
/// Returns `Ok(None)` if the peer closed the connection before a new frame started.
pub async fn read_message<R, T>(reader: &mut R, max_message_size: usize) -> Result<Option<T>, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(WireError::Empty);
    }
    if len > max_message_size {
        return Err(WireError::TooLarge {
            size: len,
            max: max_message_size,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    Ok(Some(serde_json::from_slice(&body)?))
}

/// Largest body the `u32` length prefix can describe.
pub const MAX_FRAME_SIZE: usize = u32::MAX as usize;

/// Serialize a message into a frame body, enforcing the size limit.
pub fn encode<T: Serialize + ?Sized>(msg: &T, max_message_size: usize) -> Result<Vec<u8>, WireError> {
    let json = serde_json::to_vec(msg)?;
    let max = max_message_size.min(MAX_FRAME_SIZE);
    if json.len() > max {
        return Err(WireError::TooLarge {
            size: json.len(),
            max,
        });
    }
    Ok(json)
}

/// Write an already encoded body as one frame.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len()).map_err(|_| WireError::TooLarge {
        size: body.len(),
        max: MAX_FRAME_SIZE,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode a message and write it as one frame.
///
/// A message over the limit fails with [`WireError::TooLarge`] before any
/// byte is written, so the stream stays usable.
pub async fn write_message<W, T>(writer: &mut W, msg: &T, max_message_size: usize) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = encode(msg, max_message_size)?;
    write_frame(writer, &body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_tagging() {
        let msg = ClientMessage::Publish {
            channel: "broadcast-request-ping".into(),
            payload: json!({"id": "abc"}),
        };
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded["type"], "publish");
        assert_eq!(encoded["channel"], "broadcast-request-ping");

        let clear = serde_json::to_value(ClientMessage::PresenceClear).unwrap();
        assert_eq!(clear, json!({"type": "presence_clear"}));
    }

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let sent = ServerMessage::Message {
            channel: "c".into(),
            payload: json!([1, null, "x"]),
        };
        write_message(&mut a, &sent, DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .unwrap();
        drop(a);

        let received: Option<ServerMessage> = read_message(&mut b, DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .unwrap();
        assert_eq!(received, Some(sent));

        // Peer closed: clean EOF.
        let eof: Option<ServerMessage> = read_message(&mut b, DEFAULT_MAX_MESSAGE_SIZE)
            .await
            .unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&(64u32).to_be_bytes()).await.unwrap();

        let result: Result<Option<ClientMessage>, _> = read_message(&mut b, 16).await;
        assert!(matches!(result, Err(WireError::TooLarge { size: 64, max: 16 })));
    }

    #[tokio::test]
    async fn test_oversized_write_leaves_stream_usable() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let big = ServerMessage::Error {
            code: 2,
            message: "x".repeat(512),
        };
        let small = ServerMessage::Error {
            code: 2,
            message: "ok".into(),
        };

        let err = write_message(&mut a, &big, 128).await.unwrap_err();
        assert!(matches!(err, WireError::TooLarge { max: 128, .. }));
        write_message(&mut a, &small, 128).await.unwrap();

        let received: Option<ServerMessage> = read_message(&mut b, 128).await.unwrap();
        assert_eq!(received, Some(small));
    }

    #[test]
    fn test_encode_caps_limit_at_frame_size() {
        let body = encode(&json!("abc"), usize::MAX).unwrap();
        assert_eq!(body, b"\"abc\"".to_vec());
        assert!(matches!(
            encode(&json!("abcdef"), 4),
            Err(WireError::TooLarge { size: 8, max: 4 })
        ));
    }

    #[tokio::test]
    async fn test_empty_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&0u32.to_be_bytes()).await.unwrap();

        let result: Result<Option<ClientMessage>, _> =
            read_message(&mut b, DEFAULT_MAX_MESSAGE_SIZE).await;
        assert!(matches!(result, Err(WireError::Empty)));
    }
}
