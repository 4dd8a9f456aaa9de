// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Conversation wire frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request published on `broadcast-request-<topic>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Conversation id; the reply channel is derived from it.
    pub id: String,

    /// Initiating host.
    pub host: String,

    /// Request body.
    #[serde(default)]
    pub body: Value,
}

/// Reply published on `broadcast-reply-<topic>-<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// The host engaged with the conversation.
    Ack { host: String },

    /// One response body.
    Data {
        host: String,
        #[serde(default)]
        body: Value,
    },

    /// The host is done.
    End { host: String },
}

impl Frame {
    /// Host that sent the frame.
    pub fn host(&self) -> &str {
        match self {
            Self::Ack { host } | Self::Data { host, .. } | Self::End { host } => host,
        }
    }

    /// Frame type name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ack { .. } => "ack",
            Self::Data { .. } => "data",
            Self::End { .. } => "end",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_wire_shape() {
        let data = Frame::Data {
            host: "h1".into(),
            body: json!({"ok": true}),
        };
        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            json!({"type": "data", "host": "h1", "body": {"ok": true}})
        );

        let end: Frame = serde_json::from_value(json!({"type": "end", "host": "h1"})).unwrap();
        assert_eq!(end.host(), "h1");
        assert_eq!(end.kind(), "end");
    }

    #[test]
    fn test_unknown_frame_type_rejected() {
        let parsed = serde_json::from_value::<Frame>(json!({"type": "nack", "host": "h"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_request_without_body_defaults_to_null() {
        let request: RequestFrame =
            serde_json::from_value(json!({"id": "abc", "host": "ctl"})).unwrap();
        assert_eq!(request.body, Value::Null);
    }
}
