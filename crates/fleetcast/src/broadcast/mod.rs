// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broadcast conversations: one request, many replies.
//!
//! # Overview
//!
//! - A **requester** publishes a [`RequestFrame`] on the topic's request
//!   channel and listens on a reply channel keyed by a fresh conversation id.
//! - Every **listener** on the topic answers on that reply channel with
//!   `ack`, zero or more `data`, then `end` ([`Frame`]).
//! - The requester aggregates frames per host and terminates when every
//!   expected host has ended, or when the connect/idle timeout fires.
//!
//! # Channel naming
//!
//! For a topic named "deploy" and conversation id `7f3a...`:
//! - Request channel: `broadcast-request-deploy`
//! - Reply channel: `broadcast-reply-deploy-7f3a...`
//!
//! Any node can compute the reply channel from the request frame alone.

mod frame;
mod listener;
mod requester;

pub use frame::{Frame, RequestFrame};
pub use listener::{IncomingRequest, RequestStream, Responder};
pub use requester::{
    request, Conversation, ConversationError, ConversationEvent, FailureReason, Outcome,
    RequestOptions, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT,
};

use crate::transport::ChannelError;
use thiserror::Error;

/// Request channel for a topic.
pub fn request_channel(topic: &str) -> String {
    format!("broadcast-request-{}", topic)
}

/// Reply channel for one conversation on a topic.
pub fn reply_channel(topic: &str, conversation_id: &str) -> String {
    format!("broadcast-reply-{}-{}", topic, conversation_id)
}

/// Fresh conversation id (random v4 UUID, hex).
pub fn new_conversation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Broadcast errors.
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Conversation {id} on '{topic}' already ended")]
    AlreadyEnded { topic: String, id: String },

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Failed to end conversation {id} (send: {send:?}, close: {close:?})")]
    EndFailed {
        id: String,
        send: Option<ChannelError>,
        close: Option<ChannelError>,
    },
}
