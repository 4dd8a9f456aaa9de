// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! fleetcast broker
//!
//! Standalone pub/sub broker and shared presence table for fleetcast nodes.
//! Nodes connect with [`fleetcast::TcpTransport`] and exchange
//! length-prefixed JSON messages:
//! - `subscribe` / `unsubscribe` / `publish` for channel routing
//! - `presence_set` / `presence_delete` / `presence_clear` / `presence_read`
//!   for the host table
//!
//! Delivery is at-most-once. A subscriber whose outbound queue is full loses
//! the message; the publisher is never blocked.

pub mod config;
pub mod server;

pub use config::{BrokerConfig, ConfigError};
pub use server::{BrokerServer, RouterStatsSnapshot, ServerError};
