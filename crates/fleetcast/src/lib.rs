// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fleet coordination over a shared pub/sub broker.
//!
//! One control node issues a command, every live worker answers, and the
//! control node learns reliably when the fleet (or a timeout) is done.
//!
//! # Features
//!
//! - **Presence**: heartbeat-driven liveness with lazy TTL eviction
//! - **Broadcast conversations**: request / ack / data / end framing with
//!   connect and idle timeouts
//! - **Ordered processing**: per-host and final callbacks run serially
//! - **Command dispatch**: named plugins with accept/reject semantics
//!
//! # Quick Start
//!
//! ```no_run
//! use fleetcast::{Fleet, FleetConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let fleet = Fleet::connect(FleetConfig::from_file("fleet.toml")?).await?;
//! let outcome = fleet
//!     .request("uptime", json!({}), fleet.request_options())
//!     .await?
//!     .finish()
//!     .await?;
//! for (host, responses) in &outcome.responses {
//!     println!("{}: {:?}", host, responses);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration File
//!
//! ```toml
//! host = "control"
//!
//! [broker]
//! address = "10.0.0.5:7420"
//!
//! [presence]
//! interval_ms = 1000
//! timeout_ms = 3000
//! ```

pub mod broadcast;
pub mod command;
pub mod config;
pub mod fleet;
pub mod presence;
pub mod queue;
pub mod transport;
pub mod wire;

pub use broadcast::{
    BroadcastError, Conversation, ConversationError, ConversationEvent, FailureReason,
    IncomingRequest, Outcome, RequestOptions, RequestStream, Responder,
};
pub use command::{
    Command, CommandContext, CommandError, CommandOutcome, CommandRegistry, CommandServer,
    Reply, Verdict,
};
pub use config::{ConfigError, FleetConfig};
pub use fleet::{Fleet, FleetError};
pub use presence::{Heartbeat, Presence};
pub use queue::ProcessingQueue;
pub use transport::{
    Broker, Channel, ChannelError, Hub, MemoryBroker, PresenceStore, TcpTransport, Transport,
    TransportError,
};
