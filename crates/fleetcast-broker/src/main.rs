// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! fleetcast broker
//!
//! # Usage
//!
//! ```bash
//! # Start on the default port (7420)
//! fleetcast-broker
//!
//! # Custom port and config
//! fleetcast-broker --port 7500 --config broker.json
//! ```

use clap::Parser;
use fleetcast_broker::{BrokerConfig, BrokerServer};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// fleetcast broker - channel routing and presence for a fleet
#[derive(Parser, Debug)]
#[command(name = "fleetcast-broker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "7420")]
    port: u16,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum connected nodes
    #[arg(long, default_value = "1000")]
    max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = if let Some(config_path) = args.config {
        info!("Loading config from {:?}", config_path);
        BrokerConfig::from_file(&config_path)?
    } else {
        BrokerConfig {
            bind_address: args.bind.parse()?,
            port: args.port,
            max_connections: args.max_connections,
            ..Default::default()
        }
    };

    info!("+----------------------------------------------------+");
    info!(
        "|       fleetcast broker v{}                     |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:   {:40} |", config.socket_addr());
    info!("|  Max:    {:40} |", config.max_connections);
    info!("|  Queue:  {:40} |", config.outbound_queue_depth);
    info!("+----------------------------------------------------+");

    let server = BrokerServer::new(config)?;

    let server_handle = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping broker...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Broker stopped");
    Ok(())
}
