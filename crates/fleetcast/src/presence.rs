// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Presence registry.
//!
//! Writes (heartbeats) go straight to the shared [`PresenceStore`]. Reads are
//! split in two: [`Presence::consume`] copies the shared table into a private
//! cache, and [`Presence::hosts`] answers "who is alive" synchronously from
//! that cache, evicting entries whose lease ran out.

use crate::transport::{now_millis, PresenceStore, TransportError};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Liveness view of the fleet.
pub struct Presence {
    store: Arc<dyn PresenceStore>,
    timeout: Duration,
    cache: Mutex<HashMap<String, u64>>,
}

impl Presence {
    /// Create a registry over a shared store. `timeout` is the liveness lease.
    pub fn new(store: Arc<dyn PresenceStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Liveness lease.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record `host` as seen at `timestamp_ms`.
    pub async fn present(&self, host: &str, timestamp_ms: u64) -> Result<(), TransportError> {
        self.store.set(host, timestamp_ms).await
    }

    /// Remove `host` right away (graceful shutdown).
    pub async fn absent(&self, host: &str) -> Result<(), TransportError> {
        self.store.delete(host).await
    }

    /// Remove every host from the shared store.
    pub async fn clear(&self) -> Result<(), TransportError> {
        self.store.clear().await
    }

    /// Refresh the private cache from the shared store and return the snapshot.
    ///
    /// This is the only place the shared state is read.
    pub async fn consume(&self) -> Result<HashMap<String, u64>, TransportError> {
        let snapshot = self.store.read_all().await?;
        *self.cache.lock() = snapshot.clone();
        Ok(snapshot)
    }

    /// Hosts alive right now according to the cache.
    pub fn hosts(&self) -> BTreeSet<String> {
        self.hosts_at(now_millis())
    }

    /// Hosts with `now_ms - last_seen <= timeout`; expired ones leave the cache.
    pub fn hosts_at(&self, now_ms: u64) -> BTreeSet<String> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let mut cache = self.cache.lock();

        cache.retain(|host, last_seen| {
            let alive = now_ms.saturating_sub(*last_seen) <= timeout_ms;
            if !alive {
                debug!("Evicting {} (last seen {} ms ago)", host, now_ms - *last_seen);
            }
            alive
        });

        cache.keys().cloned().collect()
    }

    /// Publish `host` now and every `interval` until the handle is stopped.
    pub fn spawn_heartbeat(self: &Arc<Self>, host: impl Into<String>, interval: Duration) -> Heartbeat {
        let host = host.into();
        let presence = self.clone();
        let stop = Arc::new(Notify::new());
        let stop_rx = stop.clone();
        let task_host = host.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = presence.present(&task_host, now_millis()).await {
                            warn!("Heartbeat for {} failed: {}", task_host, e);
                        }
                    }
                    _ = stop_rx.notified() => {
                        debug!("Heartbeat for {} stopping", task_host);
                        break;
                    }
                }
            }
        });

        info!("Heartbeat started for {} every {:?}", host, interval);

        Heartbeat {
            host,
            presence: self.clone(),
            stop,
            task: Some(task),
        }
    }
}

/// Running heartbeat.
///
/// [`stop`](Self::stop) ends the loop and marks the host absent. Dropping
/// without stopping only aborts the loop; the lease then runs out on its own.
pub struct Heartbeat {
    host: String,
    presence: Arc<Presence>,
    stop: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Host this heartbeat announces.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Stop announcing and remove the host from the shared store.
    pub async fn stop(mut self) -> Result<(), TransportError> {
        if let Some(task) = self.task.take() {
            self.stop.notify_one();
            if let Err(e) = task.await {
                warn!("Heartbeat task for {} ended abnormally: {}", self.host, e);
            }
        }
        self.presence.absent(&self.host).await?;
        info!("{} marked absent", self.host);
        Ok(())
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
