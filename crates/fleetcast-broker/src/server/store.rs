// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared presence table.
//!
//! Plain host -> last-seen storage. Entries never expire here; readers decide
//! liveness from the timestamps.

use std::collections::HashMap;

/// Host -> last-seen epoch milliseconds.
#[derive(Debug, Default)]
pub struct PresenceTable {
    entries: HashMap<String, u64>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a host.
    pub fn set(&mut self, host: String, last_seen: u64) {
        self.entries.insert(host, last_seen);
    }

    /// Remove a host. Returns whether it was present.
    pub fn delete(&mut self, host: &str) -> bool {
        self.entries.remove(host).is_some()
    }

    /// Remove every host.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Copy of the whole table.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
