//! Process-wide registry of live connections, keyed by chain.
//!
//! Every read-decide-write step runs under one lock so two orchestrators can
//! never both claim the same `(chain, endpoint)` dial.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::catalogue::AUTO_MODE;
use crate::connection::ConnectionHandle;

/// How long an unresolved dial may block others from dialing the same key.
pub const IN_FLIGHT_TTL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct PoolEntry {
    pub chain_id: String,
    pub endpoint_url: String,
    pub connection: Option<ConnectionHandle>,
    pub is_requested: bool,
    pub registered_at: Instant,
}

impl PoolEntry {
    pub fn is_live(&self) -> bool {
        self.connection
            .as_ref()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    fn is_stale_request(&self, ttl: Duration, now: Instant) -> bool {
        self.is_requested
            && self.connection.is_none()
            && now.duration_since(self.registered_at) > ttl
    }
}

impl std::fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry")
            .field("chain_id", &self.chain_id)
            .field("endpoint_url", &self.endpoint_url)
            .field("connected", &self.is_live())
            .field("is_requested", &self.is_requested)
            .finish()
    }
}

pub struct ConnectionPool {
    entries: Mutex<HashMap<String, Vec<PoolEntry>>>,
    in_flight_ttl: Duration,
    generation: watch::Sender<u64>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(IN_FLIGHT_TTL)
    }
}

impl ConnectionPool {
    pub fn new(in_flight_ttl: Duration) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            entries: Mutex::new(HashMap::new()),
            in_flight_ttl,
            generation,
        }
    }

    pub fn in_flight_ttl(&self) -> Duration {
        self.in_flight_ttl
    }

    pub fn lookup(&self, chain_id: &str, endpoint_url: &str) -> Option<PoolEntry> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(chain_id)?
            .iter()
            .find(|e| e.endpoint_url == endpoint_url)
            .cloned()
    }

    /// Any live connection for the chain, whichever endpoint it is on.
    pub fn reuse_if_connected(&self, chain_id: &str) -> Option<ConnectionHandle> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(chain_id)?
            .iter()
            .filter(|e| e.endpoint_url != AUTO_MODE)
            .find(|e| e.is_live())
            .and_then(|e| e.connection.clone())
    }

    /// Claims the dial for `(chain_id, endpoint_url)`. Returns false when a
    /// resolved entry or a fresh placeholder already holds the key; the
    /// caller must then not dial.
    pub fn register_in_flight(&self, chain_id: &str, endpoint_url: &str) -> bool {
        let now = Instant::now();
        {
            let Ok(mut entries) = self.entries.lock() else {
                return false;
            };
            let list = entries.entry(chain_id.to_string()).or_default();
            if let Some(existing) = list.iter().find(|e| e.endpoint_url == endpoint_url) {
                if existing.connection.is_some() {
                    return false;
                }
                if !existing.is_stale_request(self.in_flight_ttl, now) {
                    return false;
                }
            }
            list.retain(|e| e.endpoint_url != endpoint_url);
            list.push(PoolEntry {
                chain_id: chain_id.to_string(),
                endpoint_url: endpoint_url.to_string(),
                connection: None,
                is_requested: true,
                registered_at: now,
            });
        }
        self.bump();
        true
    }

    /// Stores a resolved connection unless the key already holds a live one,
    /// which is returned instead so the caller can close its duplicate. With
    /// `evict_other_auto_entries` the auto placeholder for the chain goes too.
    pub fn register_connected(
        &self,
        chain_id: &str,
        endpoint_url: &str,
        connection: ConnectionHandle,
        evict_other_auto_entries: bool,
    ) -> Option<ConnectionHandle> {
        let existing = {
            let Ok(mut entries) = self.entries.lock() else {
                return None;
            };
            let list = entries.entry(chain_id.to_string()).or_default();
            if evict_other_auto_entries {
                list.retain(|e| e.endpoint_url != AUTO_MODE);
            }
            let existing = list
                .iter()
                .find(|e| e.endpoint_url == endpoint_url && e.is_live())
                .and_then(|e| e.connection.clone());
            if existing.is_none() {
                list.retain(|e| e.endpoint_url != endpoint_url);
                list.push(PoolEntry {
                    chain_id: chain_id.to_string(),
                    endpoint_url: endpoint_url.to_string(),
                    connection: Some(connection),
                    is_requested: false,
                    registered_at: Instant::now(),
                });
            }
            existing
        };
        self.bump();
        existing
    }

    /// Drops the entry for the key, e.g. after a failed dial.
    pub fn remove(&self, chain_id: &str, endpoint_url: &str) -> Option<PoolEntry> {
        let removed = {
            let mut entries = self.entries.lock().ok()?;
            let list = entries.get_mut(chain_id)?;
            let idx = list.iter().position(|e| e.endpoint_url == endpoint_url)?;
            let removed = list.remove(idx);
            if list.is_empty() {
                entries.remove(chain_id);
            }
            removed
        };
        self.bump();
        Some(removed)
    }

    /// Drops the key only while it is still an unresolved placeholder.
    pub fn abandon_request(&self, chain_id: &str, endpoint_url: &str) -> bool {
        let abandoned = {
            let Ok(mut entries) = self.entries.lock() else {
                return false;
            };
            let Some(list) = entries.get_mut(chain_id) else {
                return false;
            };
            let before = list.len();
            list.retain(|e| !(e.endpoint_url == endpoint_url && e.connection.is_none()));
            let abandoned = list.len() != before;
            if list.is_empty() {
                entries.remove(chain_id);
            }
            abandoned
        };
        if abandoned {
            self.bump();
        }
        abandoned
    }

    /// Removes placeholders older than the in-flight TTL.
    pub fn prune_stale_requests(&self) -> usize {
        let now = Instant::now();
        let pruned = {
            let Ok(mut entries) = self.entries.lock() else {
                return 0;
            };
            let mut pruned = 0;
            for list in entries.values_mut() {
                let before = list.len();
                list.retain(|e| !e.is_stale_request(self.in_flight_ttl, now));
                pruned += before - list.len();
            }
            entries.retain(|_, list| !list.is_empty());
            pruned
        };
        if pruned > 0 {
            self.bump();
        }
        pruned
    }

    pub fn snapshot(&self, chain_id: &str) -> Vec<PoolEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.get(chain_id).cloned().unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Empties the pool and disconnects every resolved connection.
    pub async fn close_all(&self) {
        let drained: Vec<PoolEntry> = match self.entries.lock() {
            Ok(mut entries) => entries.drain().flat_map(|(_, list)| list).collect(),
            Err(_) => Vec::new(),
        };
        self.bump();
        for entry in drained {
            if let Some(conn) = entry.connection {
                conn.disconnect().await;
            }
        }
    }

    /// Receiver that ticks on every mutation.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }
}
