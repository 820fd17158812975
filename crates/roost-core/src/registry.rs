// ── Transaction and listener registry ──
//
// One registry per backend instance (never process-wide): the pending
// transaction map and the per-device callback registry live behind a
// single lock, held only for map mutation and lookup -- never across a
// callback or a network call. Resolution bumps a watch-channel
// generation so every waiter wakes and re-checks its own key, matching
// broadcast-and-recheck semantics; a waiter whose key has vanished
// (transport disconnect clears the map) returns empty immediately
// rather than burning its timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::CoreError;

/// A per-device event callback: `(resource, payload)`.
pub type ListenerFn = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Listener key that receives every device's events.
pub const ALL_DEVICES: &str = "all";

struct RegistryInner {
    /// Pending transactions in registration order; `None` until a
    /// packet resolves the key.
    transactions: IndexMap<String, Option<Value>>,
    listeners: HashMap<String, Vec<ListenerFn>>,
}

/// Shared correlation state for one backend.
pub struct EventRegistry {
    inner: Mutex<RegistryInner>,
    generation: watch::Sender<u64>,
}

impl EventRegistry {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Mutex::new(RegistryInner {
                transactions: IndexMap::new(),
                listeners: HashMap::new(),
            }),
            generation,
        }
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    // ── Transactions ─────────────────────────────────────────────────

    /// Register a pending transaction under `key`.
    ///
    /// At most one transaction may exist per key; a second registration
    /// before resolution is a caller error.
    pub fn begin(&self, key: &str) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if inner.transactions.contains_key(key) {
            return Err(CoreError::TransactionPending { key: key.to_owned() });
        }
        trace!(key, "transaction started");
        inner.transactions.insert(key.to_owned(), None);
        Ok(())
    }

    /// Block until the transaction under `key` resolves or `timeout`
    /// elapses. The entry is removed on every outcome.
    pub async fn wait(&self, key: &str, timeout: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut generation = self.generation.subscribe();

        loop {
            {
                let mut inner = self.inner.lock().expect("registry lock poisoned");
                match inner.transactions.get(key) {
                    // Key vanished: the transport dropped and cleared
                    // the table out from under us.
                    None => return None,
                    Some(Some(_)) => {
                        trace!(key, "transaction resolved");
                        return inner.transactions.shift_remove(key).flatten();
                    }
                    Some(None) => {}
                }
            }

            match tokio::time::timeout_at(deadline, generation.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return None,
                Err(_) => {
                    trace!(key, "transaction timed out");
                    let mut inner = self.inner.lock().expect("registry lock poisoned");
                    inner.transactions.shift_remove(key);
                    return None;
                }
            }
        }
    }

    /// Correlate one inbound packet against the pending transactions.
    ///
    /// Match order: explicit transaction id, then exact resource key,
    /// then `resource:deviceId` against pattern keys in registration
    /// order (first pattern wins). Exact always beats pattern.
    pub fn settle(
        &self,
        transaction_id: Option<&str>,
        resource: Option<&str>,
        device_id: Option<&str>,
        packet: &Value,
    ) {
        let mut resolved = false;
        {
            let mut inner = self.inner.lock().expect("registry lock poisoned");

            if let Some(tid) = transaction_id {
                if let Some(slot) = inner.transactions.get_mut(tid) {
                    trace!(key = tid, "resolved by transaction id");
                    *slot = Some(packet.clone());
                    resolved = true;
                }
            }

            if let Some(resource) = resource {
                if let Some(slot) = inner.transactions.get_mut(resource) {
                    trace!(key = resource, "resolved by resource");
                    *slot = Some(packet.clone());
                    resolved = true;
                } else {
                    let bound = match device_id {
                        Some(device_id) => format!("{resource}:{device_id}"),
                        None => resource.to_owned(),
                    };
                    let matched = inner
                        .transactions
                        .keys()
                        .find(|key| pattern_matches(key, &bound))
                        .cloned();
                    if let Some(key) = matched {
                        trace!(%key, %bound, "resolved by pattern");
                        if let Some(slot) = inner.transactions.get_mut(&key) {
                            *slot = Some(packet.clone());
                            resolved = true;
                        }
                    }
                }
            }
        }

        if resolved {
            self.bump();
        }
    }

    /// Drop every pending transaction and wake all waiters.
    ///
    /// Used when the event transport disconnects: any packet that would
    /// have resolved these is gone with the connection.
    pub fn clear_transactions(&self) {
        let count = {
            let mut inner = self.inner.lock().expect("registry lock poisoned");
            let count = inner.transactions.len();
            inner.transactions.clear();
            count
        };
        if count > 0 {
            debug!(count, "cleared pending transactions");
        }
        self.bump();
    }

    #[cfg(test)]
    pub fn pending(&self, key: &str) -> bool {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .transactions
            .get(key)
            .is_some_and(Option::is_none)
    }

    // ── Listeners ────────────────────────────────────────────────────

    /// Register a callback for one device's events.
    pub fn add_listener(&self, device_id: &str, callback: ListenerFn) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.listeners.entry(device_id.to_owned()).or_default().push(callback);
    }

    /// Register a callback for every device's events.
    pub fn add_any_listener(&self, callback: ListenerFn) {
        self.add_listener(ALL_DEVICES, callback);
    }

    /// Callbacks interested in `device_id`: its own listeners plus the
    /// wildcard set.
    pub fn listeners_for(&self, device_id: Option<&str>) -> Vec<ListenerFn> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut callbacks = Vec::new();
        if let Some(device_id) = device_id {
            if let Some(list) = inner.listeners.get(device_id) {
                callbacks.extend(list.iter().cloned());
            }
        }
        if let Some(list) = inner.listeners.get(ALL_DEVICES) {
            callbacks.extend(list.iter().cloned());
        }
        callbacks
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Treat a pending key as an anchored regular expression. Keys that do
/// not compile simply never pattern-match (they can still match
/// exactly).
fn pattern_matches(pattern: &str, target: &str) -> bool {
    match Regex::new(&format!("^(?:{pattern})")) {
        Ok(re) => re.is_match(target),
        Err(_) => false,
    }
}

// ── Tests ────────────────────────────────────────────────────────────
