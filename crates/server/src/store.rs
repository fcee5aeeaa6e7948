//! Ephemeral TTL-keyed state store.
//!
//! Holds everything short-lived the protocol core depends on: sessions,
//! authorization codes, refresh-token records, blacklisted token ids and
//! rate-limit counters. The store is the only mutable state shared between
//! requests, so it has to provide the atomic primitives the flow engine
//! relies on:
//!
//! - `take` (atomic read+delete) backs single-use authorization codes and
//!   refresh-token rotation: of N concurrent callers for the same key,
//!   exactly one observes the value.
//! - `increment_with_window` backs race-free rate limiting.
//!
//! Every operation returns a `Result` so a fallible backend fails closed:
//! callers must treat `StoreError` as a service fault, never as "key absent"
//! or "not rate limited".

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

/// Result of an atomic counter increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub count: u64,
    pub allowed: bool,
}

/// Contract for the ephemeral state store.
///
/// Expired entries read as absent from every operation.
pub trait StateStore: Send + Sync {
    fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Atomic read+delete. Exactly one of N concurrent callers for the same
    /// key observes the value; all others observe `None`.
    fn take(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Atomically increment the counter at `key`. The first increment opens
    /// a window of length `window`; once `count` exceeds `ceiling` within the
    /// window, `allowed` is false until the window expires.
    fn increment_with_window(
        &self,
        key: &str,
        window: Duration,
        ceiling: u64,
    ) -> Result<Window, StoreError>;
    /// Drop the counter at `key` (e.g. clearing failed-login attempts after a
    /// successful login).
    fn reset_window(&self, key: &str) -> Result<(), StoreError>;
    /// List live entries whose key starts with `prefix`. Used as the sweep
    /// behind "log out of all devices".
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;
}

#[derive(Clone)]
struct ValueEntry {
    value: String,
    expires_at: Instant,
}

impl ValueEntry {
    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

#[derive(Clone, Copy)]
struct CounterEntry {
    count: u64,
    window_expires_at: Instant,
}

/// In-process `StateStore` backed by `DashMap`.
///
/// `take` maps to `DashMap::remove`, which is atomic per key, and
/// `increment_with_window` runs under the entry API's shard-exclusive lock.
/// Counters live in their own map so a `put` can never clobber a window.
#[derive(Clone)]
pub struct MemoryStore {
    values: Arc<DashMap<String, ValueEntry>>,
    counters: Arc<DashMap<String, CounterEntry>>,
    last_cleanup: Arc<std::sync::Mutex<Instant>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            values: Arc::new(DashMap::new()),
            counters: Arc::new(DashMap::new()),
            last_cleanup: Arc::new(std::sync::Mutex::new(Instant::now())),
        }
    }

    /// Perform lazy cleanup if enough time has passed
    fn maybe_cleanup(&self) {
        const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

        // Check if cleanup is needed (non-blocking)
        if let Ok(mut last_cleanup) = self.last_cleanup.try_lock() {
            if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                *last_cleanup = Instant::now();
                drop(last_cleanup);

                let now = Instant::now();
                self.values.retain(|_, entry| entry.expires_at > now);
                self.counters.retain(|_, entry| entry.window_expires_at > now);
            }
        }
    }
}

impl StateStore for MemoryStore {
    fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        self.maybe_cleanup();
        self.values.insert(
            key.to_string(),
            ValueEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.maybe_cleanup();
        Ok(self.values.get(key).and_then(|entry| {
            if entry.is_expired() {
                None
            } else {
                Some(entry.value.clone())
            }
        }))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }

    fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        // remove() is the single-winner point: only one concurrent caller
        // gets the entry back.
        match self.values.remove(key) {
            Some((_, entry)) if !entry.is_expired() => Ok(Some(entry.value)),
            _ => Ok(None),
        }
    }

    fn increment_with_window(
        &self,
        key: &str,
        window: Duration,
        ceiling: u64,
    ) -> Result<Window, StoreError> {
        self.maybe_cleanup();
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert(CounterEntry {
                count: 0,
                window_expires_at: now + window,
            });
        if entry.window_expires_at <= now {
            entry.count = 0;
            entry.window_expires_at = now + window;
        }
        entry.count += 1;
        Ok(Window {
            count: entry.count,
            allowed: entry.count <= ceiling,
        })
    }

    fn reset_window(&self, key: &str) -> Result<(), StoreError> {
        self.counters.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let now = Instant::now();
        Ok(self
            .values
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.expires_at > now)
            .map(|entry| (entry.key().clone(), entry.value.clone()))
            .collect())
    }
}

/// A store whose every operation fails, for exercising the fail-closed
/// paths of callers.
#[cfg(test)]
pub(crate) struct FailingStore;

#[cfg(test)]
impl StateStore for FailingStore {
    fn put(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }

    fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }

    fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }

    fn take(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }

    fn increment_with_window(
        &self,
        _key: &str,
        _window: Duration,
        _ceiling: u64,
    ) -> Result<Window, StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }

    fn reset_window(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }

    fn scan_prefix(&self, _prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }
}
