//! In-memory token store
//!
//! Concurrency-safe key → (token, expiry) map with lazy expiry eviction and
//! single-flight refresh coordination. Two locks with different lifetimes:
//! the store lock guards the map and is held only for map access, so
//! unrelated reads never wait on each other for long; the refresh lock is
//! held across the whole refresh callback (typically a network round trip)
//! and serializes every refresh in this store instance, regardless of key.
//! The refresh lock is deliberately store-wide rather than per-key: callers
//! relying on the single-flight guarantee get it for free, at the cost that
//! an unrelated key's refresh queues behind an in-flight one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bearer;
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};

/// One cached credential: `(token, expiry as unix seconds)`.
///
/// A tuple struct so it serializes as the 2-element array used by the
/// persisted file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Entry(pub(crate) String, pub(crate) f64);

impl Entry {
    fn is_expired(&self, now: f64) -> bool {
        now >= self.1
    }
}

/// Credential produced by a refresh callback.
///
/// The key names the logical slot the credential fulfills. It normally
/// matches the requested key, but a callback completing a multi-step flow
/// may resolve to a different one; the store warns and uses the resolved key.
#[derive(Debug)]
pub enum Refreshed {
    /// JWT-shaped bearer token; expiry comes from its embedded `exp` claim.
    Bearer { key: String, token: String },
    /// Opaque access token with an explicit lifetime in seconds.
    Access {
        key: String,
        token: String,
        expires_in: u64,
    },
}

/// What a refresh callback returns. Callback failures propagate out of
/// `get_or_refresh` as [`Error::Refresh`] with the source preserved.
pub type RefreshResult = std::result::Result<Refreshed, Box<dyn std::error::Error + Send + Sync>>;

/// Concurrency-safe, expiry-aware token cache.
///
/// Lookups never return a token past its expiry; expired entries are evicted
/// by the read that discovers them. No background sweeping runs.
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, Entry>>,
    refresh_gate: Mutex<()>,
    clock: Arc<dyn Clock>,
}

/// A panic while holding the lock cannot leave the map half-updated (every
/// critical section is a single map operation), so poisoning is recovered
/// rather than propagated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryTokenStore {
    /// Empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty store with an explicit time source.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            refresh_gate: Mutex::new(()),
            clock,
        }
    }

    /// Store a self-describing bearer token under `key`, deriving its expiry
    /// from the embedded `exp` claim.
    pub fn ingest_bearer(&self, key: &str, token: &str) -> Result<()> {
        let expires_at = bearer::expiry_claim(token)?;
        self.insert(key, token, expires_at);
        Ok(())
    }

    /// Store an opaque access token under `key`, expiring `expires_in_secs`
    /// seconds from now. The token content is not inspected.
    pub fn ingest_access(&self, key: &str, token: &str, expires_in_secs: u64) {
        let expires_at = self.clock.now() + expires_in_secs as f64;
        self.insert(key, token, expires_at);
    }

    /// Return the cached token for `key`, or fail with
    /// [`Error::AuthenticationFailed`] when it is missing or expired.
    pub fn get(&self, key: &str) -> Result<String> {
        self.lookup_valid(key)
            .ok_or_else(|| Error::AuthenticationFailed(key.to_owned()))
    }

    /// Return the cached token for `key`, invoking `refresh` when it is
    /// missing or expired.
    ///
    /// The refresh lock is held across the callback, so at most one refresh
    /// runs at a time in this store instance (single-flight across all
    /// keys). The refreshed credential is ingested under the key the
    /// callback resolved, which is also the key consulted for the final
    /// lookup; a mismatch with the requested key is logged, not fatal.
    pub fn get_or_refresh<F>(&self, key: &str, refresh: F) -> Result<String>
    where
        F: FnOnce() -> RefreshResult,
    {
        if let Some(token) = self.lookup_valid(key) {
            return Ok(token);
        }
        debug!(key, "token missing or expired, refreshing");

        let resolved = self.refresh_and_ingest(key, refresh)?;
        match self.lookup_valid(&resolved) {
            Some(token) => Ok(token),
            None => Err(Error::AuthenticationFailed(resolved)),
        }
    }

    /// Remove every entry.
    pub fn clear(&self) {
        debug!("clearing token cache");
        lock(&self.tokens).clear();
    }

    /// Run `refresh` under the global refresh lock and ingest its result,
    /// returning the key it resolved to. Shared with the persistent store's
    /// refresh path, which persists only after this succeeds.
    pub(crate) fn refresh_and_ingest<F>(&self, requested: &str, refresh: F) -> Result<String>
    where
        F: FnOnce() -> RefreshResult,
    {
        let _serialized = lock(&self.refresh_gate);
        let refreshed = refresh().map_err(Error::Refresh)?;
        self.ingest_refreshed(requested, refreshed)
    }

    /// Ingest a refresh callback's credential and return the key it resolved
    /// to.
    fn ingest_refreshed(&self, requested: &str, refreshed: Refreshed) -> Result<String> {
        let resolved = match refreshed {
            Refreshed::Bearer { key, token } => {
                self.ingest_bearer(&key, &token)?;
                key
            }
            Refreshed::Access {
                key,
                token,
                expires_in,
            } => {
                self.ingest_access(&key, &token, expires_in);
                key
            }
        };
        if resolved != requested {
            warn!(
                requested,
                resolved, "refresh returned a token for a different key than requested"
            );
        }
        Ok(resolved)
    }

    /// Valid-entry lookup under the store lock, evicting an expired entry.
    pub(crate) fn lookup_valid(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let mut tokens = lock(&self.tokens);
        match tokens.get(key) {
            Some(entry) if entry.is_expired(now) => {
                debug!(key, expires_at = entry.1, "evicting expired token");
                tokens.remove(key);
                None
            }
            Some(entry) => Some(entry.0.clone()),
            None => None,
        }
    }

    fn insert(&self, key: &str, token: &str, expires_at: f64) {
        debug!(key, expires_at, "storing token");
        lock(&self.tokens).insert(key.to_owned(), Entry(token.to_owned(), expires_at));
    }

    /// Copy of the whole map, for persistence.
    pub(crate) fn snapshot(&self) -> HashMap<String, Entry> {
        lock(&self.tokens).clone()
    }

    /// Replace the whole map, for reload from persistence.
    pub(crate) fn replace_all(&self, entries: HashMap<String, Entry>) {
        *lock(&self.tokens) = entries;
    }
}

impl Default for MemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}
