//! In-memory backup store for upstream responses.
//!
//! Entries are immutable [`StoredResponse`] snapshots shared through `Arc`.
//! A single reader/writer lock guards the table; every operation is a pure
//! in-memory map access and the lock is never held across an `.await`.
//!
//! Expiry is lazy: [`Store::get`] never returns an expired entry, but the
//! entry stays in the table until it is overwritten or removed by
//! [`Store::purge_expired`].  There is no capacity bound.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

// ---------------------------------------------------------------------------
// StoredResponse
// ---------------------------------------------------------------------------

/// Snapshot of a successful upstream reply kept for failover.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub status: StatusCode,
    /// Response headers with hop-by-hop headers already removed.
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Wall-clock time of storage, reported in `X-Backup-Saved-At`.
    pub saved_at: DateTime<Utc>,
    /// Monotonic expiry.  `None` never expires.
    pub expires_at: Option<Instant>,
}

impl StoredResponse {
    /// Build a snapshot stamped with the current time.  A zero `ttl` means
    /// the entry never expires.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes, ttl: Duration) -> Self {
        Self {
            status,
            headers,
            body,
            saved_at: Utc::now(),
            expires_at: expiry_for(ttl),
        }
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) => now >= at,
            None => false,
        }
    }

    /// Approximate footprint: body plus header names and values.
    fn approx_bytes(&self) -> u64 {
        let names: usize = self.headers.keys().map(|k| k.as_str().len()).sum();
        let values: usize = self.headers.values().map(|v| v.as_bytes().len()).sum();
        (self.body.len() + names + values) as u64
    }
}

fn expiry_for(ttl: Duration) -> Option<Instant> {
    if ttl.is_zero() {
        None
    } else {
        Instant::now().checked_add(ttl)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Store {
    entries: RwLock<HashMap<String, Arc<StoredResponse>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for `key` unless it is missing or expired.
    pub fn get(&self, key: &str) -> Option<Arc<StoredResponse>> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<Arc<StoredResponse>> {
        let entries = self.read();
        let entry = entries.get(key)?;
        if entry.is_expired_at(now) {
            return None;
        }
        Some(Arc::clone(entry))
    }

    /// Insert or replace the entry for `key`.  The last writer wins.
    pub fn set(&self, key: impl Into<String>, value: StoredResponse) {
        self.write().insert(key.into(), Arc::new(value));
    }

    /// Number of entries held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Approximate memory held by keys, bodies and headers, in bytes.
    pub fn memory_usage(&self) -> u64 {
        self.read()
            .iter()
            .map(|(key, entry)| key.len() as u64 + entry.approx_bytes())
            .sum()
    }

    /// Drop every expired entry.  Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        before - entries.len()
    }

    // The table only ever holds complete `Arc` values, so a panic in another
    // holder cannot leave it half-written; recover from poisoning.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<StoredResponse>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<StoredResponse>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Periodically remove expired entries.  Runs until the task is aborted.
pub async fn run_sweeper(store: Arc<Store>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let removed = store.purge_expired();
        if removed > 0 {
            debug!(removed, remaining = store.len(), "swept expired backup entries");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
