//! Reserve/commit idempotency store.
//!
//! Confirmation events (client verify calls and provider webhooks, each
//! multiplied by provider retries) are deduplicated by a stable key. The
//! first caller to reserve a key runs reconciliation and commits the outcome
//! snapshot; every later caller replays the snapshot verbatim. A reservation
//! whose holder crashed is released after a lease timeout so a retry can
//! proceed instead of the key staying locked forever.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::models::{ConfirmOutcome, Gateway};
use crate::store::StoreError;

/// Canonical key guarding Payment creation for one provider transaction.
pub fn confirmation_key(gateway: Gateway, provider_txn_ref: &str) -> String {
    format!("{}:{}", gateway.as_str(), provider_txn_ref)
}

#[derive(Debug, Clone)]
pub enum Reservation {
    /// The caller now holds the key and must `commit` or `release` it.
    New,
    /// Another holder is processing this key and its lease is still live.
    InFlight,
    /// The key was processed before; the snapshot is returned verbatim.
    Completed(ConfirmOutcome),
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomic test-and-set. Takes over reservations whose lease has lapsed.
    async fn check_and_reserve(&self, key: &str) -> Result<Reservation, StoreError>;

    /// Record the outcome snapshot. The record is never mutated afterwards.
    async fn commit(&self, key: &str, outcome: &ConfirmOutcome) -> Result<(), StoreError>;

    /// Drop an uncommitted reservation (processing failed terminally).
    /// Committed records are not touched.
    async fn release(&self, key: &str) -> Result<(), StoreError>;

    /// Drop committed records past the retention window and reservations
    /// past their lease. Returns the number of entries removed.
    async fn purge_expired(&self) -> Result<usize, StoreError>;
}

enum Entry {
    Reserved {
        reserved_at: Instant,
    },
    Committed {
        outcome: ConfirmOutcome,
        first_seen_at: DateTime<Utc>,
    },
}

/// In-memory idempotency store, the dev/test default.
pub struct MemoryIdempotencyStore {
    entries: Mutex<HashMap<String, Entry>>,
    lease: Duration,
    retention: chrono::Duration,
}

impl MemoryIdempotencyStore {
    pub fn new(lease: Duration, retention: chrono::Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            lease,
            retention,
        }
    }
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), chrono::Duration::days(30))
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn check_and_reserve(&self, key: &str) -> Result<Reservation, StoreError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(Entry::Committed { outcome, .. }) => {
                return Ok(Reservation::Completed(outcome.clone()));
            }
            Some(Entry::Reserved { reserved_at }) if reserved_at.elapsed() < self.lease => {
                return Ok(Reservation::InFlight);
            }
            // Fresh key, or a reservation whose holder crashed or stalled
            // past the lease: take it over.
            _ => {}
        }
        entries.insert(
            key.to_string(),
            Entry::Reserved {
                reserved_at: Instant::now(),
            },
        );
        Ok(Reservation::New)
    }

    async fn commit(&self, key: &str, outcome: &ConfirmOutcome) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry::Committed {
                outcome: outcome.clone(),
                first_seen_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        if let Some(Entry::Reserved { .. }) = entries.get(key) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - self.retention;
        let lease = self.lease;
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| match entry {
            Entry::Committed { first_seen_at, .. } => *first_seen_at > cutoff,
            Entry::Reserved { reserved_at } => reserved_at.elapsed() < lease,
        });
        Ok(before - entries.len())
    }
}
