//! Background tasks: the intent-expiry sweeper and idempotency GC.

use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::PaymentCoordinator;
use crate::idempotency::IdempotencyStore;

/// Periodically expire awaiting intents past their gateway's TTL so stale
/// sessions cannot be confirmed later.
pub async fn run_expiry_sweeper(coordinator: Arc<PaymentCoordinator>, period: Duration) {
    tracing::info!("Starting intent expiry sweeper");

    let mut interval = tokio::time::interval(period);
    let mut tick_count: u64 = 0;

    loop {
        interval.tick().await;
        tick_count += 1;

        match coordinator.expire_stale_intents().await {
            Ok(count) if count > 0 => {
                tracing::info!("Sweeper tick {}: expired {} stale intents", tick_count, count);
            }
            Ok(_) => {
                if tick_count <= 3 || tick_count % 60 == 0 {
                    tracing::debug!("Sweeper tick {}: nothing to expire", tick_count);
                }
            }
            Err(e) => {
                tracing::error!("Sweeper tick {}: error expiring intents: {}", tick_count, e);
            }
        }
    }
}

/// Periodically drop idempotency records past the retention window and
/// reservations whose holder crashed past the lease.
pub async fn run_idempotency_gc(store: Arc<dyn IdempotencyStore>, period: Duration) {
    tracing::info!("Starting idempotency GC");

    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;

        match store.purge_expired().await {
            Ok(count) if count > 0 => {
                tracing::info!("Idempotency GC removed {} records", count);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("Idempotency GC error: {}", e);
            }
        }
    }
}
