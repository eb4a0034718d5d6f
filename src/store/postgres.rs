//! Postgres ledger backend.
//!
//! All multi-row writes run in a single transaction so a crash leaves either
//! the pre- or post-state, never a partial one.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::idempotency::{IdempotencyStore, Reservation};
use crate::models::{ConfirmOutcome, Gateway, Invoice, Payment, PaymentIntent, RefundRequest};
use crate::store::{LedgerStore, StoreError};

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_unique_violation(e: sqlx::Error, what: &str) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(format!("{what} already recorded"))
        }
        _ => StoreError::Database(e),
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO invoices (id, total_minor, amount_paid_minor, currency, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(invoice.id)
        .bind(invoice.total_minor)
        .bind(invoice.amount_paid_minor)
        .bind(&invoice.currency)
        .bind(invoice.status)
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn invoice(&self, id: Uuid) -> Result<Option<Invoice>, StoreError> {
        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT id, total_minor, amount_paid_minor, currency, status, created_at, updated_at
            FROM invoices
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(invoice)
    }

    async fn payment(&self, id: Uuid) -> Result<Option<Payment>, StoreError> {
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT id, invoice_id, payment_intent_id, amount_minor, currency, gateway,
                   provider_txn_ref, status, refunded_minor, created_at
            FROM payments
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    async fn payments_for_invoice(&self, invoice_id: Uuid) -> Result<Vec<Payment>, StoreError> {
        let payments = sqlx::query_as::<_, Payment>(
            r#"
            SELECT id, invoice_id, payment_intent_id, amount_minor, currency, gateway,
                   provider_txn_ref, status, refunded_minor, created_at
            FROM payments
            WHERE invoice_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    async fn commit_payment(&self, payment: &Payment, invoice: &Invoice) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO payments
                (id, invoice_id, payment_intent_id, amount_minor, currency, gateway,
                 provider_txn_ref, status, refunded_minor, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(payment.id)
        .bind(payment.invoice_id)
        .bind(payment.payment_intent_id)
        .bind(payment.amount_minor)
        .bind(&payment.currency)
        .bind(payment.gateway)
        .bind(&payment.provider_txn_ref)
        .bind(payment.status)
        .bind(payment.refunded_minor)
        .bind(payment.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique_violation(e, "provider transaction"))?;

        sqlx::query(
            r#"
            UPDATE invoices
            SET amount_paid_minor = $2, status = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(invoice.id)
        .bind(invoice.amount_paid_minor)
        .bind(invoice.status)
        .bind(invoice.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn commit_refund(
        &self,
        refund: &RefundRequest,
        payment: &Payment,
        invoice: &Invoice,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO refund_requests
                (id, payment_id, amount_minor, reason, status, provider_refund_ref, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(refund.id)
        .bind(refund.payment_id)
        .bind(refund.amount_minor)
        .bind(&refund.reason)
        .bind(refund.status)
        .bind(&refund.provider_refund_ref)
        .bind(refund.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE payments
            SET status = $2, refunded_minor = $3
            WHERE id = $1
            "#,
        )
        .bind(payment.id)
        .bind(payment.status)
        .bind(payment.refunded_minor)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE invoices
            SET amount_paid_minor = $2, status = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(invoice.id)
        .bind(invoice.amount_paid_minor)
        .bind(invoice.status)
        .bind(invoice.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_refund(&self, refund: &RefundRequest) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO refund_requests
                (id, payment_id, amount_minor, reason, status, provider_refund_ref, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(refund.id)
        .bind(refund.payment_id)
        .bind(refund.amount_minor)
        .bind(&refund.reason)
        .bind(refund.status)
        .bind(&refund.provider_refund_ref)
        .bind(refund.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_intent(&self, intent: &PaymentIntent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO payment_intents
                (id, invoice_id, gateway, requested_minor, currency, status,
                 provider_session_ref, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(intent.id)
        .bind(intent.invoice_id)
        .bind(intent.gateway)
        .bind(intent.requested_minor)
        .bind(&intent.currency)
        .bind(intent.status)
        .bind(&intent.provider_session_ref)
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, "active payment intent"))?;
        Ok(())
    }

    async fn update_intent(&self, intent: &PaymentIntent) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE payment_intents
            SET status = $2, provider_session_ref = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(intent.id)
        .bind(intent.status)
        .bind(&intent.provider_session_ref)
        .bind(intent.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("payment intent"));
        }
        Ok(())
    }

    async fn intent(&self, id: Uuid) -> Result<Option<PaymentIntent>, StoreError> {
        let intent = sqlx::query_as::<_, PaymentIntent>(
            r#"
            SELECT id, invoice_id, gateway, requested_minor, currency, status,
                   provider_session_ref, created_at, updated_at
            FROM payment_intents
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(intent)
    }

    async fn intent_by_session(
        &self,
        gateway: Gateway,
        session_ref: &str,
    ) -> Result<Option<PaymentIntent>, StoreError> {
        let intent = sqlx::query_as::<_, PaymentIntent>(
            r#"
            SELECT id, invoice_id, gateway, requested_minor, currency, status,
                   provider_session_ref, created_at, updated_at
            FROM payment_intents
            WHERE gateway = $1 AND provider_session_ref = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(gateway)
        .bind(session_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(intent)
    }

    async fn active_intent(
        &self,
        invoice_id: Uuid,
        gateway: Gateway,
    ) -> Result<Option<PaymentIntent>, StoreError> {
        let intent = sqlx::query_as::<_, PaymentIntent>(
            r#"
            SELECT id, invoice_id, gateway, requested_minor, currency, status,
                   provider_session_ref, created_at, updated_at
            FROM payment_intents
            WHERE invoice_id = $1 AND gateway = $2
              AND status IN ('created', 'awaiting_confirmation')
            LIMIT 1
            "#,
        )
        .bind(invoice_id)
        .bind(gateway)
        .fetch_optional(&self.pool)
        .await?;
        Ok(intent)
    }

    async fn expire_intents_before(
        &self,
        gateway: Gateway,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PaymentIntent>, StoreError> {
        let expired = sqlx::query_as::<_, PaymentIntent>(
            r#"
            UPDATE payment_intents
            SET status = 'expired', updated_at = NOW()
            WHERE gateway = $1 AND status = 'awaiting_confirmation' AND created_at < $2
            RETURNING id, invoice_id, gateway, requested_minor, currency, status,
                      provider_session_ref, created_at, updated_at
            "#,
        )
        .bind(gateway)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(expired)
    }
}

/// Postgres idempotency store. The reservation is a conditional upsert: a
/// fresh key or a lapsed lease yields a row back (the caller holds the key),
/// anything else is resolved by reading the current record.
pub struct PgIdempotencyStore {
    pool: PgPool,
    lease: Duration,
    retention_days: i32,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool, lease: Duration, retention_days: i32) -> Self {
        Self {
            pool,
            lease,
            retention_days,
        }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn check_and_reserve(&self, key: &str) -> Result<Reservation, StoreError> {
        let reserved: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO payment_idempotency_keys (key, status, reserved_at)
            VALUES ($1, 'reserved', NOW())
            ON CONFLICT (key) DO UPDATE
            SET reserved_at = NOW()
            WHERE payment_idempotency_keys.status = 'reserved'
              AND payment_idempotency_keys.reserved_at < NOW() - make_interval(secs => $2)
            RETURNING key
            "#,
        )
        .bind(key)
        .bind(self.lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        if reserved.is_some() {
            return Ok(Reservation::New);
        }

        let row: Option<(String, Option<serde_json::Value>)> = sqlx::query_as(
            r#"
            SELECT status, result_snapshot
            FROM payment_idempotency_keys
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((status, Some(snapshot))) if status == "committed" => {
                let outcome: ConfirmOutcome = serde_json::from_value(snapshot).map_err(|e| {
                    StoreError::Conflict(format!("invalid idempotency snapshot: {e}"))
                })?;
                Ok(Reservation::Completed(outcome))
            }
            // Reserved by a live holder, or deleted between the two
            // statements; the caller polls and retries either way.
            _ => Ok(Reservation::InFlight),
        }
    }

    async fn commit(&self, key: &str, outcome: &ConfirmOutcome) -> Result<(), StoreError> {
        let snapshot = serde_json::to_value(outcome)
            .map_err(|e| StoreError::Conflict(format!("unserializable outcome: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO payment_idempotency_keys (key, status, reserved_at, committed_at, result_snapshot)
            VALUES ($1, 'committed', NOW(), NOW(), $2)
            ON CONFLICT (key) DO UPDATE
            SET status = 'committed', committed_at = NOW(), result_snapshot = EXCLUDED.result_snapshot
            "#,
        )
        .bind(key)
        .bind(snapshot)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM payment_idempotency_keys
            WHERE key = $1 AND status = 'reserved'
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM payment_idempotency_keys
            WHERE (status = 'committed' AND committed_at < NOW() - make_interval(days => $1))
               OR (status = 'reserved' AND reserved_at < NOW() - make_interval(secs => $2))
            "#,
        )
        .bind(self.retention_days)
        .bind(self.lease.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}
