//! Postgres-backed subscription store
//!
//! Schema lives under `migrations/`. The subscription row is the unit of
//! mutual exclusion: updates take a row lock and are conditional on the
//! optimistic `version` column, and the ledger insert rides in the same SQL
//! transaction as the subscription update.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::BillingInterval;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{Transaction, TransactionStatus, TransactionType};
use crate::store::SubscriptionStore;
use crate::subscription::{CancelReason, Subscription, SubscriptionState};

/// Row type mirroring the `subscriptions` table
#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    vendor_id: Uuid,
    plan_id: String,
    billing_interval: String,
    status: String,
    cancel_at_period_end: bool,
    pending_cancellation_at: Option<OffsetDateTime>,
    past_due_since: Option<OffsetDateTime>,
    cancel_reason: Option<String>,
    start_date: OffsetDateTime,
    end_date: OffsetDateTime,
    trial_end_date: Option<OffsetDateTime>,
    next_billing_date: Option<OffsetDateTime>,
    cancelled_at: Option<OffsetDateTime>,
    payment_method_id: Option<String>,
    gateway_customer_id: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    version: i64,
}

impl SubscriptionRow {
    fn into_subscription(self) -> BillingResult<Subscription> {
        let state = match self.status.as_str() {
            "trial" => SubscriptionState::Trial {
                ends: self.trial_end_date.ok_or_else(|| {
                    BillingError::Database(format!(
                        "trial subscription {} has no trial_end_date",
                        self.id
                    ))
                })?,
            },
            "active" if self.cancel_at_period_end => {
                SubscriptionState::ActivePendingCancellation {
                    at: self.pending_cancellation_at.unwrap_or(self.end_date),
                }
            }
            "active" => SubscriptionState::Active,
            "past_due" => SubscriptionState::PastDue {
                since: self.past_due_since.unwrap_or(self.updated_at),
            },
            "cancelled" => SubscriptionState::Cancelled {
                at: self.cancelled_at.unwrap_or(self.updated_at),
                reason: self
                    .cancel_reason
                    .as_deref()
                    .and_then(CancelReason::parse)
                    .unwrap_or(CancelReason::Requested),
            },
            other => {
                return Err(BillingError::Database(format!(
                    "subscription {} has unknown status '{}'",
                    self.id, other
                )))
            }
        };

        Ok(Subscription {
            id: self.id,
            vendor_id: self.vendor_id,
            plan_id: self.plan_id,
            billing_interval: BillingInterval::parse(&self.billing_interval)?,
            state,
            start_date: self.start_date,
            end_date: self.end_date,
            trial_end_date: self.trial_end_date,
            next_billing_date: self.next_billing_date,
            cancelled_at: self.cancelled_at,
            payment_method_id: self.payment_method_id,
            gateway_customer_id: self.gateway_customer_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            version: self.version,
        })
    }
}

/// Column values derived from the tagged state
struct StateColumns {
    status: &'static str,
    cancel_at_period_end: bool,
    pending_cancellation_at: Option<OffsetDateTime>,
    past_due_since: Option<OffsetDateTime>,
    cancel_reason: Option<&'static str>,
}

fn state_columns(state: &SubscriptionState) -> StateColumns {
    match *state {
        SubscriptionState::Trial { .. } => StateColumns {
            status: "trial",
            cancel_at_period_end: false,
            pending_cancellation_at: None,
            past_due_since: None,
            cancel_reason: None,
        },
        SubscriptionState::Active => StateColumns {
            status: "active",
            cancel_at_period_end: false,
            pending_cancellation_at: None,
            past_due_since: None,
            cancel_reason: None,
        },
        SubscriptionState::ActivePendingCancellation { at } => StateColumns {
            status: "active",
            cancel_at_period_end: true,
            pending_cancellation_at: Some(at),
            past_due_since: None,
            cancel_reason: None,
        },
        SubscriptionState::PastDue { since } => StateColumns {
            status: "past_due",
            cancel_at_period_end: false,
            pending_cancellation_at: None,
            past_due_since: Some(since),
            cancel_reason: None,
        },
        SubscriptionState::Cancelled { at: _, reason } => StateColumns {
            status: "cancelled",
            cancel_at_period_end: false,
            pending_cancellation_at: None,
            past_due_since: None,
            cancel_reason: Some(reason.as_str()),
        },
    }
}

/// Row type mirroring the `subscription_transactions` table
#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    subscription_id: Uuid,
    txn_type: String,
    amount_cents: i64,
    status: String,
    metadata: serde_json::Value,
    created_at: OffsetDateTime,
}

impl TransactionRow {
    fn into_transaction(self) -> BillingResult<Transaction> {
        let txn_type = TransactionType::parse(&self.txn_type).ok_or_else(|| {
            BillingError::Database(format!("unknown transaction type '{}'", self.txn_type))
        })?;
        let status = TransactionStatus::parse(&self.status).ok_or_else(|| {
            BillingError::Database(format!("unknown transaction status '{}'", self.status))
        })?;
        Ok(Transaction {
            id: self.id,
            subscription_id: self.subscription_id,
            txn_type,
            amount_cents: self.amount_cents,
            status,
            metadata: self.metadata,
            created_at: self.created_at,
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, vendor_id, plan_id, billing_interval, status, \
     cancel_at_period_end, pending_cancellation_at, past_due_since, cancel_reason, \
     start_date, end_date, trial_end_date, next_billing_date, cancelled_at, \
     payment_method_id, gateway_customer_id, created_at, updated_at, version";

/// Run the engine's schema migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!().run(pool).await
}

/// Postgres store
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_transaction_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        txn: &Transaction,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_transactions
                (id, subscription_id, txn_type, amount_cents, status, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(txn.id)
        .bind(txn.subscription_id)
        .bind(txn.txn_type.as_str())
        .bind(txn.amount_cents)
        .bind(txn.status.as_str())
        .bind(&txn.metadata)
        .bind(txn.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn upsert_subscription_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        subscription: &Subscription,
        expected_version: Option<i64>,
        new_version: i64,
    ) -> BillingResult<u64> {
        let cols = state_columns(&subscription.state);

        let rows_affected = match expected_version {
            None => sqlx::query(
                r#"
                INSERT INTO subscriptions
                    (id, vendor_id, plan_id, billing_interval, status,
                     cancel_at_period_end, pending_cancellation_at, past_due_since,
                     cancel_reason, start_date, end_date, trial_end_date,
                     next_billing_date, cancelled_at, payment_method_id,
                     gateway_customer_id, created_at, updated_at, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                        $13, $14, $15, $16, $17, NOW(), $18)
                "#,
            )
            .bind(subscription.id)
            .bind(subscription.vendor_id)
            .bind(&subscription.plan_id)
            .bind(subscription.billing_interval.as_str())
            .bind(cols.status)
            .bind(cols.cancel_at_period_end)
            .bind(cols.pending_cancellation_at)
            .bind(cols.past_due_since)
            .bind(cols.cancel_reason)
            .bind(subscription.start_date)
            .bind(subscription.end_date)
            .bind(subscription.trial_end_date)
            .bind(subscription.next_billing_date)
            .bind(subscription.cancelled_at)
            .bind(&subscription.payment_method_id)
            .bind(&subscription.gateway_customer_id)
            .bind(subscription.created_at)
            .bind(new_version)
            .execute(&mut **tx)
            .await?
            .rows_affected(),
            Some(expected) => sqlx::query(
                r#"
                UPDATE subscriptions SET
                    plan_id = $2,
                    billing_interval = $3,
                    status = $4,
                    cancel_at_period_end = $5,
                    pending_cancellation_at = $6,
                    past_due_since = $7,
                    cancel_reason = $8,
                    end_date = $9,
                    trial_end_date = $10,
                    next_billing_date = $11,
                    cancelled_at = $12,
                    payment_method_id = $13,
                    gateway_customer_id = $14,
                    updated_at = NOW(),
                    version = $15
                WHERE id = $1 AND version = $16
                "#,
            )
            .bind(subscription.id)
            .bind(&subscription.plan_id)
            .bind(subscription.billing_interval.as_str())
            .bind(cols.status)
            .bind(cols.cancel_at_period_end)
            .bind(cols.pending_cancellation_at)
            .bind(cols.past_due_since)
            .bind(cols.cancel_reason)
            .bind(subscription.end_date)
            .bind(subscription.trial_end_date)
            .bind(subscription.next_billing_date)
            .bind(subscription.cancelled_at)
            .bind(&subscription.payment_method_id)
            .bind(&subscription.gateway_customer_id)
            .bind(new_version)
            .bind(expected)
            .execute(&mut **tx)
            .await?
            .rows_affected(),
        };

        Ok(rows_affected)
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn insert_with_transaction(
        &self,
        subscription: &Subscription,
        txn: &Transaction,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_subscription_tx(&mut tx, subscription, None, subscription.version).await?;
        Self::insert_transaction_tx(&mut tx, txn).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> BillingResult<Subscription> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| BillingError::NotFound(format!("Subscription {} not found", id)))?
            .into_subscription()
    }

    async fn find_current_for_vendor(
        &self,
        vendor_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions \
             WHERE vendor_id = $1 AND status != 'cancelled' \
             ORDER BY created_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(vendor_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRow::into_subscription).transpose()
    }

    async fn update_with_transaction(
        &self,
        subscription: &Subscription,
        txn: &Transaction,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes the sweep, the reconciler and admin writers on
        // the same subscription.
        let locked: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM subscriptions WHERE id = $1 FOR UPDATE")
                .bind(subscription.id)
                .fetch_optional(&mut *tx)
                .await?;

        let current_version = locked
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription {} not found", subscription.id))
            })?
            .0;

        if current_version != subscription.version {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {} was modified by another process",
                subscription.id
            )));
        }

        let new_version = subscription.version + 1;
        let rows = Self::upsert_subscription_tx(
            &mut tx,
            subscription,
            Some(subscription.version),
            new_version,
        )
        .await?;
        if rows == 0 {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {} was modified by another process",
                subscription.id
            )));
        }

        Self::insert_transaction_tx(&mut tx, txn).await?;
        tx.commit().await?;

        let mut updated = subscription.clone();
        updated.version = new_version;
        updated.updated_at = OffsetDateTime::now_utc();
        Ok(updated)
    }

    async fn update(&self, subscription: &Subscription) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;
        let new_version = subscription.version + 1;
        let rows = Self::upsert_subscription_tx(
            &mut tx,
            subscription,
            Some(subscription.version),
            new_version,
        )
        .await?;
        if rows == 0 {
            return Err(BillingError::ConcurrentModification(format!(
                "subscription {} was modified by another process",
                subscription.id
            )));
        }
        tx.commit().await?;

        let mut updated = subscription.clone();
        updated.version = new_version;
        updated.updated_at = OffsetDateTime::now_utc();
        Ok(updated)
    }

    async fn append_transaction(&self, txn: &Transaction) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_transaction_tx(&mut tx, txn).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_due(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE status IN ('trial', 'active', 'past_due')
              AND cancel_at_period_end = false
              AND next_billing_date IS NOT NULL
              AND next_billing_date <= $1
              AND payment_method_id IS NOT NULL
            ORDER BY next_billing_date ASC
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(SubscriptionRow::into_subscription)
            .collect()
    }

    async fn find_pending_cancellation_expired(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE status = 'active'
              AND cancel_at_period_end = true
              AND pending_cancellation_at <= $1
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(SubscriptionRow::into_subscription)
            .collect()
    }

    async fn transactions_for(&self, subscription_id: Uuid) -> BillingResult<Vec<Transaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, txn_type, amount_cents, status, metadata, created_at
            FROM subscription_transactions
            WHERE subscription_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(TransactionRow::into_transaction)
            .collect()
    }

    async fn has_gateway_reference(
        &self,
        subscription_id: Uuid,
        reference: &str,
    ) -> BillingResult<bool> {
        let exists: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM subscription_transactions
            WHERE subscription_id = $1
              AND metadata->>'gateway_reference' = $2
            LIMIT 1
            "#,
        )
        .bind(subscription_id)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        Ok(exists.is_some())
    }

    async fn has_completed_billing_period(
        &self,
        subscription_id: Uuid,
        period_key: &str,
    ) -> BillingResult<bool> {
        let exists: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM subscription_transactions
            WHERE subscription_id = $1
              AND status = 'completed'
              AND metadata->>'billing_period' = $2
            LIMIT 1
            "#,
        )
        .bind(subscription_id)
        .bind(period_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(exists.is_some())
    }
}
